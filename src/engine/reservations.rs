use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use ulid::Ulid;

use crate::limits::{MAX_BATCH_SIZE, MAX_NAME_LEN};
use crate::model::*;
use crate::observability::{status_label, COUNTER_FAILURES_TOTAL, RESERVATIONS_TOTAL};

use super::conflict::sessions_collide;
use super::{check_len, require_actor, Engine, EngineError};

fn record(op: &'static str, result: &Result<impl Sized, EngineError>) {
    metrics::counter!(RESERVATIONS_TOTAL, "op" => op, "status" => status_label(result)).increment(1);
}

impl Engine {
    // ── Create ───────────────────────────────────────────────

    pub async fn create_reservation(
        &self,
        new: NewReservation,
        actor: &str,
    ) -> Result<Reservation, EngineError> {
        let result = self.create_reservation_inner(new, actor).await;
        record("create", &result);
        result
    }

    async fn create_reservation_inner(
        &self,
        new: NewReservation,
        actor: &str,
    ) -> Result<Reservation, EngineError> {
        require_actor(actor)?;
        check_len(&new.name, MAX_NAME_LEN, "reservation name too long")?;
        let _gate = self.write_gate.read().await;

        self.ensure_exists(Entity::User, new.user_id).await?;
        let session = self.get_session(new.session_id).await?;
        if let Some(membership_id) = new.membership_id
            && !self.store.contains_membership(&membership_id)
        {
            return Err(EngineError::not_found(Entity::Membership, membership_id));
        }

        let user_lock = self.user_lock(new.user_id);
        let _user = user_lock.lock().await;
        self.check_double_booking(new.user_id, &session, None).await?;

        let now = Utc::now();
        let reservation = Reservation {
            id: Ulid::new(),
            name: new.name,
            reservation_time: new.reservation_time,
            state: new.state,
            last_modification: now,
            user_id: new.user_id,
            session_id: new.session_id,
            membership_id: new.membership_id,
            audit: Audit::new(actor, now),
        };
        self.wal_append(&Event::ReservationCreated {
            reservation: reservation.clone(),
        })
        .await?;
        self.store.insert_reservation(reservation.clone());

        if reservation.is_confirmed() {
            self.bump_session(reservation.session_id, 1, actor).await;
            self.bump_membership(reservation.membership_id, 1, actor).await;
        }
        tracing::info!(
            "reservation {} {} for user {} on session {}",
            reservation.id,
            reservation.state.as_str(),
            reservation.user_id,
            reservation.session_id
        );
        Ok(reservation)
    }

    /// Fails with `Conflict` if `user_id` holds a CONFIRMED reservation on a
    /// different session overlapping `target` on the same date. The caller
    /// holds the user's lock.
    async fn check_double_booking(
        &self,
        user_id: Ulid,
        target: &Session,
        skip_reservation: Option<Ulid>,
    ) -> Result<(), EngineError> {
        for (id, shared) in self.store.reservation_entries() {
            if Some(id) == skip_reservation {
                continue;
            }
            let (session_id, confirmed, owner) = {
                let r = shared.read().await;
                (r.session_id, r.is_confirmed(), r.user_id)
            };
            if owner != user_id || !confirmed || session_id == target.id {
                continue;
            }
            let Some(other) = self.store.session(&session_id) else {
                continue;
            };
            let other = other.read().await;
            if !other.deleted && sessions_collide(&other, target) {
                return Err(EngineError::Conflict {
                    user_id,
                    reservation_id: id,
                    session_id,
                });
            }
        }
        Ok(())
    }

    // ── Update ───────────────────────────────────────────────

    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        actor: &str,
    ) -> Result<Reservation, EngineError> {
        let result = self.update_reservation_inner(id, patch, actor).await;
        record("update", &result);
        result
    }

    /// Counter effects depend only on the confirmed-ness of the old and new
    /// state plus any change of session or membership.
    async fn update_reservation_inner(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        actor: &str,
    ) -> Result<Reservation, EngineError> {
        require_actor(actor)?;
        if let Some(name) = &patch.name {
            check_len(name, MAX_NAME_LEN, "reservation name too long")?;
        }
        let _gate = self.write_gate.read().await;

        if let Some(user_id) = patch.user_id {
            self.ensure_exists(Entity::User, user_id).await?;
        }
        if let Some(session_id) = patch.session_id {
            self.get_session(session_id).await?;
        }
        if let Some(membership_id) = patch.membership_id
            && !self.store.contains_membership(&membership_id)
        {
            return Err(EngineError::not_found(Entity::Membership, membership_id));
        }

        let shared = self
            .store
            .reservation(&id)
            .ok_or(EngineError::not_found(Entity::Reservation, id))?;

        // The double-booking scan reads other rows, so it runs without this
        // row's write lock; the row is re-checked afterwards and the update
        // retried if it moved underneath us.
        loop {
            let old = shared.read().await.clone();
            let owner = patch.user_id.unwrap_or(old.user_id);
            let user_lock = self.user_lock(owner);
            let _user = user_lock.lock().await;

            let now = Utc::now();
            let mut next = old.clone();
            if let Some(name) = patch.name.clone() {
                next.name = name;
            }
            if let Some(time) = patch.reservation_time {
                next.reservation_time = time;
            }
            if let Some(state) = patch.state {
                next.state = state;
            }
            if let Some(user_id) = patch.user_id {
                next.user_id = user_id;
            }
            if let Some(session_id) = patch.session_id {
                next.session_id = session_id;
            }
            if let Some(membership_id) = patch.membership_id {
                next.membership_id = Some(membership_id);
            }
            next.last_modification = now;
            next.audit = Audit::new(actor, now);

            let newly_placed = !old.is_confirmed()
                || old.session_id != next.session_id
                || old.user_id != next.user_id;
            if next.is_confirmed() && newly_placed {
                let target = self.get_session(next.session_id).await?;
                self.check_double_booking(next.user_id, &target, Some(id)).await?;
            }

            let mut guard = shared.write().await;
            if !self.store.contains_reservation(&id) {
                return Err(EngineError::not_found(Entity::Reservation, id));
            }
            if *guard != old {
                continue;
            }

            self.wal_append(&Event::ReservationUpdated {
                reservation: next.clone(),
            })
            .await?;
            *guard = next.clone();

            self.apply_transition(&old, &next, actor).await;
            return Ok(next);
        }
    }

    async fn apply_transition(&self, old: &Reservation, next: &Reservation, actor: &str) {
        match (old.is_confirmed(), next.is_confirmed()) {
            (true, false) => {
                self.bump_session(old.session_id, -1, actor).await;
                self.bump_membership(old.membership_id, -1, actor).await;
            }
            (false, true) => {
                self.bump_session(next.session_id, 1, actor).await;
                self.bump_membership(next.membership_id, 1, actor).await;
            }
            (true, true) => {
                if old.session_id != next.session_id {
                    self.bump_session(old.session_id, -1, actor).await;
                    self.bump_session(next.session_id, 1, actor).await;
                }
                if old.membership_id != next.membership_id {
                    self.bump_membership(old.membership_id, -1, actor).await;
                    self.bump_membership(next.membership_id, 1, actor).await;
                }
            }
            (false, false) => {}
        }
    }

    // ── Delete ───────────────────────────────────────────────

    pub async fn delete_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let result = self.remove_reservation(id).await;
        record("delete", &result);
        result
    }

    /// Deletes each id in order. Failures are logged and reported as skipped.
    pub async fn bulk_delete_reservations(&self, ids: &[Ulid]) -> Result<BulkDeleteReport, EngineError> {
        if ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let _gate = self.write_gate.read().await;
        let mut report = BulkDeleteReport::default();
        for &id in ids {
            let result = self.remove_reservation(id).await;
            record("delete", &result);
            match result {
                Ok(()) => report.deleted.push(id),
                Err(e) => {
                    tracing::warn!("bulk delete skipped reservation {id}: {e}");
                    report.skipped.push(id);
                }
            }
        }
        Ok(report)
    }

    async fn remove_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let shared = self
            .store
            .reservation(&id)
            .ok_or(EngineError::not_found(Entity::Reservation, id))?;
        let guard = shared.write().await;
        if !self.store.contains_reservation(&id) {
            return Err(EngineError::not_found(Entity::Reservation, id));
        }
        self.wal_append(&Event::ReservationDeleted { id }).await?;
        self.store.remove_reservation(&id);

        if guard.is_confirmed() {
            self.bump_session(guard.session_id, -1, SYSTEM_ACTOR).await;
            self.bump_membership(guard.membership_id, -1, SYSTEM_ACTOR).await;
        }
        tracing::info!("reservation {id} deleted");
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let shared = self
            .store
            .reservation(&id)
            .ok_or(EngineError::not_found(Entity::Reservation, id))?;
        Ok(shared.read().await.clone())
    }

    pub async fn fetch_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let mut out = Vec::new();
        for shared in self.store.all_reservations() {
            let r = shared.read().await;
            if (filter.user_ids.is_empty() || filter.user_ids.contains(&r.user_id))
                && (filter.session_ids.is_empty() || filter.session_ids.contains(&r.session_id))
                && (filter.states.is_empty() || filter.states.contains(&r.state))
            {
                out.push(r.clone());
            }
        }
        out.sort_by_key(|r| (r.reservation_time, r.id));
        out
    }

    /// CONFIRMED reservations on sessions held on `date`, earliest first.
    pub async fn reminders_for(&self, date: NaiveDate) -> Vec<Reminder> {
        let sessions: HashMap<Ulid, Session> = self
            .session_snapshots()
            .await
            .into_iter()
            .filter(|s| !s.deleted && s.date == date)
            .map(|s| (s.id, s))
            .collect();

        let mut out = Vec::new();
        for shared in self.store.all_reservations() {
            let r = shared.read().await;
            if !r.is_confirmed() {
                continue;
            }
            let Some(session) = sessions.get(&r.session_id) else {
                continue;
            };
            out.push(Reminder {
                reservation_id: r.id,
                user_id: r.user_id,
                reservation_name: r.name.clone(),
                session_title: session.title.clone(),
                date: session.date,
                start_time: session.start_time,
                session_link: session.session_link.clone(),
                location_id: session.location_id,
            });
        }
        out.sort_by_key(|r| (r.start_time, r.reservation_id));
        out
    }

    // ── Secondary counter writes ─────────────────────────────

    async fn bump_session(&self, session_id: Ulid, delta: i64, actor: &str) {
        if let Err(e) = self.adjust_registered_count(session_id, delta, actor).await {
            tracing::warn!("registered_count adjustment {delta:+} on session {session_id} failed: {e}");
            metrics::counter!(COUNTER_FAILURES_TOTAL, "counter" => "registered_count").increment(1);
        }
    }

    async fn bump_membership(&self, membership_id: Option<Ulid>, delta: i64, actor: &str) {
        let Some(membership_id) = membership_id else {
            return;
        };
        if let Err(e) = self
            .adjust_reservations_used_locked(membership_id, delta, actor)
            .await
        {
            tracing::warn!(
                "reservations_used adjustment {delta:+} on membership {membership_id} failed: {e}"
            );
            metrics::counter!(COUNTER_FAILURES_TOTAL, "counter" => "reservations_used").increment(1);
        }
    }
}
