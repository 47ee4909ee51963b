use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::*;
use crate::observability::{COUNTER_FAILURES_TOTAL, MEMBERSHIPS_EXPIRED_TOTAL};

use super::{apply_delta, check_len, require_actor, Engine, EngineError};

impl Engine {
    pub async fn create_membership(
        &self,
        new: NewMembership,
        actor: &str,
    ) -> Result<Membership, EngineError> {
        require_actor(actor)?;
        check_len(&new.description, MAX_NAME_LEN, "membership description too long")?;
        if new.end_date < new.start_date {
            return Err(EngineError::Validation("membership ends before it starts".into()));
        }
        let _gate = self.write_gate.read().await;
        self.ensure_exists(Entity::User, new.user_id).await?;
        self.ensure_exists(Entity::Community, new.community_id).await?;
        self.ensure_exists(Entity::Plan, new.plan_id).await?;

        let membership = Membership {
            id: Ulid::new(),
            description: new.description,
            status: new.status,
            start_date: new.start_date,
            end_date: new.end_date,
            reservations_used: new.reservations_used,
            community_id: new.community_id,
            user_id: new.user_id,
            plan_id: new.plan_id,
            audit: Audit::new(actor, Utc::now()),
        };
        self.wal_append(&Event::MembershipCreated {
            membership: membership.clone(),
        })
        .await?;
        self.store.insert_membership(membership.clone());
        tracing::info!("membership {} created for user {}", membership.id, membership.user_id);
        Ok(membership)
    }

    pub async fn get_membership(&self, id: Ulid) -> Result<Membership, EngineError> {
        let shared = self
            .store
            .membership(&id)
            .ok_or(EngineError::not_found(Entity::Membership, id))?;
        Ok(shared.read().await.clone())
    }

    /// All memberships, or one user's, ordered by start date.
    pub async fn fetch_memberships(&self, user_id: Option<Ulid>) -> Vec<Membership> {
        let mut out = Vec::new();
        for shared in self.store.all_memberships() {
            let m = shared.read().await;
            if user_id.is_none_or(|u| u == m.user_id) {
                out.push(m.clone());
            }
        }
        out.sort_by_key(|m| (m.start_date, m.id));
        out
    }

    /// Suspension history, oldest first.
    pub async fn suspensions_for(&self, membership_id: Ulid) -> Result<Vec<MembershipSuspension>, EngineError> {
        if !self.store.contains_membership(&membership_id) {
            return Err(EngineError::not_found(Entity::Membership, membership_id));
        }
        let mut out = self.store.suspensions_for(&membership_id);
        out.sort_by_key(|s| (s.suspended_at, s.id));
        Ok(out)
    }

    pub async fn update_membership(
        &self,
        id: Ulid,
        patch: MembershipPatch,
        actor: &str,
    ) -> Result<Membership, EngineError> {
        self.update_membership_at(id, patch, actor, Utc::now()).await
    }

    /// Partial update with suspension side effects evaluated at `now`.
    ///
    /// ACTIVE → SUSPENDED opens a suspension. SUSPENDED → ACTIVE closes the
    /// latest open suspension and pushes `end_date` out by the time spent
    /// suspended, in the same record as the status change. Suspension writes
    /// are secondary: a failure is logged and the status change stands.
    pub async fn update_membership_at(
        &self,
        id: Ulid,
        patch: MembershipPatch,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Membership, EngineError> {
        require_actor(actor)?;
        if let Some(description) = &patch.description {
            check_len(description, MAX_NAME_LEN, "membership description too long")?;
        }
        let _gate = self.write_gate.read().await;
        if let Some(user_id) = patch.user_id {
            self.ensure_exists(Entity::User, user_id).await?;
        }
        if let Some(community_id) = patch.community_id {
            self.ensure_exists(Entity::Community, community_id).await?;
        }
        if let Some(plan_id) = patch.plan_id {
            self.ensure_exists(Entity::Plan, plan_id).await?;
        }

        let shared = self
            .store
            .membership(&id)
            .ok_or(EngineError::not_found(Entity::Membership, id))?;
        let mut guard = shared.write().await;

        let old_status = guard.status;
        let mut next = guard.clone();
        if let Some(description) = patch.description {
            next.description = description;
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(start_date) = patch.start_date {
            next.start_date = start_date;
        }
        if let Some(end_date) = patch.end_date {
            next.end_date = end_date;
        }
        if let Some(community_id) = patch.community_id {
            next.community_id = community_id;
        }
        if let Some(user_id) = patch.user_id {
            next.user_id = user_id;
        }
        if let Some(plan_id) = patch.plan_id {
            next.plan_id = plan_id;
        }
        next.audit = Audit::new(actor, now);

        let opening = old_status == MembershipStatus::Active && next.status == MembershipStatus::Suspended;
        let resuming = old_status == MembershipStatus::Suspended && next.status == MembershipStatus::Active;

        let closing = if resuming {
            self.store.latest_open_suspension(&id)
        } else {
            None
        };
        if let Some(open) = &closing {
            next.end_date += now - open.suspended_at;
        }

        self.wal_append(&Event::MembershipUpdated {
            membership: next.clone(),
        })
        .await?;
        *guard = next.clone();

        if opening {
            self.open_suspension(id, now).await;
        }
        if let Some(open) = closing {
            self.close_suspension(open, now).await;
        }
        Ok(next)
    }

    async fn open_suspension(&self, membership_id: Ulid, now: DateTime<Utc>) {
        let suspension = MembershipSuspension {
            id: Ulid::new(),
            membership_id,
            suspended_at: now,
            resumed_at: None,
        };
        match self
            .wal_append(&Event::SuspensionOpened {
                suspension: suspension.clone(),
            })
            .await
        {
            Ok(()) => {
                tracing::info!("membership {membership_id} suspended");
                self.store.insert_suspension(suspension);
            }
            Err(e) => {
                tracing::warn!("failed to record suspension for membership {membership_id}: {e}");
                metrics::counter!(COUNTER_FAILURES_TOTAL, "counter" => "suspension").increment(1);
            }
        }
    }

    async fn close_suspension(&self, open: MembershipSuspension, now: DateTime<Utc>) {
        let result = self
            .wal_append(&Event::SuspensionClosed {
                id: open.id,
                membership_id: open.membership_id,
                resumed_at: now,
            })
            .await;
        match result {
            Ok(()) => {
                tracing::info!("membership {} resumed", open.membership_id);
                self.store.close_suspension(&open.id, now);
            }
            Err(e) => {
                tracing::warn!("failed to close suspension {}: {e}", open.id);
                metrics::counter!(COUNTER_FAILURES_TOTAL, "counter" => "suspension").increment(1);
            }
        }
    }

    /// Add `delta` to the membership's quota usage, floored at zero. Untracked
    /// (unlimited) memberships are left alone and yield `None`.
    pub async fn adjust_reservations_used(
        &self,
        membership_id: Ulid,
        delta: i64,
        actor: &str,
    ) -> Result<Option<u32>, EngineError> {
        require_actor(actor)?;
        let _gate = self.write_gate.read().await;
        self.adjust_reservations_used_locked(membership_id, delta, actor).await
    }

    /// Caller holds the write gate.
    pub(super) async fn adjust_reservations_used_locked(
        &self,
        membership_id: Ulid,
        delta: i64,
        actor: &str,
    ) -> Result<Option<u32>, EngineError> {
        let shared = self
            .store
            .membership(&membership_id)
            .ok_or(EngineError::not_found(Entity::Membership, membership_id))?;
        let mut guard = shared.write().await;
        let Some(current) = guard.reservations_used else {
            return Ok(None);
        };
        let next = apply_delta(current, delta);
        if next == current {
            return Ok(Some(next));
        }
        let audit = Audit::new(actor, Utc::now());
        self.wal_append(&Event::ReservationsUsedSet {
            membership_id,
            reservations_used: next,
            audit: audit.clone(),
        })
        .await?;
        guard.reservations_used = Some(next);
        guard.audit = audit;
        Ok(Some(next))
    }

    /// Move every ACTIVE membership whose end date has passed to EXPIRED.
    pub async fn expire_memberships(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut expired = 0;
        for shared in self.store.all_memberships() {
            let mut guard = shared.write().await;
            if guard.status != MembershipStatus::Active || guard.end_date >= now {
                continue;
            }
            let mut next = guard.clone();
            next.status = MembershipStatus::Expired;
            next.audit = Audit::new(SYSTEM_ACTOR, now);
            self.wal_append(&Event::MembershipUpdated {
                membership: next.clone(),
            })
            .await?;
            tracing::info!("membership {} expired", next.id);
            *guard = next;
            expired += 1;
        }
        metrics::counter!(MEMBERSHIPS_EXPIRED_TOTAL).increment(expired as u64);
        Ok(expired)
    }
}
