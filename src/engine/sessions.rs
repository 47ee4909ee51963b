use chrono::{NaiveDate, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_busy_slots, find_conflicts};
use super::{apply_delta, check_len, require_actor, Engine, EngineError};

fn validate_window(start: chrono::NaiveTime, end: chrono::NaiveTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::Validation(format!(
            "session must start before it ends ({start} >= {end})"
        )));
    }
    Ok(())
}

fn validate_fields(title: &str, link: Option<&str>, capacity: u32) -> Result<(), EngineError> {
    check_len(title, MAX_NAME_LEN, "session title too long")?;
    if let Some(link) = link {
        check_len(link, MAX_LINK_LEN, "session link too long")?;
    }
    if capacity > MAX_SESSION_CAPACITY {
        return Err(EngineError::LimitExceeded("session capacity too large"));
    }
    Ok(())
}

impl Engine {
    async fn validate_new_session(&self, new: &NewSession) -> Result<(), EngineError> {
        validate_fields(&new.title, new.session_link.as_deref(), new.capacity)?;
        validate_window(new.start_time, new.end_time)?;
        self.ensure_exists(Entity::Professional, new.professional_id).await?;
        if let Some(location_id) = new.location_id {
            self.ensure_exists(Entity::Location, location_id).await?;
        }
        Ok(())
    }

    async fn insert_new_session(&self, new: NewSession, actor: &str) -> Result<Session, EngineError> {
        let session = Session {
            id: Ulid::new(),
            title: new.title,
            date: new.date,
            start_time: new.start_time,
            end_time: new.end_time,
            state: SessionState::Scheduled,
            capacity: new.capacity,
            registered_count: 0,
            session_link: new.session_link,
            professional_id: new.professional_id,
            location_id: new.location_id,
            community_service_id: new.community_service_id,
            deleted: false,
            audit: Audit::new(actor, Utc::now()),
        };
        self.wal_append(&Event::SessionCreated {
            session: session.clone(),
        })
        .await?;
        self.store.insert_session(session.clone());
        Ok(session)
    }

    /// New sessions always start SCHEDULED with nobody registered.
    pub async fn create_session(&self, new: NewSession, actor: &str) -> Result<Session, EngineError> {
        require_actor(actor)?;
        let _gate = self.write_gate.read().await;
        self.validate_new_session(&new).await?;
        let session = self.insert_new_session(new, actor).await?;
        tracing::info!("session {} scheduled on {} by {actor}", session.id, session.date);
        Ok(session)
    }

    /// Validates every entry before creating any of them.
    pub async fn bulk_create_sessions(
        &self,
        batch: Vec<NewSession>,
        actor: &str,
    ) -> Result<Vec<Session>, EngineError> {
        require_actor(actor)?;
        if batch.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let _gate = self.write_gate.read().await;
        for new in &batch {
            self.validate_new_session(new).await?;
        }
        let mut created = Vec::with_capacity(batch.len());
        for new in batch {
            created.push(self.insert_new_session(new, actor).await?);
        }
        Ok(created)
    }

    /// A session that exists and has not been deleted.
    pub async fn get_session(&self, id: Ulid) -> Result<Session, EngineError> {
        let shared = self
            .store
            .session(&id)
            .ok_or(EngineError::not_found(Entity::Session, id))?;
        let session = shared.read().await.clone();
        if session.deleted {
            return Err(EngineError::not_found(Entity::Session, id));
        }
        Ok(session)
    }

    /// Apply the supplied fields. `registered_count` is writable here for
    /// operator corrections; reservation bookkeeping goes through
    /// `adjust_registered_count` instead.
    pub async fn update_session(
        &self,
        id: Ulid,
        patch: SessionPatch,
        actor: &str,
    ) -> Result<Session, EngineError> {
        require_actor(actor)?;
        let _gate = self.write_gate.read().await;
        if let Some(professional_id) = patch.professional_id {
            self.ensure_exists(Entity::Professional, professional_id).await?;
        }
        if let Some(Some(location_id)) = patch.location_id {
            self.ensure_exists(Entity::Location, location_id).await?;
        }

        let shared = self
            .store
            .session(&id)
            .ok_or(EngineError::not_found(Entity::Session, id))?;
        let mut guard = shared.write().await;
        if guard.deleted {
            return Err(EngineError::not_found(Entity::Session, id));
        }

        let mut next = guard.clone();
        if let Some(title) = patch.title {
            next.title = title;
        }
        if let Some(date) = patch.date {
            next.date = date;
        }
        if let Some(start) = patch.start_time {
            next.start_time = start;
        }
        if let Some(end) = patch.end_time {
            next.end_time = end;
        }
        if let Some(state) = patch.state {
            next.state = state;
        }
        if let Some(count) = patch.registered_count {
            next.registered_count = count;
        }
        if let Some(capacity) = patch.capacity {
            next.capacity = capacity;
        }
        if let Some(link) = patch.session_link {
            next.session_link = Some(link);
        }
        if let Some(professional_id) = patch.professional_id {
            next.professional_id = professional_id;
        }
        if let Some(location_id) = patch.location_id {
            next.location_id = location_id;
        }
        if let Some(community_service_id) = patch.community_service_id {
            next.community_service_id = Some(community_service_id);
        }
        validate_fields(&next.title, next.session_link.as_deref(), next.capacity)?;
        validate_window(next.start_time, next.end_time)?;
        next.audit = Audit::new(actor, Utc::now());

        self.wal_append(&Event::SessionUpdated {
            session: next.clone(),
        })
        .await?;
        *guard = next.clone();
        Ok(next)
    }

    /// Soft delete. Reservations pointing at the session are left alone.
    pub async fn delete_session(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        self.soft_delete_session(id).await
    }

    async fn soft_delete_session(&self, id: Ulid) -> Result<(), EngineError> {
        let shared = self
            .store
            .session(&id)
            .ok_or(EngineError::not_found(Entity::Session, id))?;
        let mut guard = shared.write().await;
        if guard.deleted {
            return Err(EngineError::not_found(Entity::Session, id));
        }
        let audit = Audit::new(SYSTEM_ACTOR, Utc::now());
        self.wal_append(&Event::SessionDeleted {
            id,
            audit: audit.clone(),
        })
        .await?;
        guard.deleted = true;
        guard.audit = audit;
        tracing::info!("session {id} deleted");
        Ok(())
    }

    /// All ids must refer to live sessions; otherwise nothing is deleted.
    pub async fn bulk_delete_sessions(&self, ids: &[Ulid]) -> Result<(), EngineError> {
        if ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let _gate = self.write_gate.read().await;
        for id in ids {
            self.get_session(*id).await?;
        }
        for id in ids {
            self.soft_delete_session(*id).await?;
        }
        Ok(())
    }

    pub async fn fetch_sessions(&self, filter: &SessionFilter) -> Vec<Session> {
        let mut out: Vec<Session> = self
            .session_snapshots()
            .await
            .into_iter()
            .filter(|s| {
                !s.deleted
                    && (filter.professional_ids.is_empty()
                        || filter.professional_ids.contains(&s.professional_id))
                    && (filter.location_ids.is_empty()
                        || s.location_id.is_some_and(|l| filter.location_ids.contains(&l)))
                    && (filter.states.is_empty() || filter.states.contains(&s.state))
            })
            .collect();
        out.sort_by_key(|s| (s.date, s.start_time, s.id));
        out
    }

    pub(super) async fn session_snapshots(&self) -> Vec<Session> {
        let mut out = Vec::new();
        for shared in self.store.all_sessions() {
            out.push(shared.read().await.clone());
        }
        out
    }

    /// Conflicts for a proposed slot against every session on record.
    pub async fn check_conflicts(
        &self,
        candidate: &ConflictCandidate,
        exclude_session_id: Option<Ulid>,
    ) -> Result<ConflictResult, EngineError> {
        validate_window(candidate.window.start, candidate.window.end)?;
        let sessions = self.session_snapshots().await;
        Ok(find_conflicts(&sessions, candidate, exclude_session_id))
    }

    pub async fn get_availability(&self, date: NaiveDate, filter: &ResourceFilter) -> AvailabilityResult {
        let sessions = self.session_snapshots().await;
        let busy_slots = find_busy_slots(&sessions, date, filter);
        AvailabilityResult {
            is_available: busy_slots.is_empty(),
            busy_slots,
        }
    }

    /// Adjust `registered_count` by `delta` (floored at zero) while holding the
    /// session's write lock. Returns the new value.
    pub(super) async fn adjust_registered_count(
        &self,
        session_id: Ulid,
        delta: i64,
        actor: &str,
    ) -> Result<u32, EngineError> {
        let shared = self
            .store
            .session(&session_id)
            .ok_or(EngineError::not_found(Entity::Session, session_id))?;
        let mut guard = shared.write().await;
        let next = apply_delta(guard.registered_count, delta);
        if next == guard.registered_count {
            return Ok(next);
        }
        let audit = Audit::new(actor, Utc::now());
        self.wal_append(&Event::RegisteredCountSet {
            session_id,
            registered_count: next,
            audit: audit.clone(),
        })
        .await?;
        guard.registered_count = next;
        guard.audit = audit;
        Ok(next)
    }
}
