use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedSession = Arc<RwLock<Session>>;
pub type SharedReservation = Arc<RwLock<Reservation>>;
pub type SharedMembership = Arc<RwLock<Membership>>;

fn shared<T>(value: T) -> Arc<RwLock<T>> {
    Arc::new(RwLock::new(value))
}

/// Plain owned state, used while replaying the journal before anything is shared.
#[derive(Default)]
struct ReplayState {
    sessions: HashMap<Ulid, Session>,
    reservations: HashMap<Ulid, Reservation>,
    memberships: HashMap<Ulid, Membership>,
    suspensions: HashMap<Ulid, MembershipSuspension>,
}

impl ReplayState {
    fn apply(&mut self, event: Event) {
        match event {
            Event::SessionCreated { session } | Event::SessionUpdated { session } => {
                self.sessions.insert(session.id, session);
            }
            Event::SessionDeleted { id, audit } => {
                if let Some(s) = self.sessions.get_mut(&id) {
                    s.deleted = true;
                    s.audit = audit;
                }
            }
            Event::RegisteredCountSet {
                session_id,
                registered_count,
                audit,
            } => {
                if let Some(s) = self.sessions.get_mut(&session_id) {
                    s.registered_count = registered_count;
                    s.audit = audit;
                }
            }
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                self.reservations.insert(reservation.id, reservation);
            }
            Event::ReservationDeleted { id } => {
                self.reservations.remove(&id);
            }
            Event::MembershipCreated { membership } | Event::MembershipUpdated { membership } => {
                self.memberships.insert(membership.id, membership);
            }
            Event::ReservationsUsedSet {
                membership_id,
                reservations_used,
                audit,
            } => {
                if let Some(m) = self.memberships.get_mut(&membership_id) {
                    m.reservations_used = Some(reservations_used);
                    m.audit = audit;
                }
            }
            Event::SuspensionOpened { suspension } => {
                self.suspensions.insert(suspension.id, suspension);
            }
            Event::SuspensionClosed { id, resumed_at, .. } => {
                if let Some(s) = self.suspensions.get_mut(&id) {
                    s.resumed_at = Some(resumed_at);
                }
            }
        }
    }
}

/// In-memory tables for everything the engine owns.
///
/// Sessions, reservations and memberships sit behind per-row locks so counter
/// adjustments are serialized per row. Suspensions are append-mostly and
/// stored by value.
pub struct Store {
    sessions: DashMap<Ulid, SharedSession>,
    reservations: DashMap<Ulid, SharedReservation>,
    memberships: DashMap<Ulid, SharedMembership>,
    suspensions: DashMap<Ulid, MembershipSuspension>,
    /// membership id → suspension ids, in insertion order.
    suspensions_by_membership: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            reservations: DashMap::new(),
            memberships: DashMap::new(),
            suspensions: DashMap::new(),
            suspensions_by_membership: DashMap::new(),
        }
    }

    /// Rebuild the tables from journal events in append order.
    pub fn from_events(events: Vec<Event>) -> Self {
        let mut state = ReplayState::default();
        for event in events {
            state.apply(event);
        }

        let store = Self::new();
        for (id, s) in state.sessions {
            store.sessions.insert(id, shared(s));
        }
        for (id, r) in state.reservations {
            store.reservations.insert(id, shared(r));
        }
        for (id, m) in state.memberships {
            store.memberships.insert(id, shared(m));
        }
        let mut suspensions: Vec<MembershipSuspension> = state.suspensions.into_values().collect();
        suspensions.sort_by_key(|s| (s.suspended_at, s.id));
        for s in suspensions {
            store.insert_suspension(s);
        }
        store
    }

    // ── Sessions ─────────────────────────────────────────────

    pub fn session(&self, id: &Ulid) -> Option<SharedSession> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn insert_session(&self, session: Session) {
        self.sessions.insert(session.id, shared(session));
    }

    pub fn all_sessions(&self) -> Vec<SharedSession> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn reservation(&self, id: &Ulid) -> Option<SharedReservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    pub fn contains_reservation(&self, id: &Ulid) -> bool {
        self.reservations.contains_key(id)
    }

    pub fn insert_reservation(&self, reservation: Reservation) {
        self.reservations.insert(reservation.id, shared(reservation));
    }

    pub fn remove_reservation(&self, id: &Ulid) {
        self.reservations.remove(id);
    }

    pub fn all_reservations(&self) -> Vec<SharedReservation> {
        self.reservations.iter().map(|e| e.value().clone()).collect()
    }

    /// Like `all_reservations`, keyed so callers can skip a row they already
    /// hold locked.
    pub fn reservation_entries(&self) -> Vec<(Ulid, SharedReservation)> {
        self.reservations
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    // ── Memberships ──────────────────────────────────────────

    pub fn membership(&self, id: &Ulid) -> Option<SharedMembership> {
        self.memberships.get(id).map(|e| e.value().clone())
    }

    pub fn contains_membership(&self, id: &Ulid) -> bool {
        self.memberships.contains_key(id)
    }

    pub fn insert_membership(&self, membership: Membership) {
        self.memberships.insert(membership.id, shared(membership));
    }

    pub fn all_memberships(&self) -> Vec<SharedMembership> {
        self.memberships.iter().map(|e| e.value().clone()).collect()
    }

    // ── Suspensions ──────────────────────────────────────────

    pub fn insert_suspension(&self, suspension: MembershipSuspension) {
        self.suspensions_by_membership
            .entry(suspension.membership_id)
            .or_default()
            .push(suspension.id);
        self.suspensions.insert(suspension.id, suspension);
    }

    pub fn close_suspension(&self, id: &Ulid, resumed_at: chrono::DateTime<chrono::Utc>) {
        if let Some(mut s) = self.suspensions.get_mut(id) {
            s.resumed_at = Some(resumed_at);
        }
    }

    pub fn suspensions_for(&self, membership_id: &Ulid) -> Vec<MembershipSuspension> {
        let ids = self
            .suspensions_by_membership
            .get(membership_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.suspensions.get(id).map(|e| e.value().clone()))
            .collect()
    }

    /// The unresumed suspension with the latest `suspended_at`, if any.
    pub fn latest_open_suspension(&self, membership_id: &Ulid) -> Option<MembershipSuspension> {
        self.suspensions_for(membership_id)
            .into_iter()
            .filter(MembershipSuspension::is_open)
            .max_by_key(|s| s.suspended_at)
    }

    pub fn all_suspensions(&self) -> Vec<MembershipSuspension> {
        self.suspensions.iter().map(|e| e.value().clone()).collect()
    }
}
