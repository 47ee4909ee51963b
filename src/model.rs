use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identity recorded on audit fields when the engine acts on its own behalf.
pub const SYSTEM_ACTOR: &str = "SYSTEM";

/// Half-open time-of-day window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Unchecked; callers validate with `is_valid`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && self.end > other.start
    }
}

/// Entity kinds the engine refers to, both owned and external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Entity {
    User,
    Professional,
    Location,
    Community,
    Plan,
    Session,
    Reservation,
    Membership,
    Suspension,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::User => "user",
            Entity::Professional => "professional",
            Entity::Location => "location",
            Entity::Community => "community",
            Entity::Plan => "plan",
            Entity::Session => "session",
            Entity::Reservation => "reservation",
            Entity::Membership => "membership",
            Entity::Suspension => "membership suspension",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── States ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Scheduled,
    Ongoing,
    Completed,
    Cancelled,
    Rescheduled,
}

impl SessionState {
    /// Cancelled and completed sessions never block a time slot.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, SessionState::Cancelled | SessionState::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Confirmed,
    Anulled,
    Cancelled,
    /// Terminal state set by operators after attendance; never assigned by the engine.
    Done,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Confirmed => "CONFIRMED",
            ReservationState::Anulled => "ANULLED",
            ReservationState::Cancelled => "CANCELLED",
            ReservationState::Done => "DONE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    Active,
    Suspended,
    Expired,
    Cancelled,
}

// ── Entities ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

impl Audit {
    pub fn new(updated_by: &str, at: DateTime<Utc>) -> Self {
        Self {
            updated_by: updated_by.to_string(),
            updated_at: at,
        }
    }
}

/// A bookable time slot owned by a professional, optionally at a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub title: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub state: SessionState,
    pub capacity: u32,
    /// Count of CONFIRMED reservations. Only the reservation engine and the
    /// reconciler write this.
    pub registered_count: u32,
    pub session_link: Option<String>,
    pub professional_id: Ulid,
    /// `None` means a virtual session.
    pub location_id: Option<Ulid>,
    pub community_service_id: Option<Ulid>,
    pub deleted: bool,
    pub audit: Audit,
}

impl Session {
    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.start_time,
            end: self.end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub name: String,
    pub reservation_time: DateTime<Utc>,
    pub state: ReservationState,
    pub last_modification: DateTime<Utc>,
    pub user_id: Ulid,
    pub session_id: Ulid,
    pub membership_id: Option<Ulid>,
    pub audit: Audit,
}

impl Reservation {
    pub fn is_confirmed(&self) -> bool {
        self.state == ReservationState::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Ulid,
    pub description: String,
    pub status: MembershipStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// `None` means unlimited quota; the counter is never initialized then.
    pub reservations_used: Option<u32>,
    pub community_id: Ulid,
    pub user_id: Ulid,
    pub plan_id: Ulid,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSuspension {
    pub id: Ulid,
    pub membership_id: Ulid,
    pub suspended_at: DateTime<Utc>,
    pub resumed_at: Option<DateTime<Utc>>,
}

impl MembershipSuspension {
    pub fn is_open(&self) -> bool {
        self.resumed_at.is_none()
    }
}

// ── Inputs ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewSession {
    pub title: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub capacity: u32,
    pub session_link: Option<String>,
    pub professional_id: Ulid,
    pub location_id: Option<Ulid>,
    pub community_service_id: Option<Ulid>,
}

/// Partial session update. `None` leaves a field untouched; for
/// `location_id`, `Some(None)` detaches the location.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub state: Option<SessionState>,
    pub registered_count: Option<u32>,
    pub capacity: Option<u32>,
    pub session_link: Option<String>,
    pub professional_id: Option<Ulid>,
    pub location_id: Option<Option<Ulid>>,
    pub community_service_id: Option<Ulid>,
}

#[derive(Debug, Clone)]
pub struct NewReservation {
    pub name: String,
    pub reservation_time: DateTime<Utc>,
    pub state: ReservationState,
    pub user_id: Ulid,
    pub session_id: Ulid,
    pub membership_id: Option<Ulid>,
}

#[derive(Debug, Clone, Default)]
pub struct ReservationPatch {
    pub name: Option<String>,
    pub reservation_time: Option<DateTime<Utc>>,
    pub state: Option<ReservationState>,
    pub user_id: Option<Ulid>,
    pub session_id: Option<Ulid>,
    pub membership_id: Option<Ulid>,
}

#[derive(Debug, Clone)]
pub struct NewMembership {
    pub description: String,
    pub status: MembershipStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub reservations_used: Option<u32>,
    pub community_id: Ulid,
    pub user_id: Ulid,
    pub plan_id: Ulid,
}

#[derive(Debug, Clone, Default)]
pub struct MembershipPatch {
    pub description: Option<String>,
    pub status: Option<MembershipStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub community_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub plan_id: Option<Ulid>,
}

/// Empty lists mean "no restriction" on that dimension.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub professional_ids: Vec<Ulid>,
    pub location_ids: Vec<Ulid>,
    pub states: Vec<SessionState>,
}

/// Empty lists mean "no restriction" on that dimension.
#[derive(Debug, Clone, Default)]
pub struct ReservationFilter {
    pub user_ids: Vec<Ulid>,
    pub session_ids: Vec<Ulid>,
    pub states: Vec<ReservationState>,
}

// ── Query results ───────────────────────────────────────────────

/// A proposed session slot to test against the existing schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictCandidate {
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub professional_id: Ulid,
    pub location_id: Option<Ulid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictResult {
    pub has_conflict: bool,
    pub professional_conflicts: Vec<Session>,
    pub location_conflicts: Vec<Session>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub professional_id: Option<Ulid>,
    pub location_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Professional,
    Location,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Professional => "professional",
            ResourceKind::Location => "location",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusySlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub title: String,
    pub resource_type: ResourceKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityResult {
    pub is_available: bool,
    pub busy_slots: Vec<BusySlot>,
}

#[derive(Debug, Default)]
pub struct BulkDeleteReport {
    pub deleted: Vec<Ulid>,
    pub skipped: Vec<Ulid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub sessions_corrected: usize,
    pub memberships_corrected: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.sessions_corrected == 0 && self.memberships_corrected == 0
    }
}

/// Everything a reminder sweep needs about one confirmed booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub reservation_id: Ulid,
    pub user_id: Ulid,
    pub reservation_name: String,
    pub session_title: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub session_link: Option<String>,
    pub location_id: Option<Ulid>,
}

// ── Journal records ─────────────────────────────────────────────

/// Journal events, one per record. Entity events carry the
/// full after-image so replay never needs to merge partial updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionDeleted {
        id: Ulid,
        audit: Audit,
    },
    RegisteredCountSet {
        session_id: Ulid,
        registered_count: u32,
        audit: Audit,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        reservation: Reservation,
    },
    ReservationDeleted {
        id: Ulid,
    },
    MembershipCreated {
        membership: Membership,
    },
    MembershipUpdated {
        membership: Membership,
    },
    ReservationsUsedSet {
        membership_id: Ulid,
        reservations_used: u32,
        audit: Audit,
    },
    SuspensionOpened {
        suspension: MembershipSuspension,
    },
    SuspensionClosed {
        id: Ulid,
        membership_id: Ulid,
        resumed_at: DateTime<Utc>,
    },
}
