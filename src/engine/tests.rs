use super::*;
use crate::directory::InMemoryDirectory;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::atomic::Ordering;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn utc(month: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, d, 0, 0, 0).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("seatwise_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// An engine over a fresh journal with one professional, location, community
/// and plan already known to the directory.
struct Fixture {
    engine: Engine,
    dir: Arc<InMemoryDirectory>,
    path: PathBuf,
    professional: Ulid,
    location: Ulid,
    community: Ulid,
    plan: Ulid,
}

impl Fixture {
    fn new(name: &str) -> Self {
        let path = test_wal_path(name);
        let dir = Arc::new(InMemoryDirectory::new());
        let professional = Ulid::new();
        let location = Ulid::new();
        let community = Ulid::new();
        let plan = Ulid::new();
        dir.register(Entity::Professional, professional);
        dir.register(Entity::Location, location);
        dir.register(Entity::Community, community);
        dir.register(Entity::Plan, plan);
        let engine = Engine::new(path.clone(), dir.clone()).unwrap();
        Self {
            engine,
            dir,
            path,
            professional,
            location,
            community,
            plan,
        }
    }

    fn reopen(self) -> Self {
        let engine = Engine::new(self.path.clone(), self.dir.clone()).unwrap();
        Self { engine, ..self }
    }

    fn user(&self) -> Ulid {
        let id = Ulid::new();
        self.dir.register(Entity::User, id);
        id
    }

    fn new_session(&self, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> NewSession {
        NewSession {
            title: "Hatha yoga".into(),
            date,
            start_time: start,
            end_time: end,
            capacity: 12,
            session_link: None,
            professional_id: self.professional,
            location_id: Some(self.location),
            community_service_id: None,
        }
    }

    async fn session(&self, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Session {
        self.engine
            .create_session(self.new_session(date, start, end), "admin")
            .await
            .unwrap()
    }

    async fn membership(&self, user_id: Ulid, reservations_used: Option<u32>) -> Membership {
        self.engine
            .create_membership(
                NewMembership {
                    description: "Monthly".into(),
                    status: MembershipStatus::Active,
                    start_date: utc(1, 1),
                    end_date: utc(2, 1),
                    reservations_used,
                    community_id: self.community,
                    user_id,
                    plan_id: self.plan,
                },
                "admin",
            )
            .await
            .unwrap()
    }

    async fn book_as(
        &self,
        user_id: Ulid,
        session_id: Ulid,
        membership_id: Option<Ulid>,
        state: ReservationState,
    ) -> Result<Reservation, EngineError> {
        self.engine
            .create_reservation(
                NewReservation {
                    name: "Front row".into(),
                    reservation_time: Utc::now(),
                    state,
                    user_id,
                    session_id,
                    membership_id,
                },
                "member",
            )
            .await
    }

    async fn book(&self, user_id: Ulid, session_id: Ulid, membership_id: Option<Ulid>) -> Result<Reservation, EngineError> {
        self.book_as(user_id, session_id, membership_id, ReservationState::Confirmed)
            .await
    }

    async fn registered(&self, session_id: Ulid) -> u32 {
        self.engine
            .store
            .session(&session_id)
            .unwrap()
            .read()
            .await
            .registered_count
    }

    async fn used(&self, membership_id: Ulid) -> Option<u32> {
        self.engine.get_membership(membership_id).await.unwrap().reservations_used
    }

    async fn set_state(&self, reservation_id: Ulid, state: ReservationState) -> Reservation {
        self.engine
            .update_reservation(
                reservation_id,
                ReservationPatch {
                    state: Some(state),
                    ..Default::default()
                },
                "member",
            )
            .await
            .unwrap()
    }
}

// ── Sessions ─────────────────────────────────────────────

#[tokio::test]
async fn new_session_is_scheduled_and_empty() {
    let fx = Fixture::new("session_defaults.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    assert_eq!(s.state, SessionState::Scheduled);
    assert_eq!(s.registered_count, 0);
    assert!(!s.deleted);
    assert_eq!(s.audit.updated_by, "admin");
    assert_eq!(fx.engine.get_session(s.id).await.unwrap(), s);
}

#[tokio::test]
async fn session_requires_actor_and_ordered_window() {
    let fx = Fixture::new("session_validation.wal");
    let err = fx
        .engine
        .create_session(fx.new_session(day(10), t(10, 0), t(11, 0)), "  ")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = fx
        .engine
        .create_session(fx.new_session(day(10), t(11, 0), t(11, 0)), "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let mut huge = fx.new_session(day(10), t(10, 0), t(11, 0));
    huge.capacity = crate::limits::MAX_SESSION_CAPACITY + 1;
    let err = fx.engine.create_session(huge, "admin").await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn session_needs_known_professional_and_location() {
    let fx = Fixture::new("session_refs.wal");
    let mut new = fx.new_session(day(10), t(10, 0), t(11, 0));
    new.professional_id = Ulid::new();
    let err = fx.engine.create_session(new, "admin").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotFound {
            entity: Entity::Professional,
            ..
        }
    ));

    let mut new = fx.new_session(day(10), t(10, 0), t(11, 0));
    new.location_id = Some(Ulid::new());
    let err = fx.engine.create_session(new, "admin").await.unwrap_err();
    assert_eq!(err.code(), "LOCAL_ERROR_001");

    let mut virtual_session = fx.new_session(day(10), t(10, 0), t(11, 0));
    virtual_session.location_id = None;
    assert!(fx.engine.create_session(virtual_session, "admin").await.is_ok());
}

#[tokio::test]
async fn update_session_applies_only_supplied_fields() {
    let fx = Fixture::new("session_update.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;

    let updated = fx
        .engine
        .update_session(
            s.id,
            SessionPatch {
                title: Some("Vinyasa".into()),
                registered_count: Some(3),
                location_id: Some(None),
                ..Default::default()
            },
            "coordinator",
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "Vinyasa");
    assert_eq!(updated.registered_count, 3);
    assert_eq!(updated.location_id, None);
    assert_eq!(updated.start_time, s.start_time);
    assert_eq!(updated.capacity, s.capacity);
    assert_eq!(updated.audit.updated_by, "coordinator");

    let err = fx
        .engine
        .update_session(
            s.id,
            SessionPatch {
                end_time: Some(t(9, 0)),
                ..Default::default()
            },
            "coordinator",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(fx.engine.get_session(s.id).await.unwrap().end_time, t(11, 0));
}

#[tokio::test]
async fn delete_session_is_soft_and_leaves_reservations() {
    let fx = Fixture::new("session_delete.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let r = fx.book(fx.user(), s.id, None).await.unwrap();

    fx.engine.delete_session(s.id).await.unwrap();
    assert!(matches!(
        fx.engine.get_session(s.id).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(fx.engine.fetch_sessions(&SessionFilter::default()).await.is_empty());
    assert_eq!(fx.engine.get_reservation(r.id).await.unwrap(), r);

    let stored = fx.engine.store.session(&s.id).unwrap();
    assert_eq!(stored.read().await.audit.updated_by, SYSTEM_ACTOR);

    assert!(fx.engine.delete_session(s.id).await.is_err());
}

#[tokio::test]
async fn bulk_create_sessions_validates_before_creating() {
    let fx = Fixture::new("session_bulk_create.wal");
    let batch = vec![
        fx.new_session(day(10), t(9, 0), t(10, 0)),
        fx.new_session(day(10), t(12, 0), t(11, 0)),
    ];
    assert!(fx.engine.bulk_create_sessions(batch, "admin").await.is_err());
    assert!(fx.engine.fetch_sessions(&SessionFilter::default()).await.is_empty());

    let batch = vec![
        fx.new_session(day(10), t(9, 0), t(10, 0)),
        fx.new_session(day(11), t(9, 0), t(10, 0)),
    ];
    let created = fx.engine.bulk_create_sessions(batch, "admin").await.unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(fx.engine.fetch_sessions(&SessionFilter::default()).await.len(), 2);
}

#[tokio::test]
async fn bulk_delete_sessions_is_all_or_nothing() {
    let fx = Fixture::new("session_bulk_delete.wal");
    let a = fx.session(day(10), t(9, 0), t(10, 0)).await;
    let b = fx.session(day(11), t(9, 0), t(10, 0)).await;

    let err = fx
        .engine
        .bulk_delete_sessions(&[a.id, Ulid::new()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(fx.engine.get_session(a.id).await.is_ok());

    fx.engine.bulk_delete_sessions(&[a.id, b.id]).await.unwrap();
    assert!(fx.engine.fetch_sessions(&SessionFilter::default()).await.is_empty());
}

#[tokio::test]
async fn fetch_sessions_filters_by_each_dimension() {
    let fx = Fixture::new("session_fetch.wal");
    let other_pro = Ulid::new();
    fx.dir.register(Entity::Professional, other_pro);

    let mine = fx.session(day(10), t(9, 0), t(10, 0)).await;
    let mut theirs = fx.new_session(day(10), t(9, 0), t(10, 0));
    theirs.professional_id = other_pro;
    theirs.location_id = None;
    let theirs = fx.engine.create_session(theirs, "admin").await.unwrap();
    fx.engine
        .update_session(
            theirs.id,
            SessionPatch {
                state: Some(SessionState::Cancelled),
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap();

    let by_pro = fx
        .engine
        .fetch_sessions(&SessionFilter {
            professional_ids: vec![fx.professional],
            ..Default::default()
        })
        .await;
    assert_eq!(by_pro.iter().map(|s| s.id).collect::<Vec<_>>(), vec![mine.id]);

    let by_location = fx
        .engine
        .fetch_sessions(&SessionFilter {
            location_ids: vec![fx.location],
            ..Default::default()
        })
        .await;
    assert_eq!(by_location.len(), 1);

    let cancelled = fx
        .engine
        .fetch_sessions(&SessionFilter {
            states: vec![SessionState::Cancelled],
            ..Default::default()
        })
        .await;
    assert_eq!(cancelled.iter().map(|s| s.id).collect::<Vec<_>>(), vec![theirs.id]);
}

#[tokio::test]
async fn conflicts_and_availability_from_engine() {
    let fx = Fixture::new("session_conflicts.wal");
    let a = fx.session(day(10), t(10, 0), t(11, 0)).await;

    let touching = ConflictCandidate {
        date: day(10),
        window: TimeWindow::new(t(11, 0), t(12, 0)),
        professional_id: fx.professional,
        location_id: None,
    };
    assert!(!fx.engine.check_conflicts(&touching, None).await.unwrap().has_conflict);

    let overlapping = ConflictCandidate {
        window: TimeWindow::new(t(10, 30), t(11, 30)),
        location_id: Some(fx.location),
        ..touching
    };
    let result = fx.engine.check_conflicts(&overlapping, None).await.unwrap();
    assert!(result.has_conflict);
    assert_eq!(result.professional_conflicts[0].id, a.id);
    assert_eq!(result.location_conflicts[0].id, a.id);
    assert!(!fx.engine.check_conflicts(&overlapping, Some(a.id)).await.unwrap().has_conflict);

    let inverted = ConflictCandidate {
        window: TimeWindow::new(t(12, 0), t(11, 0)),
        ..touching
    };
    assert!(!inverted.window.is_valid());
    let err = fx.engine.check_conflicts(&inverted, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let filter = ResourceFilter {
        professional_id: Some(fx.professional),
        location_id: None,
    };
    let busy = fx.engine.get_availability(day(10), &filter).await;
    assert!(!busy.is_available);
    assert_eq!(busy.busy_slots.len(), 1);
    assert_eq!(busy.busy_slots[0].title, "Hatha yoga");
    let free = fx.engine.get_availability(day(11), &filter).await;
    assert!(free.is_available);
}

// ── Reservation counters ─────────────────────────────────

#[tokio::test]
async fn confirmed_creations_count_on_session() {
    let fx = Fixture::new("res_count.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    for _ in 0..5 {
        fx.book(fx.user(), s.id, None).await.unwrap();
    }
    assert_eq!(fx.registered(s.id).await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirmed_creations_lose_no_increments() {
    let fx = Arc::new(Fixture::new("res_concurrent.wal"));
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let owner = fx.user();
    let m = fx.membership(owner, Some(0)).await;

    let (session_id, membership_id) = (s.id, m.id);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let fx = fx.clone();
        let user = fx.user();
        handles.push(tokio::spawn(async move {
            fx.book(user, session_id, Some(membership_id)).await.unwrap();
        }));
    }
    for h in futures::future::join_all(handles).await {
        h.unwrap();
    }

    assert_eq!(fx.registered(s.id).await, 50);
    assert_eq!(fx.used(m.id).await, Some(50));
}

#[tokio::test]
async fn pending_states_do_not_count() {
    let fx = Fixture::new("res_not_confirmed.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, Some(0)).await;
    fx.book_as(user, s.id, Some(m.id), ReservationState::Anulled)
        .await
        .unwrap();
    assert_eq!(fx.registered(s.id).await, 0);
    assert_eq!(fx.used(m.id).await, Some(0));
}

#[tokio::test]
async fn cancel_then_reconfirm_restores_counters() {
    let fx = Fixture::new("res_cycle.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, Some(2)).await;
    let r = fx.book(user, s.id, Some(m.id)).await.unwrap();
    assert_eq!(fx.registered(s.id).await, 1);
    assert_eq!(fx.used(m.id).await, Some(3));

    fx.set_state(r.id, ReservationState::Cancelled).await;
    assert_eq!(fx.registered(s.id).await, 0);
    assert_eq!(fx.used(m.id).await, Some(2));

    fx.set_state(r.id, ReservationState::Confirmed).await;
    assert_eq!(fx.registered(s.id).await, 1);
    assert_eq!(fx.used(m.id).await, Some(3));

    // Confirmed to confirmed on the same membership is a no-op.
    fx.set_state(r.id, ReservationState::Confirmed).await;
    assert_eq!(fx.used(m.id).await, Some(3));
}

#[tokio::test]
async fn unlimited_membership_stays_untracked() {
    let fx = Fixture::new("res_unlimited.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, None).await;
    let r = fx.book(user, s.id, Some(m.id)).await.unwrap();
    fx.set_state(r.id, ReservationState::Cancelled).await;
    fx.set_state(r.id, ReservationState::Confirmed).await;
    fx.engine.delete_reservation(r.id).await.unwrap();
    assert_eq!(fx.used(m.id).await, None);
    assert_eq!(
        fx.engine.adjust_reservations_used(m.id, 1, "admin").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn quota_usage_floors_at_zero() {
    let fx = Fixture::new("res_floor.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, Some(0)).await;
    let r = fx.book(user, s.id, Some(m.id)).await.unwrap();
    assert_eq!(
        fx.engine.adjust_reservations_used(m.id, -1, "admin").await.unwrap(),
        Some(0)
    );

    fx.engine.delete_reservation(r.id).await.unwrap();
    assert_eq!(fx.used(m.id).await, Some(0));
    assert_eq!(fx.registered(s.id).await, 0);
}

#[tokio::test]
async fn switching_membership_moves_usage() {
    let fx = Fixture::new("res_switch_membership.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let a = fx.membership(user, Some(0)).await;
    let b = fx.membership(user, Some(4)).await;
    let r = fx.book(user, s.id, Some(a.id)).await.unwrap();

    fx.engine
        .update_reservation(
            r.id,
            ReservationPatch {
                membership_id: Some(b.id),
                ..Default::default()
            },
            "member",
        )
        .await
        .unwrap();
    assert_eq!(fx.used(a.id).await, Some(0));
    assert_eq!(fx.used(b.id).await, Some(5));
    assert_eq!(fx.registered(s.id).await, 1);
}

#[tokio::test]
async fn moving_confirmed_reservation_moves_headcount() {
    let fx = Fixture::new("res_move_session.wal");
    let morning = fx.session(day(10), t(9, 0), t(10, 0)).await;
    let evening = fx.session(day(10), t(18, 0), t(19, 0)).await;
    let r = fx.book(fx.user(), morning.id, None).await.unwrap();

    let moved = fx
        .engine
        .update_reservation(
            r.id,
            ReservationPatch {
                session_id: Some(evening.id),
                ..Default::default()
            },
            "member",
        )
        .await
        .unwrap();
    assert_eq!(moved.session_id, evening.id);
    assert_eq!(fx.registered(morning.id).await, 0);
    assert_eq!(fx.registered(evening.id).await, 1);
}

#[tokio::test]
async fn delete_reservation_releases_counters_as_system() {
    let fx = Fixture::new("res_delete.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, Some(0)).await;
    let r = fx.book(user, s.id, Some(m.id)).await.unwrap();

    fx.engine.delete_reservation(r.id).await.unwrap();
    assert_eq!(fx.registered(s.id).await, 0);
    let membership = fx.engine.get_membership(m.id).await.unwrap();
    assert_eq!(membership.reservations_used, Some(0));
    assert_eq!(membership.audit.updated_by, SYSTEM_ACTOR);
    assert!(matches!(
        fx.engine.delete_reservation(r.id).await,
        Err(EngineError::NotFound {
            entity: Entity::Reservation,
            ..
        })
    ));
}

#[tokio::test]
async fn bulk_delete_reservations_skips_failures() {
    let fx = Fixture::new("res_bulk_delete.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let a = fx.book(fx.user(), s.id, None).await.unwrap();
    let b = fx.book(fx.user(), s.id, None).await.unwrap();
    let ghost = Ulid::new();

    let report = fx
        .engine
        .bulk_delete_reservations(&[a.id, ghost, b.id])
        .await
        .unwrap();
    assert_eq!(report.deleted, vec![a.id, b.id]);
    assert_eq!(report.skipped, vec![ghost]);
    assert_eq!(fx.registered(s.id).await, 0);
}

// ── Double booking ───────────────────────────────────────

#[tokio::test]
async fn user_cannot_hold_overlapping_confirmed_reservations() {
    let fx = Fixture::new("res_double_booking.wal");
    let user = fx.user();
    let a = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let c = fx.session(day(10), t(10, 30), t(11, 30)).await;
    let d = fx.session(day(10), t(12, 0), t(13, 0)).await;
    let other_day = fx.session(day(11), t(10, 0), t(11, 0)).await;

    let held = fx.book(user, a.id, None).await.unwrap();
    let err = fx.book(user, c.id, None).await.unwrap_err();
    match err {
        EngineError::Conflict {
            user_id,
            reservation_id,
            session_id,
        } => {
            assert_eq!(user_id, user);
            assert_eq!(reservation_id, held.id);
            assert_eq!(session_id, a.id);
        }
        other => panic!("expected conflict, got {other}"),
    }
    assert_eq!(fx.registered(c.id).await, 0);

    fx.book(user, d.id, None).await.unwrap();
    fx.book(user, other_day.id, None).await.unwrap();
    // Someone else may take the overlapping slot.
    fx.book(fx.user(), c.id, None).await.unwrap();
}

#[tokio::test]
async fn cancelled_reservations_do_not_block() {
    let fx = Fixture::new("res_cancelled_no_block.wal");
    let user = fx.user();
    let a = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let c = fx.session(day(10), t(10, 30), t(11, 30)).await;
    let held = fx.book(user, a.id, None).await.unwrap();
    fx.set_state(held.id, ReservationState::Cancelled).await;
    fx.book(user, c.id, None).await.unwrap();
}

#[tokio::test]
async fn moving_onto_an_overlapping_slot_conflicts() {
    let fx = Fixture::new("res_move_conflict.wal");
    let user = fx.user();
    let a = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let b = fx.session(day(10), t(14, 0), t(15, 0)).await;
    let c = fx.session(day(10), t(10, 30), t(11, 30)).await;
    fx.book(user, a.id, None).await.unwrap();
    let r = fx.book(user, b.id, None).await.unwrap();

    let err = fx
        .engine
        .update_reservation(
            r.id,
            ReservationPatch {
                session_id: Some(c.id),
                ..Default::default()
            },
            "member",
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(fx.engine.get_reservation(r.id).await.unwrap().session_id, b.id);
    assert_eq!(fx.registered(b.id).await, 1);
    assert_eq!(fx.registered(c.id).await, 0);
}

#[tokio::test]
async fn reservation_references_are_checked() {
    let fx = Fixture::new("res_refs.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;

    let err = fx.book(Ulid::new(), s.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: Entity::User, .. }));

    let err = fx.book(fx.user(), s.id, Some(Ulid::new())).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: Entity::Membership, .. }));

    fx.engine.delete_session(s.id).await.unwrap();
    let err = fx.book(fx.user(), s.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: Entity::Session, .. }));

    let err = fx
        .engine
        .update_reservation(Ulid::new(), ReservationPatch::default(), "member")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RESERVATION_ERROR_001");
}

#[tokio::test]
async fn fetch_reservations_and_reminders() {
    let fx = Fixture::new("res_fetch.wal");
    let early = fx.session(day(10), t(8, 0), t(9, 0)).await;
    let late = fx.session(day(10), t(17, 0), t(18, 0)).await;
    let tomorrow = fx.session(day(11), t(8, 0), t(9, 0)).await;
    let user = fx.user();
    let r_late = fx.book(user, late.id, None).await.unwrap();
    let r_early = fx.book(user, early.id, None).await.unwrap();
    fx.book(user, tomorrow.id, None).await.unwrap();
    fx.book_as(fx.user(), early.id, None, ReservationState::Cancelled)
        .await
        .unwrap();

    let mine = fx
        .engine
        .fetch_reservations(&ReservationFilter {
            user_ids: vec![user],
            ..Default::default()
        })
        .await;
    assert_eq!(mine.len(), 3);
    let cancelled = fx
        .engine
        .fetch_reservations(&ReservationFilter {
            states: vec![ReservationState::Cancelled],
            ..Default::default()
        })
        .await;
    assert_eq!(cancelled.len(), 1);

    let reminders = fx.engine.reminders_for(day(10)).await;
    let ids: Vec<Ulid> = reminders.iter().map(|r| r.reservation_id).collect();
    assert_eq!(ids, vec![r_early.id, r_late.id]);
    assert_eq!(reminders[0].session_title, "Hatha yoga");
    assert_eq!(reminders[0].location_id, Some(fx.location));
}

// ── Memberships ──────────────────────────────────────────

#[tokio::test]
async fn suspension_extends_end_date_on_resume() {
    let fx = Fixture::new("membership_suspend.wal");
    let m = fx.membership(fx.user(), Some(0)).await;
    let suspend = MembershipPatch {
        status: Some(MembershipStatus::Suspended),
        ..Default::default()
    };
    let resume = MembershipPatch {
        status: Some(MembershipStatus::Active),
        ..Default::default()
    };

    fx.engine
        .update_membership_at(m.id, suspend, "admin", utc(1, 10))
        .await
        .unwrap();
    let open = fx.engine.suspensions_for(m.id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].suspended_at, utc(1, 10));
    assert!(open[0].is_open());

    let resumed = fx
        .engine
        .update_membership_at(m.id, resume, "admin", utc(1, 15))
        .await
        .unwrap();
    assert_eq!(resumed.status, MembershipStatus::Active);
    assert_eq!(resumed.end_date, utc(2, 6));
    let history = fx.engine.suspensions_for(m.id).await.unwrap();
    assert_eq!(history[0].resumed_at, Some(utc(1, 15)));
}

#[tokio::test]
async fn resume_without_open_suspension_keeps_end_date() {
    let fx = Fixture::new("membership_resume_nothing.wal");
    let mut m = fx.membership(fx.user(), None).await;
    m = fx
        .engine
        .update_membership(
            m.id,
            MembershipPatch {
                status: Some(MembershipStatus::Expired),
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap();
    assert!(fx.engine.suspensions_for(m.id).await.unwrap().is_empty());

    // Expired -> Suspended is not an ACTIVE -> SUSPENDED transition.
    fx.engine
        .update_membership(
            m.id,
            MembershipPatch {
                status: Some(MembershipStatus::Suspended),
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap();
    let resumed = fx
        .engine
        .update_membership(
            m.id,
            MembershipPatch {
                status: Some(MembershipStatus::Active),
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap();
    assert_eq!(resumed.end_date, utc(2, 1));
    assert!(fx.engine.suspensions_for(m.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn membership_references_are_checked() {
    let fx = Fixture::new("membership_refs.wal");
    let err = fx
        .engine
        .create_membership(
            NewMembership {
                description: "Yearly".into(),
                status: MembershipStatus::Active,
                start_date: utc(1, 1),
                end_date: utc(12, 31),
                reservations_used: Some(0),
                community_id: fx.community,
                user_id: fx.user(),
                plan_id: Ulid::new(),
            },
            "admin",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: Entity::Plan, .. }));
    assert!(fx.engine.fetch_memberships(None).await.is_empty());
}

#[tokio::test]
async fn expirer_only_touches_active_memberships_past_end() {
    let fx = Fixture::new("membership_expire.wal");
    let user = fx.user();
    let lapsed = fx.membership(user, None).await;
    let suspended = fx.membership(user, None).await;
    fx.engine
        .update_membership_at(
            suspended.id,
            MembershipPatch {
                status: Some(MembershipStatus::Suspended),
                ..Default::default()
            },
            "admin",
            utc(1, 20),
        )
        .await
        .unwrap();
    let current = fx
        .engine
        .update_membership(
            fx.membership(fx.user(), None).await.id,
            MembershipPatch {
                end_date: Some(utc(6, 1)),
                ..Default::default()
            },
            "admin",
        )
        .await
        .unwrap();

    assert_eq!(fx.engine.expire_memberships(utc(3, 1)).await.unwrap(), 1);
    let lapsed = fx.engine.get_membership(lapsed.id).await.unwrap();
    assert_eq!(lapsed.status, MembershipStatus::Expired);
    assert_eq!(lapsed.audit.updated_by, SYSTEM_ACTOR);
    assert_eq!(
        fx.engine.get_membership(suspended.id).await.unwrap().status,
        MembershipStatus::Suspended
    );
    assert_eq!(
        fx.engine.get_membership(current.id).await.unwrap().status,
        MembershipStatus::Active
    );
    assert_eq!(fx.engine.expire_memberships(utc(3, 1)).await.unwrap(), 0);

    assert_eq!(fx.engine.fetch_memberships(Some(user)).await.len(), 2);
}

// ── Journal & reconciliation ─────────────────────────────

#[tokio::test]
async fn replay_restores_counters_and_suspensions() {
    let fx = Fixture::new("replay_state.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, Some(0)).await;
    let kept = fx.book(user, s.id, Some(m.id)).await.unwrap();
    let dropped = fx.book(fx.user(), s.id, None).await.unwrap();
    fx.engine.delete_reservation(dropped.id).await.unwrap();
    fx.engine
        .update_membership_at(
            m.id,
            MembershipPatch {
                status: Some(MembershipStatus::Suspended),
                ..Default::default()
            },
            "admin",
            utc(1, 10),
        )
        .await
        .unwrap();

    let fx = fx.reopen();
    assert_eq!(fx.registered(s.id).await, 1);
    assert_eq!(fx.used(m.id).await, Some(1));
    assert_eq!(fx.engine.get_reservation(kept.id).await.unwrap(), kept);
    assert!(fx.engine.get_reservation(dropped.id).await.is_err());
    let suspensions = fx.engine.suspensions_for(m.id).await.unwrap();
    assert_eq!(suspensions.len(), 1);
    assert!(suspensions[0].is_open());

    let resumed = fx
        .engine
        .update_membership_at(
            m.id,
            MembershipPatch {
                status: Some(MembershipStatus::Active),
                ..Default::default()
            },
            "admin",
            utc(1, 15),
        )
        .await
        .unwrap();
    assert_eq!(resumed.end_date, utc(2, 6));
}

#[tokio::test]
async fn compaction_keeps_state_across_restart() {
    let fx = Fixture::new("compact_restart.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, Some(0)).await;
    let r = fx.book(user, s.id, Some(m.id)).await.unwrap();
    fx.engine
        .update_membership_at(
            m.id,
            MembershipPatch {
                status: Some(MembershipStatus::Suspended),
                ..Default::default()
            },
            "admin",
            utc(1, 10),
        )
        .await
        .unwrap();
    assert!(fx.engine.wal_appends_since_compact().await > 0);

    fx.engine.compact_wal().await.unwrap();
    assert_eq!(fx.engine.wal_appends_since_compact().await, 0);

    let fx = fx.reopen();
    assert_eq!(fx.registered(s.id).await, 1);
    assert_eq!(fx.used(m.id).await, Some(1));
    assert_eq!(fx.engine.get_reservation(r.id).await.unwrap(), r);
    assert_eq!(fx.engine.suspensions_for(m.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reconciler_repairs_drifted_counters() {
    let fx = Fixture::new("reconcile_drift.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let empty = fx.session(day(11), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, Some(0)).await;
    fx.book(user, s.id, Some(m.id)).await.unwrap();
    fx.book(fx.user(), s.id, None).await.unwrap();

    assert!(fx.engine.reconcile_counters("ops").await.unwrap().is_clean());

    fx.engine
        .update_session(
            s.id,
            SessionPatch {
                registered_count: Some(9),
                ..Default::default()
            },
            "ops",
        )
        .await
        .unwrap();
    fx.engine.adjust_registered_count(empty.id, 3, "ops").await.unwrap();
    fx.engine.adjust_reservations_used(m.id, 4, "ops").await.unwrap();

    let report = fx.engine.reconcile_counters("ops").await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            sessions_corrected: 2,
            memberships_corrected: 1,
        }
    );
    assert_eq!(fx.registered(s.id).await, 2);
    assert_eq!(fx.registered(empty.id).await, 0);
    assert_eq!(fx.used(m.id).await, Some(1));

    let fx = fx.reopen();
    assert_eq!(fx.registered(s.id).await, 2);
}

#[tokio::test]
async fn failed_counter_writes_leave_booking_in_place_until_reconciled() {
    let fx = Fixture::new("secondary_failure.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let user = fx.user();
    let m = fx.membership(user, Some(0)).await;

    fx.engine.fail_secondary_writes.store(true, Ordering::SeqCst);
    let r = fx.book(user, s.id, Some(m.id)).await.unwrap();
    assert_eq!(fx.engine.get_reservation(r.id).await.unwrap().state, ReservationState::Confirmed);
    assert_eq!(fx.registered(s.id).await, 0);
    assert_eq!(fx.used(m.id).await, Some(0));
    fx.engine.fail_secondary_writes.store(false, Ordering::SeqCst);

    let report = fx.engine.reconcile_counters("ops").await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            sessions_corrected: 1,
            memberships_corrected: 1,
        }
    );
    assert_eq!(fx.registered(s.id).await, 1);
    assert_eq!(fx.used(m.id).await, Some(1));

    let fx = fx.reopen();
    assert_eq!(fx.registered(s.id).await, 1);
    assert_eq!(fx.engine.get_reservation(r.id).await.unwrap().user_id, user);
}

#[tokio::test]
async fn failed_suspension_write_still_suspends() {
    let fx = Fixture::new("suspension_failure.wal");
    let m = fx.membership(fx.user(), Some(0)).await;

    fx.engine.fail_secondary_writes.store(true, Ordering::SeqCst);
    let suspended = fx
        .engine
        .update_membership_at(
            m.id,
            MembershipPatch {
                status: Some(MembershipStatus::Suspended),
                ..Default::default()
            },
            "admin",
            utc(1, 10),
        )
        .await
        .unwrap();
    assert_eq!(suspended.status, MembershipStatus::Suspended);
    assert!(fx.engine.suspensions_for(m.id).await.unwrap().is_empty());
    fx.engine.fail_secondary_writes.store(false, Ordering::SeqCst);

    // No suspension was recorded, so resuming cannot extend the end date.
    let resumed = fx
        .engine
        .update_membership_at(
            m.id,
            MembershipPatch {
                status: Some(MembershipStatus::Active),
                ..Default::default()
            },
            "admin",
            utc(1, 15),
        )
        .await
        .unwrap();
    assert_eq!(resumed.status, MembershipStatus::Active);
    assert_eq!(resumed.end_date, utc(2, 1));

    let fx = fx.reopen();
    assert_eq!(fx.engine.get_membership(m.id).await.unwrap().status, MembershipStatus::Active);
}

#[tokio::test]
async fn torn_journal_tail_does_not_swallow_later_writes() {
    let fx = Fixture::new("torn_tail.wal");
    let a = fx.session(day(10), t(10, 0), t(11, 0)).await;
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&fx.path).unwrap();
        f.write_all(&[40u8, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let fx = fx.reopen();
    let b = fx.session(day(11), t(10, 0), t(11, 0)).await;
    let r = fx.book(fx.user(), b.id, None).await.unwrap();

    let fx = fx.reopen();
    assert_eq!(fx.engine.get_session(a.id).await.unwrap().id, a.id);
    assert_eq!(fx.engine.get_session(b.id).await.unwrap().registered_count, 1);
    assert!(fx.engine.get_reservation(r.id).await.is_ok());
}

#[tokio::test]
async fn mutations_require_actor() {
    let fx = Fixture::new("actor_required.wal");
    let s = fx.session(day(10), t(10, 0), t(11, 0)).await;
    let err = fx
        .engine
        .create_reservation(
            NewReservation {
                name: "x".into(),
                reservation_time: Utc::now(),
                state: ReservationState::Confirmed,
                user_id: fx.user(),
                session_id: s.id,
                membership_id: None,
            },
            "",
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(fx.registered(s.id).await, 0);
    assert!(fx.engine.reconcile_counters("").await.is_err());
}
