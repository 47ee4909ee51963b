use std::collections::HashMap;

use chrono::Utc;
use ulid::Ulid;

use crate::model::*;
use crate::observability::COUNTER_CORRECTIONS_TOTAL;

use super::{require_actor, Engine, EngineError};

impl Engine {
    /// Recompute `registered_count` and tracked `reservations_used` from the
    /// CONFIRMED reservations on record and rewrite any that drifted.
    ///
    /// Holds the write gate exclusively, so no reservation mutation can run
    /// between counting and correcting.
    pub async fn reconcile_counters(&self, actor: &str) -> Result<ReconcileReport, EngineError> {
        require_actor(actor)?;
        let _gate = self.write_gate.write().await;

        let mut per_session: HashMap<Ulid, u32> = HashMap::new();
        let mut per_membership: HashMap<Ulid, u32> = HashMap::new();
        for shared in self.store.all_reservations() {
            let r = shared.read().await;
            if !r.is_confirmed() {
                continue;
            }
            *per_session.entry(r.session_id).or_default() += 1;
            if let Some(membership_id) = r.membership_id {
                *per_membership.entry(membership_id).or_default() += 1;
            }
        }

        let mut report = ReconcileReport::default();

        for shared in self.store.all_sessions() {
            let mut guard = shared.write().await;
            let expected = per_session.get(&guard.id).copied().unwrap_or(0);
            if guard.registered_count == expected {
                continue;
            }
            let audit = Audit::new(actor, Utc::now());
            self.wal_append(&Event::RegisteredCountSet {
                session_id: guard.id,
                registered_count: expected,
                audit: audit.clone(),
            })
            .await?;
            tracing::warn!(
                "session {} registered_count drifted: {} -> {expected}",
                guard.id,
                guard.registered_count
            );
            guard.registered_count = expected;
            guard.audit = audit;
            report.sessions_corrected += 1;
        }

        for shared in self.store.all_memberships() {
            let mut guard = shared.write().await;
            let Some(current) = guard.reservations_used else {
                continue;
            };
            let expected = per_membership.get(&guard.id).copied().unwrap_or(0);
            if current == expected {
                continue;
            }
            let audit = Audit::new(actor, Utc::now());
            self.wal_append(&Event::ReservationsUsedSet {
                membership_id: guard.id,
                reservations_used: expected,
                audit: audit.clone(),
            })
            .await?;
            tracing::warn!("membership {} reservations_used drifted: {current} -> {expected}", guard.id);
            guard.reservations_used = Some(expected);
            guard.audit = audit;
            report.memberships_corrected += 1;
        }

        metrics::counter!(COUNTER_CORRECTIONS_TOTAL, "counter" => "registered_count")
            .increment(report.sessions_corrected as u64);
        metrics::counter!(COUNTER_CORRECTIONS_TOTAL, "counter" => "reservations_used")
            .increment(report.memberships_corrected as u64);
        Ok(report)
    }
}
