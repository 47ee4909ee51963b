use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::engine::Engine;
use crate::model::SYSTEM_ACTOR;

/// Background task that expires memberships past their end date.
pub async fn run_expirer(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.expire_memberships(Utc::now()).await {
            Ok(0) => tracing::debug!("expirer: nothing to expire"),
            Ok(n) => info!("expired {n} memberships"),
            Err(e) => tracing::warn!("expirer pass failed: {e}"),
        }
    }
}

/// Background task that repairs counter drift left by failed secondary writes.
pub async fn run_reconciler(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately; startup state was just replayed.
    interval.tick().await;
    loop {
        interval.tick().await;
        match engine.reconcile_counters(SYSTEM_ACTOR).await {
            Ok(report) if report.is_clean() => tracing::debug!("reconciler: counters consistent"),
            Ok(report) => info!(
                "reconciler corrected {} sessions and {} memberships",
                report.sessions_corrected, report.memberships_corrected
            ),
            Err(e) => tracing::warn!("reconciler pass failed: {e}"),
        }
    }
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted journal after {appends} appends");
            true
        }
        Err(e) => {
            tracing::warn!("journal compaction failed: {e}");
            false
        }
    }
}
