use std::net::SocketAddr;

// ── Reservation traffic ─────────────────────────────────────────

/// Counter: reservation mutations. Labels: op, status.
pub const RESERVATIONS_TOTAL: &str = "seatwise_reservations_total";

// ── Counter bookkeeping ─────────────────────────────────────────

/// Counter: secondary counter or suspension writes that failed and were
/// swallowed. Labels: counter.
pub const COUNTER_FAILURES_TOTAL: &str = "seatwise_counter_failures_total";

/// Counter: drifted counters rewritten by the reconciler. Labels: counter.
pub const COUNTER_CORRECTIONS_TOTAL: &str = "seatwise_counter_corrections_total";

/// Counter: memberships moved to EXPIRED by the expirer.
pub const MEMBERSHIPS_EXPIRED_TOTAL: &str = "seatwise_memberships_expired_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatwise_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Label for an engine result.
pub fn status_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() { "ok" } else { "error" }
}
