use std::net::SocketAddr;

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: applied state transitions. Labels: transition.
pub const TRANSITIONS_TOTAL: &str = "slotkeeper_transitions_total";

/// Counter: pending appointments released by their payment timer.
pub const EXPIRED_TOTAL: &str = "slotkeeper_expired_total";

/// Gauge: payment timers currently armed.
pub const PENDING_TIMERS: &str = "slotkeeper_pending_timers";

// ── Payment reconciliation ──────────────────────────────────────

/// Counter: payments that moved an appointment to Reserved.
pub const PAYMENTS_MATCHED_TOTAL: &str = "slotkeeper_payments_matched_total";

/// Counter: well-formed payment events with no pending appointment.
pub const PAYMENTS_UNMATCHED_TOTAL: &str = "slotkeeper_payments_unmatched_total";

/// Counter: feed items dropped as malformed.
pub const FEED_EVENTS_DROPPED_TOTAL: &str = "slotkeeper_feed_events_dropped_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
