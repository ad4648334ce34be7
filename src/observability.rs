use std::net::SocketAddr;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: feasibility checks. Labels: verdict (accept, reject).
pub const CHECKS_TOTAL: &str = "clusterbook_checks_total";

/// Histogram: feasibility check latency in seconds.
pub const CHECK_DURATION_SECONDS: &str = "clusterbook_check_duration_seconds";

/// Counter: task reservations. Labels: status (committed, rejected, limit_violated).
pub const RESERVATIONS_TOTAL: &str = "clusterbook_reservations_total";

// ── Internals ───────────────────────────────────────────────────

/// Counter: schedule cache lookups. Labels: result (hit, miss).
pub const SCHEDULE_CACHE_TOTAL: &str = "clusterbook_schedule_cache_total";

/// Counter: unit labels that were not recognised and fell back to the base unit.
pub const UNKNOWN_UNIT_LABELS_TOTAL: &str = "clusterbook_unknown_unit_labels_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
///
/// A failed install is logged and otherwise ignored: the metric macros stay
/// no-ops without a recorder.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}
