use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "strandkorb_queries_total";

/// Histogram: command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "strandkorb_query_duration_seconds";

/// Counter: reservations committed.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "strandkorb_reservations_committed_total";

/// Counter: reservations rejected at the locked recheck.
pub const RESERVATIONS_CONFLICTED_TOTAL: &str = "strandkorb_reservations_conflicted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "strandkorb_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "strandkorb_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "strandkorb_connections_rejected_total";

/// Gauge: number of open stores (loaded engines).
pub const STORES_ACTIVE: &str = "strandkorb_stores_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "strandkorb_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "strandkorb_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Use { .. } => "use",
        Command::InsertLocation { .. } => "insert_location",
        Command::InsertChair { .. } => "insert_chair",
        Command::InsertService { .. } => "insert_service",
        Command::LinkService { .. } => "link_service",
        Command::InsertTournament { .. } => "insert_tournament",
        Command::Reserve { .. } => "reserve",
        Command::AttachServices { .. } => "attach_services",
        Command::AttachDrink { .. } => "attach_drink",
        Command::RecordUsage { .. } => "record_usage",
        Command::SelectLocations => "select_locations",
        Command::SelectServices => "select_services",
        Command::SelectTournaments { .. } => "select_tournaments",
        Command::SelectChairs { .. } => "select_chairs",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectUsageWindow { .. } => "select_usage_window",
        Command::SelectReservationServices { .. } => "select_reservation_services",
        Command::SelectReservationDrinks { .. } => "select_reservation_drinks",
        Command::SelectUnbookedServices { .. } => "select_unbooked_services",
        Command::SelectCharges { .. } => "select_charges",
        Command::SelectChairServices { .. } => "select_chair_services",
        Command::SelectUsageStats { .. } => "select_usage_stats",
    }
}
