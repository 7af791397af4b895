use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "haven_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "haven_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "haven_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "haven_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "haven_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "haven_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "haven_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "haven_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings refused for overlap, closure or capacity.
pub const BOOKING_CONFLICTS_TOTAL: &str = "haven_booking_conflicts_total";

/// Counter: tentative reservations cancelled because their hold ran out.
pub const EXPIRED_HOLDS_TOTAL: &str = "haven_expired_holds_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource(_) => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertClosure { .. } => "insert_closure",
        Command::DeleteClosure { .. } => "delete_closure",
        Command::InsertStaff(_) => "insert_staff",
        Command::UpdateStaff { .. } => "update_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::InsertReservation(_) => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::UpsertParticipants { .. } => "upsert_participants",
        Command::InsertProgram { .. } => "insert_program",
        Command::InsertRoomAssignments { .. } => "insert_room_assignments",
        Command::InsertPlaceBooking { .. } => "insert_place_booking",
        Command::InsertMeal { .. } => "insert_meal",
        Command::InsertLedgerItem { .. } => "insert_ledger_item",
        Command::InsertDocument { .. } => "insert_document",
        Command::InsertSurvey { .. } => "insert_survey",
        Command::DeleteEntry { .. } => "delete_entry",
        Command::SelectResources { .. } => "select_resources",
        Command::SelectClosures { .. } => "select_closures",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectStaff { .. } => "select_staff",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectParticipants { .. } => "select_participants",
        Command::SelectEntries { .. } => "select_entries",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectVacancies { .. } => "select_vacancies",
        Command::SelectSettlement { .. } => "select_settlement",
        Command::SelectStaffPayments { .. } => "select_staff_payments",
        Command::SelectSatisfaction { .. } => "select_satisfaction_report",
        Command::SelectEffect { .. } => "select_effect_report",
        Command::SelectOperations { .. } => "select_operations_summary",
    }
}
