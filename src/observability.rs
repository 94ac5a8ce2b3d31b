use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

// ── Domain ───────────────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "parkd_bookings_created_total";

/// Counter: reservations refused because of an overlapping live booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "parkd_booking_conflicts_total";

/// Counter: elapsed bookings closed out by the sweep.
pub const BOOKINGS_SWEPT_TOTAL: &str = "parkd_bookings_swept_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPlace { .. } => "insert_place",
        Command::DeletePlace { .. } => "delete_place",
        Command::SelectPlaces => "select_places",
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlotStatus { .. } => "update_slot_status",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertBooking { .. } => "insert_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::CheckIn { .. } => "check_in",
        Command::CheckOut { .. } => "check_out",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectPrice { .. } => "select_price",
        Command::SelectReport { .. } => "select_report",
        Command::Listen { .. } => "listen",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn labels_are_distinct_per_booking_command() {
        let id = Ulid::new();
        let labels = [
            command_label(&Command::CancelBooking { id, reason: None }),
            command_label(&Command::CheckIn { id }),
            command_label(&Command::CheckOut { id }),
        ];
        assert_eq!(labels, ["cancel_booking", "check_in", "check_out"]);
    }
}
