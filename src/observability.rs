use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "atelier_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "atelier_request_duration_seconds";

/// Counter: reservations committed.
pub const RESERVATIONS_BOOKED_TOTAL: &str = "atelier_reservations_booked_total";

/// Counter: reservations cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "atelier_reservations_cancelled_total";

/// Counter: create/modify requests that lost the slot to a conflict.
pub const BOOKING_CONFLICTS_TOTAL: &str = "atelier_booking_conflicts_total";

/// Counter: reminders handed to the dispatcher.
pub const REMINDERS_DISPATCHED_TOTAL: &str = "atelier_reminders_dispatched_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "atelier_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "atelier_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "atelier_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "atelier_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "atelier_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::CreateReservation { .. } => "create_reservation",
        Request::ModifyReservation { .. } => "modify_reservation",
        Request::CancelReservation { .. } => "cancel_reservation",
        Request::SetReservationStatus { .. } => "set_reservation_status",
        Request::ListAvailability { .. } => "list_availability",
        Request::ListReservations { .. } => "list_reservations",
        Request::GetReservation { .. } => "get_reservation",
        Request::CreateBlackout { .. } => "create_blackout",
        Request::BulkCreateBlackout { .. } => "bulk_create_blackout",
        Request::DeleteBlackout { .. } => "delete_blackout",
        Request::ListBlackouts { .. } => "list_blackouts",
        Request::ListReminders { .. } => "list_reminders",
        Request::GetSettings => "get_settings",
        Request::UpdateSettings { .. } => "update_settings",
    }
}
