use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roombook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roombook_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: booking rows committed. Labels: type.
pub const BOOKINGS_CREATED_TOTAL: &str = "roombook_bookings_created_total";

/// Counter: requests refused because a hard block already holds the slot.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roombook_booking_conflicts_total";

/// Counter: requests refused by the maintenance or working-hours gate. Labels: code.
pub const POLICY_REJECTIONS_TOTAL: &str = "roombook_policy_rejections_total";

/// Counter: committed status transitions. Labels: status.
pub const STATUS_CHANGES_TOTAL: &str = "roombook_status_changes_total";

/// Counter: notices dropped after the last delivery attempt.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "roombook_notifications_failed_total";

/// Counter: notices dropped because the delivery queue was full.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "roombook_notifications_dropped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "roombook_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "roombook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "roombook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUserRole { .. } => "update_user_role",
        Command::InsertBookings { .. } => "insert_bookings",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::UpdateSettings { .. } => "update_settings",
        Command::SelectRooms => "select_rooms",
        Command::SelectUsers => "select_users",
        Command::SelectSettings => "select_settings",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectQueue { .. } => "select_queue",
    }
}
