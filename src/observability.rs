use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "stayd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "stayd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "stayd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "stayd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stayd_connections_rejected_total";

/// Gauge: number of active properties (loaded engines).
pub const PROPERTIES_ACTIVE: &str = "stayd_properties_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "stayd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stayd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "stayd_wal_flush_batch_size";

/// Counter: hold attempts that timed out waiting for the unit lock.
pub const HOLD_CONTENTION_TOTAL: &str = "stayd_hold_contention_total";

/// Counter: holds reaped after their TTL lapsed.
pub const HOLDS_EXPIRED_TOTAL: &str = "stayd_holds_expired_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectSettings => "select_settings",
        Command::UpdateSettings { .. } => "update_settings",
        Command::InsertSeason { .. } => "insert_season",
        Command::UpdateSeason { .. } => "update_season",
        Command::DeleteSeason { .. } => "delete_season",
        Command::SelectSeasons => "select_seasons",
        Command::SelectQuote { .. } => "select_quote",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::SelectHolds => "select_holds",
        Command::InsertPayment { .. } => "insert_payment",
        Command::SelectBookings { .. } => "select_bookings",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::InsertInvoice { .. } => "insert_invoice",
        Command::UpdateInvoiceStatus { .. } => "update_invoice_status",
        Command::SelectInvoices { .. } => "select_invoices",
    }
}
