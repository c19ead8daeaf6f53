use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "staydesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "staydesk_query_duration_seconds";

/// Counter: requests refused by the permission evaluator. Labels: reason.
pub const PERMISSION_DENIALS_TOTAL: &str = "staydesk_permission_denials_total";

/// Counter: writes rejected because the interval overlaps an active one.
pub const OVERLAP_CONFLICTS_TOTAL: &str = "staydesk_overlap_conflicts_total";

/// Counter: audit entries that could not be stored.
pub const AUDIT_WRITE_FAILURES_TOTAL: &str = "staydesk_audit_write_failures_total";

/// Counter: invitations moved to expired by the reaper.
pub const INVITATIONS_EXPIRED_TOTAL: &str = "staydesk_invitations_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "staydesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "staydesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "staydesk_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "staydesk_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staydesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "staydesk_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "staydesk_wal_compactions_total";

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
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertInvitation { .. } => "insert_invitation",
        Command::DeleteInvitation { .. } => "delete_invitation",
        Command::AcceptInvitation { .. } => "accept_invitation",
        Command::InsertStay(_) => "insert_stay",
        Command::UpdateStay { .. } => "update_stay",
        Command::DeleteStay { .. } => "delete_stay",
        Command::InsertPricePeriod(_) => "insert_price_period",
        Command::UpdatePricePeriod { .. } => "update_price_period",
        Command::DeletePricePeriod { .. } => "delete_price_period",
        Command::DeleteAuditEntry { .. } => "delete_audit_entry",
        Command::SelectUsers => "select_users",
        Command::SelectInvitations => "select_invitations",
        Command::SelectRoles => "select_roles",
        Command::SelectPermissions => "select_permissions",
        Command::SelectAuditLog => "select_audit_log",
        Command::SelectStays { .. } => "select_stays",
        Command::SelectPricePeriods { .. } => "select_price_periods",
        Command::SelectPrice { .. } => "select_price",
        Command::SelectInvoices { .. } => "select_invoices",
    }
}
