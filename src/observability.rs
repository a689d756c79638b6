use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tourdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tourdesk_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tourdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tourdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tourdesk_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "tourdesk_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tourdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tourdesk_wal_flush_batch_size";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: slots created by template generation.
pub const SLOTS_GENERATED_TOTAL: &str = "tourdesk_slots_generated_total";

/// Counter: generation candidates skipped because a slot already exists.
pub const SLOTS_SKIPPED_TOTAL: &str = "tourdesk_slots_skipped_total";

/// Counter: candidate slots refused for lack of resources.
pub const RESOURCE_CONFLICTS_TOTAL: &str = "tourdesk_resource_conflicts_total";

/// Counter: bookings accepted.
pub const BOOKINGS_CREATED_TOTAL: &str = "tourdesk_bookings_created_total";

/// Counter: bookings refused for lack of seats.
pub const BOOKINGS_REJECTED_TOTAL: &str = "tourdesk_bookings_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::UpsertTour { .. } => "upsert_tour",
        Command::UpsertResource { .. } => "upsert_resource",
        Command::SetRequirement { .. } => "set_requirement",
        Command::UpsertTemplate { .. } => "upsert_template",
        Command::UpdateTemplate { .. } => "update_template",
        Command::DeleteTemplate { .. } => "delete_template",
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlot { .. } => "update_slot",
        Command::CancelSlot { .. } => "cancel_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::UpdateBookingContact { .. } => "update_booking_contact",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::Generate { .. } => "generate",
        Command::PreviewGeneration { .. } => "preview_generation",
        Command::SelectQuote { .. } => "select_quote",
        Command::SelectSlotStats { .. } => "select_slot_stats",
        Command::SelectSlotAudit { .. } => "select_slot_audit",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBookingStats { .. } => "select_booking_stats",
    }
}
