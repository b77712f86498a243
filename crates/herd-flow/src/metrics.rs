//! Observability metrics for the orchestration core.
//!
//! Exposed via the `metrics` crate facade; install any compatible exporter
//! (Prometheus, statsd) at process start.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `herd_tickets_total` | Counter | `ticket_type` | Tickets created |
//! | `herd_flow_transitions_total` | Counter | `to_state` | Flow status transitions |
//! | `herd_exclusion_rejections_total` | Counter | `ticket_type` | INNER_FAIL rejections |
//! | `herd_ticket_terminal_total` | Counter | `status` | Tickets reaching a terminal status |
//! | `herd_recurring_runs_total` | Counter | `job`, `outcome` | Recurring task firings |
//! | `herd_alarm_dispositions_total` | Counter | `disposition` | Alarm adapter outcomes |
//! | `herd_active_ledger_records` | Gauge | - | Live cluster operation records |

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: tickets created.
    pub const TICKETS_TOTAL: &str = "herd_tickets_total";
    /// Counter: flow status transitions.
    pub const FLOW_TRANSITIONS_TOTAL: &str = "herd_flow_transitions_total";
    /// Counter: exclusion rejections.
    pub const EXCLUSION_REJECTIONS_TOTAL: &str = "herd_exclusion_rejections_total";
    /// Counter: tickets reaching a terminal status.
    pub const TICKET_TERMINAL_TOTAL: &str = "herd_ticket_terminal_total";
    /// Counter: recurring task firings.
    pub const RECURRING_RUNS_TOTAL: &str = "herd_recurring_runs_total";
    /// Counter: alarm adapter outcomes.
    pub const ALARM_DISPOSITIONS_TOTAL: &str = "herd_alarm_dispositions_total";
    /// Gauge: live cluster operation records.
    pub const ACTIVE_LEDGER_RECORDS: &str = "herd_active_ledger_records";
}

/// Records a ticket creation.
pub fn record_ticket_created(ticket_type: &str) {
    counter!(names::TICKETS_TOTAL, "ticket_type" => ticket_type.to_owned()).increment(1);
}

/// Records a flow status transition.
pub fn record_flow_transition(to_state: &'static str) {
    counter!(names::FLOW_TRANSITIONS_TOTAL, "to_state" => to_state).increment(1);
}

/// Records an exclusion rejection.
pub fn record_exclusion_rejection(ticket_type: &str) {
    counter!(names::EXCLUSION_REJECTIONS_TOTAL, "ticket_type" => ticket_type.to_owned())
        .increment(1);
}

/// Records a ticket reaching a terminal status.
pub fn record_ticket_terminal(status: &str) {
    counter!(names::TICKET_TERMINAL_TOTAL, "status" => status.to_owned()).increment(1);
}

/// Records one recurring task firing.
pub fn record_recurring_run(job: &str, outcome: &'static str) {
    counter!(
        names::RECURRING_RUNS_TOTAL,
        "job" => job.to_owned(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Records an alarm adapter disposition.
pub fn record_alarm_disposition(disposition: &str) {
    counter!(names::ALARM_DISPOSITIONS_TOTAL, "disposition" => disposition.to_owned())
        .increment(1);
}

/// Updates the live ledger record gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_ledger_records(count: usize) {
    gauge!(names::ACTIVE_LEDGER_RECORDS).set(count as f64);
}
