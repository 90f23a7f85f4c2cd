//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Clone phase
//! - Row and page throughput per table
//! - Table outcomes
//! - Schema migration stages
//! - Configuration synchronization
//! - System-table reconciliation
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `clone_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use catalog_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_page_fetched("isa:dataset", 10_000, Duration::from_millis(80));
//! metrics::record_table_outcome("isa:dataset", "complete");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Set the current clone phase (one-hot gauge per phase label).
pub fn set_clone_phase(phase: &str) {
    const PHASES: [&str; 12] = [
        "Created",
        "Preparing",
        "Planning",
        "StageOne",
        "CopyingData",
        "Reconciling",
        "StageTwo",
        "SyncingConfig",
        "Truncating",
        "Complete",
        "Failed",
        "Cancelled",
    ];
    for p in PHASES {
        let value = if p == phase { 1.0 } else { 0.0 };
        gauge!("clone_phase", "phase" => p).set(value);
    }
}

/// Record a page read from the source.
pub fn record_page_fetched(table: &str, rows: usize, duration: Duration) {
    counter!("clone_pages_fetched_total", "table" => table.to_string()).increment(1);
    histogram!("clone_page_fetch_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
    histogram!("clone_page_rows", "table" => table.to_string()).record(rows as f64);
}

/// Record a page accepted by the destination.
pub fn record_page_uploaded(table: &str, rows: usize, duration: Duration) {
    counter!("clone_pages_uploaded_total", "table" => table.to_string()).increment(1);
    counter!("clone_rows_copied_total", "table" => table.to_string()).increment(rows as u64);
    histogram!("clone_page_upload_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
}

/// Record how a table's data copy ended ("complete", "failed", "skipped").
pub fn record_table_outcome(table: &str, outcome: &str) {
    counter!("clone_tables_total", "table" => table.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record total duration of one table copy.
pub fn record_table_duration(table: &str, duration: Duration) {
    histogram!("clone_table_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
}

/// Number of table pipelines currently running.
pub fn set_tables_in_flight(count: usize) {
    gauge!("clone_tables_in_flight").set(count as f64);
}

/// Record a schema migration stage.
pub fn record_stage(stage: &str, objects: usize, duration: Duration) {
    counter!("clone_schema_objects_total", "stage" => stage.to_string()).increment(objects as u64);
    histogram!("clone_stage_duration_seconds", "stage" => stage.to_string())
        .record(duration.as_secs_f64());
}

/// Record a configuration PUT issued for a node field.
pub fn record_config_put(node_kind: &str, field: &str) {
    counter!(
        "clone_config_puts_total",
        "node_kind" => node_kind.to_string(),
        "field" => field.to_string()
    )
    .increment(1);
}

/// Record configuration fields found already equivalent.
pub fn record_config_unchanged(count: usize) {
    counter!("clone_config_unchanged_total").increment(count as u64);
}

/// Record a concurrent-update retry.
pub fn record_config_retry(node_kind: &str) {
    counter!("clone_config_retries_total", "node_kind" => node_kind.to_string()).increment(1);
}

/// Record a system-table reconciliation.
pub fn record_reconcile(table: &str, created: usize, updated: usize, retained: usize) {
    counter!("clone_reconcile_created_total", "table" => table.to_string()).increment(created as u64);
    counter!("clone_reconcile_updated_total", "table" => table.to_string()).increment(updated as u64);
    gauge!("clone_reconcile_retained", "table" => table.to_string()).set(retained as f64);
}

/// Record a history truncation.
pub fn record_history_truncated() {
    counter!("clone_history_truncations_total").increment(1);
}
