//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replicator lifecycle and progress
//! - Change feed polling
//! - Revision fetch, insert and upload throughput
//! - Checkpoint saves
//! - Batch processing stats
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The `direction` label is `pull` or `push`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use doc_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_changes_received("pull", 42);
//! metrics::record_batch_flush("puller_inbox", 42, Duration::from_millis(50), true);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Replicator Metrics
// =============================================================================

/// Gauge for replicator state.
pub fn set_replicator_state(direction: &str, state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Idle" => 0.0,
        "Started" => 1.0,
        "Replicating" => 2.0,
        "Stopping" => 3.0,
        "Stopped" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_replicator_state", "direction" => direction.to_string()).set(value);
}

/// Progress gauges, mirrored from the replicator status.
pub fn set_changes_progress(direction: &str, processed: u64, total: u64) {
    gauge!("replication_changes_processed", "direction" => direction.to_string()).set(processed as f64);
    gauge!("replication_changes_total", "direction" => direction.to_string()).set(total as f64);
}

/// Changes that entered a replicator's inbox.
pub fn record_changes_received(direction: &str, count: usize) {
    counter!("replication_changes_received_total", "direction" => direction.to_string()).increment(count as u64);
}

/// Record an error by kind.
pub fn record_error(direction: &str, error_type: &str) {
    counter!(
        "replication_errors_total",
        "direction" => direction.to_string(),
        "type" => error_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// Change Feed Metrics
// =============================================================================

/// Record one `_changes` request.
pub fn record_change_feed_request(mode: &str, success: bool, changes: usize, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_change_feed_requests_total", "mode" => mode.to_string(), "status" => status).increment(1);
    counter!("replication_change_feed_changes_total", "mode" => mode.to_string()).increment(changes as u64);
    histogram!("replication_change_feed_request_seconds", "mode" => mode.to_string())
        .record(duration.as_secs_f64());
}

/// Record a change feed retry after a transient failure.
pub fn record_change_feed_retry(attempt: usize) {
    counter!("replication_change_feed_retries_total").increment(1);
    gauge!("replication_change_feed_consecutive_failures").set(attempt as f64);
}

// =============================================================================
// Pull Metrics
// =============================================================================

/// Record `find_missing_revisions` filtering of an inbox batch.
pub fn record_missing_revisions(received: usize, missing: usize) {
    counter!("replication_pull_revisions_known_total").increment(received.saturating_sub(missing) as u64);
    counter!("replication_pull_revisions_missing_total").increment(missing as u64);
}

/// Record a single revision fetch.
pub fn record_revision_fetch(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_pull_fetches_total", "status" => status).increment(1);
    histogram!("replication_pull_fetch_seconds").record(duration.as_secs_f64());
}

/// Gauge for revision fetches currently in flight.
pub fn set_fetches_in_flight(count: usize) {
    gauge!("replication_pull_fetches_in_flight").set(count as f64);
}

/// Record the outcome of an insert batch.
pub fn record_revisions_inserted(inserted: usize, forbidden: usize, failed: usize) {
    counter!("replication_pull_inserted_total").increment(inserted as u64);
    if forbidden > 0 {
        counter!("replication_pull_forbidden_total").increment(forbidden as u64);
    }
    if failed > 0 {
        counter!("replication_pull_insert_errors_total").increment(failed as u64);
    }
}

// =============================================================================
// Push Metrics
// =============================================================================

/// Record a `_revs_diff` round trip.
pub fn record_revs_diff(requested: usize, missing: usize) {
    counter!("replication_push_revs_diff_requested_total").increment(requested as u64);
    counter!("replication_push_revs_diff_missing_total").increment(missing as u64);
}

/// Record revisions uploaded, by method (`bulk_docs`, `multipart`, `json`).
pub fn record_revisions_uploaded(method: &str, count: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_push_uploaded_total",
        "method" => method.to_string(),
        "status" => status
    )
    .increment(count as u64);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record a remote checkpoint save attempt (`saved`, `conflict`, `missing`, `error`).
pub fn record_checkpoint_save(direction: &str, outcome: &str) {
    counter!(
        "replication_checkpoint_saves_total",
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record local checkpoint store retry on SQLite busy.
pub fn checkpoint_store_retries_total(operation: &str) {
    counter!("replication_checkpoint_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Batch Processing Metrics
// =============================================================================

/// Record one batcher flush.
pub fn record_batch_flush(batcher: &str, size: usize, duration: Duration, success: bool) {
    let name = batcher.to_string();

    counter!("replication_batch_items_total", "batcher" => name.clone()).increment(size as u64);
    if !success {
        counter!("replication_batch_errors_total", "batcher" => name.clone()).increment(1);
    }

    histogram!("replication_batch_flush_duration_seconds", "batcher" => name.clone())
        .record(duration.as_secs_f64());
    histogram!("replication_batch_size", "batcher" => name).record(size as f64);
}
