// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the recorder.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host
//! application chooses the exporter (Prometheus, OTEL, etc.); without one
//! installed every call is a no-op.
//!
//! # Metric Naming Convention
//! - `scope_recorder_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: direct, buffered
//! - `entry_type`: request, query, ...
//! - `stage`: where a capture failed (write, update, context)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// An entry accepted by a backend (durable for direct, enqueued for buffered)
pub fn record_entry_written(backend: &str, entry_type: &str) {
    counter!(
        "scope_recorder_entries_written_total",
        "backend" => backend.to_string(),
        "entry_type" => entry_type.to_string()
    )
    .increment(1);
}

/// A capture-path error swallowed before reaching the host application
pub fn record_capture_failure(stage: &str) {
    counter!(
        "scope_recorder_capture_failures_total",
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Event skipped by `should_record` or because capture is disabled
pub fn record_capture_skipped(reason: &str) {
    counter!(
        "scope_recorder_capture_skipped_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Entries made durable by one flush batch
pub fn record_flush_batch(count: usize) {
    histogram!("scope_recorder_flush_batch_size").record(count as f64);
    counter!("scope_recorder_flushed_entries_total").increment(count as u64);
}

/// One retry of a backend operation after a transient failure
pub fn record_retry(operation: &str) {
    counter!(
        "scope_recorder_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// A flush run that stopped at the retry ceiling
pub fn record_flush_halt() {
    counter!("scope_recorder_flush_halts_total").increment(1);
}

pub fn record_flush_duration(duration: Duration) {
    histogram!("scope_recorder_flush_seconds").record(duration.as_secs_f64());
}

/// Pending update merged (`applied`) or dropped for lack of a target
pub fn record_update(applied: bool) {
    counter!(
        "scope_recorder_updates_total",
        "outcome" => if applied { "applied" } else { "dropped" }
    )
    .increment(1);
}

pub fn record_swept(count: u64) {
    counter!("scope_recorder_swept_entries_total").increment(count);
}

/// Entries still waiting in the buffer
pub fn set_buffer_pending(count: u64) {
    gauge!("scope_recorder_buffer_pending").set(count as f64);
}

pub fn set_backend_ready(backend: &str, ready: bool) {
    gauge!(
        "scope_recorder_backend_ready",
        "backend" => backend.to_string()
    )
    .set(if ready { 1.0 } else { 0.0 });
}

/// Capture latency as seen by the instrumented application
pub fn record_capture_latency(backend: &str, duration: Duration) {
    histogram!(
        "scope_recorder_capture_seconds",
        "backend" => backend.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records capture latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_capture_latency(self.backend, self.start.elapsed());
    }
}
