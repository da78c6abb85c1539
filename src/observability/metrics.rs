//! Metrics collection using metrics-rs.

use crate::buffer::Location;
use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const TUPLES_PROCESSED: &str = "tomoflow_tuples_processed";
const BUFFERS_PUBLISHED: &str = "tomoflow_buffers_published";
const COMPUTE_TIME_NS: &str = "tomoflow_compute_time_ns";
const INPUT_WAIT_NS: &str = "tomoflow_input_wait_ns";
const TRANSFERS: &str = "tomoflow_transfers";
const TRANSFER_BYTES: &str = "tomoflow_transfer_bytes";
const GROUP_BUFFERS_ALLOCATED: &str = "tomoflow_group_buffers_allocated";
const GROUP_BUFFERS_FREE: &str = "tomoflow_group_buffers_free";
const RUNS: &str = "tomoflow_runs";
const RUN_ERRORS: &str = "tomoflow_run_errors";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before installing an exporter.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        TUPLES_PROCESSED,
        Unit::Count,
        "Number of compute steps run by a node"
    );
    metrics::describe_counter!(
        BUFFERS_PUBLISHED,
        Unit::Count,
        "Number of buffers a node published downstream"
    );
    metrics::describe_histogram!(
        COMPUTE_TIME_NS,
        Unit::Nanoseconds,
        "Time spent in a single compute step"
    );
    metrics::describe_histogram!(
        INPUT_WAIT_NS,
        Unit::Nanoseconds,
        "Time a node waited for a complete input tuple"
    );
    metrics::describe_counter!(
        TRANSFERS,
        Unit::Count,
        "Host/device synchronisations of buffer contents"
    );
    metrics::describe_counter!(
        TRANSFER_BYTES,
        Unit::Bytes,
        "Bytes moved between host and device"
    );
    metrics::describe_gauge!(
        GROUP_BUFFERS_ALLOCATED,
        Unit::Count,
        "Buffers allocated by a group"
    );
    metrics::describe_gauge!(
        GROUP_BUFFERS_FREE,
        Unit::Count,
        "Buffers in a group's free pool"
    );
    metrics::describe_counter!(RUNS, Unit::Count, "Number of graph runs");
    metrics::describe_counter!(RUN_ERRORS, Unit::Count, "Number of failed graph runs");
}

/// Record a buffer synchronised to `to`.
#[inline]
pub fn record_transfer(to: Location, bytes: usize) {
    let direction = match to {
        Location::Host => "device_to_host",
        Location::Device => "host_to_device",
    };
    counter!(TRANSFERS, "direction" => direction).increment(1);
    counter!(TRANSFER_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the pool state of a group.
#[inline]
pub fn record_group_pool(group: &str, allocated: usize, free: usize) {
    gauge!(GROUP_BUFFERS_ALLOCATED, "group" => group.to_string()).set(allocated as f64);
    gauge!(GROUP_BUFFERS_FREE, "group" => group.to_string()).set(free as f64);
}

/// Record a finished run.
#[inline]
pub fn record_run(failed: bool) {
    counter!(RUNS).increment(1);
    if failed {
        counter!(RUN_ERRORS).increment(1);
    }
}

/// Metrics collector for a single node.
///
/// Handles are created once per run so the hot loop only touches atomics.
#[derive(Clone)]
pub struct NodeMetrics {
    node: String,
    processed: Counter,
    published: Counter,
    compute_time: Histogram,
    input_wait: Histogram,
}

impl NodeMetrics {
    /// Create a collector for `node`.
    pub fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            processed: counter!(TUPLES_PROCESSED, "node" => node.to_string()),
            published: counter!(BUFFERS_PUBLISHED, "node" => node.to_string()),
            compute_time: histogram!(COMPUTE_TIME_NS, "node" => node.to_string()),
            input_wait: histogram!(INPUT_WAIT_NS, "node" => node.to_string()),
        }
    }

    /// Record one compute step.
    #[inline]
    pub fn record_processed(&self) {
        self.processed.increment(1);
    }

    /// Record one published buffer.
    #[inline]
    pub fn record_published(&self) {
        self.published.increment(1);
    }

    /// Record compute time.
    #[inline]
    pub fn record_compute_time(&self, duration: Duration) {
        self.compute_time.record(duration.as_nanos() as f64);
    }

    /// Record time spent waiting for inputs.
    #[inline]
    pub fn record_input_wait(&self, duration: Duration) {
        self.input_wait.record(duration.as_nanos() as f64);
    }

    /// Start a timer and return a guard that records compute time on drop.
    pub fn start_timer(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// Get the node name.
    pub fn node(&self) -> &str {
        &self.node
    }
}

/// Guard that records compute time when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    metrics: &'a NodeMetrics,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_compute_time(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_node_metrics() {
        let metrics = NodeMetrics::new("backproject");

        metrics.record_processed();
        metrics.record_published();
        metrics.record_compute_time(Duration::from_micros(50));
        metrics.record_input_wait(Duration::from_micros(5));

        assert_eq!(metrics.node(), "backproject");
    }

    #[test]
    fn test_timer_guard() {
        let metrics = NodeMetrics::new("timer-test");
        {
            let _timer = metrics.start_timer();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_global_recording_functions() {
        // No recorder installed: must be no-ops.
        record_transfer(Location::Device, 1024);
        record_transfer(Location::Host, 1024);
        record_group_pool("reader", 4, 1);
        record_run(false);
        record_run(true);
    }
}
