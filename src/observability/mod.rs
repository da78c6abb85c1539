//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `tomoflow_tuples_processed` | Counter | Compute steps per node |
//! | `tomoflow_buffers_published` | Counter | Buffers published per node |
//! | `tomoflow_compute_time_ns` | Histogram | Time per compute step |
//! | `tomoflow_input_wait_ns` | Histogram | Time waiting for an input tuple |
//! | `tomoflow_transfers` | Counter | Host/device synchronisations |
//! | `tomoflow_transfer_bytes` | Counter | Bytes moved between host and device |
//! | `tomoflow_group_buffers_allocated` | Gauge | Buffers allocated per group |
//! | `tomoflow_group_buffers_free` | Gauge | Free buffers per group |
//! | `tomoflow_runs` / `tomoflow_run_errors` | Counter | Graph runs and failures |
//!
//! Nothing is exported unless the application installs a recorder.
//!
//! ## Tracing
//!
//! The scheduler emits a `run` span around each run and a `node` span per
//! node thread, see [`TracingConfig`].

mod metrics;
mod tracing_support;

pub use metrics::{
    NodeMetrics, TimerGuard, init_metrics, record_group_pool, record_run, record_transfer,
};
pub use tracing_support::{TracingConfig, node_span, run_span, span_node, span_run};
