//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create a span around a whole run.
    pub run_spans: bool,
    /// Whether to create a span for each node thread.
    pub node_spans: bool,
    /// Whether to log every compute step.
    pub step_events: bool,
    /// Default span level.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            run_spans: true,
            node_spans: true,
            step_events: false, // Can be expensive
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Create a new tracing config with everything enabled.
    pub fn all() -> Self {
        Self {
            run_spans: true,
            node_spans: true,
            step_events: true,
            level: Level::DEBUG,
        }
    }

    /// Create a minimal config (run spans only).
    pub fn minimal() -> Self {
        Self {
            run_spans: true,
            node_spans: false,
            step_events: false,
            level: Level::INFO,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            run_spans: false,
            node_spans: false,
            step_events: false,
            level: Level::INFO,
        }
    }
}

/// Create a span for a graph run.
///
/// # Example
///
/// ```rust
/// use tomoflow::observability::span_run;
///
/// let span = span_run(4);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_run(nodes: usize) -> Span {
    span!(Level::INFO, "run", nodes = nodes)
}

/// Create a span for one node thread.
#[inline]
pub fn span_node(node: &str, placement: &str, mode: &str) -> Span {
    span!(
        Level::DEBUG,
        "node",
        node = %node,
        placement = %placement,
        mode = %mode
    )
}

/// Span for `node` if enabled in `config`, a disabled span otherwise.
pub fn node_span(config: &TracingConfig, node: &str, placement: &str, mode: &str) -> Span {
    if config.node_spans {
        span_node(node, placement, mode)
    } else {
        Span::none()
    }
}

/// Span for a run if enabled in `config`, a disabled span otherwise.
pub fn run_span(config: &TracingConfig, nodes: usize) -> Span {
    if config.run_spans {
        span_run(nodes)
    } else {
        Span::none()
    }
}
