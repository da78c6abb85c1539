//! Null tasks - NullSink and NullSource.

use crate::buffer::{HostView, HostViewMut, Requisition};
use crate::error::Result;
use crate::task::{CpuTask, Task};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A leaf task that discards all buffers.
///
/// This is useful for:
/// - Benchmarking pipeline throughput
/// - Draining a graph without side effects
///
/// The count is shared, so it can be read after the task has been moved
/// into a graph.
///
/// # Example
///
/// ```rust
/// use tomoflow::tasks::NullSink;
///
/// let sink = NullSink::new();
/// let consumed = sink.counter();
/// assert_eq!(consumed.load(std::sync::atomic::Ordering::Relaxed), 0);
/// ```
#[derive(Debug, Default)]
pub struct NullSink {
    count: Arc<AtomicU64>,
}

impl NullSink {
    /// Create a new NullSink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of buffers consumed.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Shared handle on the consumed-buffer count.
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.count)
    }
}

impl Task for NullSink {
    fn input_arity(&self) -> usize {
        1
    }

    fn negotiate_output_shape(&mut self, _inputs: &[Requisition]) -> Result<Requisition> {
        Ok(Requisition::NONE)
    }
}

impl CpuTask for NullSink {
    fn compute(
        &mut self,
        _inputs: &[HostView<'_>],
        _output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}

/// A root task that produces a fixed number of constant-filled buffers.
///
/// # Example
///
/// ```rust
/// use tomoflow::buffer::Requisition;
/// use tomoflow::tasks::NullSource;
///
/// let source = NullSource::new(5, Requisition::new(&[64, 64]));
/// assert_eq!(source.remaining(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct NullSource {
    /// Number of buffers to produce.
    count: u64,
    /// Buffers produced so far.
    current: u64,
    requisition: Requisition,
    value: f32,
}

impl NullSource {
    /// Create a source producing `count` zero-filled buffers of the given shape.
    pub fn new(count: u64, requisition: Requisition) -> Self {
        Self {
            count,
            current: 0,
            requisition,
            value: 0.0,
        }
    }

    /// Fill the buffers with `value` instead of zero.
    pub fn with_value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }

    /// Buffers still to be produced.
    pub fn remaining(&self) -> u64 {
        self.count - self.current
    }
}

impl Task for NullSource {
    fn input_arity(&self) -> usize {
        0
    }

    fn negotiate_output_shape(&mut self, _inputs: &[Requisition]) -> Result<Requisition> {
        if self.current >= self.count {
            return Ok(Requisition::NONE);
        }
        Ok(self.requisition)
    }
}

impl CpuTask for NullSource {
    fn compute(
        &mut self,
        _inputs: &[HostView<'_>],
        output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let Some(mut output) = output else {
            return Ok(false);
        };
        if self.current >= self.count {
            return Ok(false);
        }

        output.data_mut().fill(self.value);
        self.current += 1;
        Ok(true)
    }
}
