//! AppSink task for extracting data into application code.

use super::HostArray;
use crate::buffer::{HostView, HostViewMut, Requisition};
use crate::error::{Error, Result};
use crate::task::{CpuTask, Task};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A leaf task that copies every input buffer out of the graph.
///
/// The node publishes nothing. Applications read the copies through an
/// [`AppSinkHandle`], from any thread, while the run is in progress.
///
/// # Example
///
/// ```rust
/// use tomoflow::tasks::AppSink;
///
/// let sink = AppSink::new();
/// let handle = sink.handle();
///
/// assert!(handle.try_pull().is_none());
/// ```
pub struct AppSink {
    inner: Arc<AppSinkInner>,
}

struct AppSinkInner {
    state: Mutex<AppSinkState>,
    data_available: Condvar,
    space_available: Condvar,
}

struct AppSinkState {
    queue: VecDeque<HostArray>,
    max_buffers: usize,
    eos: bool,
    flushing: bool,
    drop_on_full: bool,
    total_received: u64,
    total_dropped: u64,
}

/// Handle for pulling data from an AppSink.
///
/// This handle can be cloned and sent to other threads.
#[derive(Clone)]
pub struct AppSinkHandle {
    inner: Arc<AppSinkInner>,
}

impl AppSink {
    /// Create a new AppSink with default settings.
    pub fn new() -> Self {
        Self::with_max_buffers(64)
    }

    /// Create a new AppSink with a specific queue size.
    pub fn with_max_buffers(max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(AppSinkInner {
                state: Mutex::new(AppSinkState {
                    queue: VecDeque::with_capacity(max_buffers.min(256)),
                    max_buffers: max_buffers.max(1),
                    eos: false,
                    flushing: false,
                    drop_on_full: false,
                    total_received: 0,
                    total_dropped: 0,
                }),
                data_available: Condvar::new(),
                space_available: Condvar::new(),
            }),
        }
    }

    /// Drop the oldest queued array instead of blocking when the queue is full.
    pub fn drop_on_full(self, drop: bool) -> Self {
        self.inner.state.lock().unwrap().drop_on_full = drop;
        self
    }

    /// Get a handle for pulling data from this sink.
    pub fn handle(&self) -> AppSinkHandle {
        AppSinkHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> AppSinkStats {
        let state = self.inner.state.lock().unwrap();
        AppSinkStats {
            queued_buffers: state.queue.len(),
            total_received: state.total_received,
            total_dropped: state.total_dropped,
            eos: state.eos,
        }
    }
}

impl Default for AppSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for AppSink {
    fn input_arity(&self) -> usize {
        1
    }

    fn negotiate_output_shape(&mut self, _inputs: &[Requisition]) -> Result<Requisition> {
        Ok(Requisition::NONE)
    }

    fn inputs_stopped(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        state.eos = true;
        self.inner.data_available.notify_all();
    }
}

impl CpuTask for AppSink {
    fn compute(
        &mut self,
        inputs: &[HostView<'_>],
        _output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let input = &inputs[0];
        let array = HostArray {
            requisition: *input.requisition(),
            data: input.data().to_vec(),
            metadata: input.metadata().clone(),
        };

        let mut state = self.inner.state.lock().unwrap();
        while state.queue.len() >= state.max_buffers && !state.flushing {
            if state.drop_on_full {
                state.queue.pop_front();
                state.total_dropped += 1;
                break;
            }
            state = self.inner.space_available.wait(state).unwrap();
        }

        if state.flushing {
            return Err(Error::compute("appsink is flushing"));
        }

        state.queue.push_back(array);
        state.total_received += 1;
        self.inner.data_available.notify_one();
        Ok(true)
    }
}

impl AppSinkHandle {
    /// Pull the next array, blocking until one is available.
    ///
    /// Returns `Ok(None)` once the stream ended and the queue is drained.
    pub fn pull(&self) -> Result<Option<HostArray>> {
        self.pull_timeout(None)
    }

    /// Pull with an optional timeout.
    ///
    /// Returns `Ok(None)` at end of stream and an error on timeout.
    pub fn pull_timeout(&self, timeout: Option<Duration>) -> Result<Option<HostArray>> {
        let mut state = self.inner.state.lock().unwrap();

        while state.queue.is_empty() && !state.eos && !state.flushing {
            state = if let Some(t) = timeout {
                let (s, result) = self.inner.data_available.wait_timeout(state, t).unwrap();
                if result.timed_out() && s.queue.is_empty() && !s.eos {
                    return Err(Error::compute("appsink pull timeout"));
                }
                s
            } else {
                self.inner.data_available.wait(state).unwrap()
            };
        }

        if state.flushing {
            return Err(Error::compute("appsink is flushing"));
        }

        let array = state.queue.pop_front();
        if array.is_some() {
            self.inner.space_available.notify_one();
        }
        Ok(array)
    }

    /// Pull without blocking.
    pub fn try_pull(&self) -> Option<HostArray> {
        let mut state = self.inner.state.lock().unwrap();
        let array = state.queue.pop_front();
        if array.is_some() {
            self.inner.space_available.notify_one();
        }
        array
    }

    /// Drain everything until end of stream.
    pub fn collect(&self) -> Result<Vec<HostArray>> {
        let mut arrays = Vec::new();
        while let Some(array) = self.pull()? {
            arrays.push(array);
        }
        Ok(arrays)
    }

    /// Set flushing mode: blocked pulls return an error and the sink node
    /// fails on its next input.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.flushing = flushing;
        if flushing {
            self.inner.data_available.notify_all();
            self.inner.space_available.notify_all();
        }
    }

    /// Get the current queue length.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Check if the upstream stream has ended.
    pub fn is_eos(&self) -> bool {
        self.inner.state.lock().unwrap().eos
    }
}

/// Statistics about AppSink operation.
#[derive(Debug, Clone, Copy)]
pub struct AppSinkStats {
    /// Number of arrays currently queued.
    pub queued_buffers: usize,
    /// Total arrays received from the graph.
    pub total_received: u64,
    /// Arrays dropped because the queue was full.
    pub total_dropped: u64,
    /// Whether the inputs have stopped.
    pub eos: bool,
}
