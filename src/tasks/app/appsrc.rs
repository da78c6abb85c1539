//! AppSrc task for injecting data from application code.

use super::HostArray;
use crate::buffer::{HostView, HostViewMut, Requisition};
use crate::error::{Error, Result};
use crate::task::{CpuTask, Task};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A root task that publishes the arrays the application pushes.
///
/// Each pushed array becomes one output buffer of the array's shape. The
/// node finishes once the application ends the stream and the queue is
/// drained, so a run containing an `AppSrc` only completes after
/// [`AppSrcHandle::end_stream`] (or [`AppSrcHandle::set_flushing`]).
///
/// # Example
///
/// ```rust
/// use tomoflow::tasks::{AppSrc, HostArray};
///
/// let src = AppSrc::new();
/// let handle = src.handle();
///
/// handle.push(HostArray::from_vec(vec![1.0, 2.0]).unwrap()).unwrap();
/// handle.end_stream();
/// assert_eq!(src.stats().total_pushed, 1);
/// ```
pub struct AppSrc {
    inner: Arc<AppSrcInner>,
}

struct AppSrcInner {
    state: Mutex<AppSrcState>,
    data_available: Condvar,
    space_available: Condvar,
}

struct AppSrcState {
    queue: VecDeque<HostArray>,
    max_buffers: usize,
    eos: bool,
    flushing: bool,
    total_pushed: u64,
    total_produced: u64,
}

/// Handle for pushing data into an AppSrc.
///
/// This handle can be cloned and sent to other threads.
#[derive(Clone)]
pub struct AppSrcHandle {
    inner: Arc<AppSrcInner>,
}

impl AppSrc {
    /// Create a new AppSrc with default settings.
    pub fn new() -> Self {
        Self::with_max_buffers(64)
    }

    /// Create a new AppSrc with a specific queue size.
    pub fn with_max_buffers(max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(AppSrcInner {
                state: Mutex::new(AppSrcState {
                    queue: VecDeque::with_capacity(max_buffers.min(256)),
                    max_buffers: max_buffers.max(1),
                    eos: false,
                    flushing: false,
                    total_pushed: 0,
                    total_produced: 0,
                }),
                data_available: Condvar::new(),
                space_available: Condvar::new(),
            }),
        }
    }

    /// Get a handle for pushing data into this source.
    pub fn handle(&self) -> AppSrcHandle {
        AppSrcHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Get statistics.
    pub fn stats(&self) -> AppSrcStats {
        let state = self.inner.state.lock().unwrap();
        AppSrcStats {
            queued_buffers: state.queue.len(),
            total_pushed: state.total_pushed,
            total_produced: state.total_produced,
            eos: state.eos,
        }
    }
}

impl Default for AppSrc {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for AppSrc {
    fn input_arity(&self) -> usize {
        0
    }

    /// Waits for the next array; an empty requisition once the stream ended.
    fn negotiate_output_shape(&mut self, _inputs: &[Requisition]) -> Result<Requisition> {
        let mut state = self.inner.state.lock().unwrap();

        while state.queue.is_empty() && !state.eos && !state.flushing {
            state = self.inner.data_available.wait(state).unwrap();
        }

        if state.flushing {
            return Err(Error::compute("appsrc is flushing"));
        }

        Ok(state
            .queue
            .front()
            .map(|array| array.requisition)
            .unwrap_or(Requisition::NONE))
    }
}

impl CpuTask for AppSrc {
    fn compute(
        &mut self,
        _inputs: &[HostView<'_>],
        output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let Some(mut output) = output else {
            return Ok(false);
        };

        let array = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(array) = state.queue.pop_front() else {
                return Ok(false);
            };
            state.total_produced += 1;
            self.inner.space_available.notify_one();
            array
        };

        if array.data.len() != output.data_mut().len() {
            return Err(Error::compute("appsrc array does not match output shape"));
        }
        output.data_mut().copy_from_slice(&array.data);
        output.metadata_mut().merge_from(&array.metadata);
        Ok(true)
    }
}

impl AppSrcHandle {
    /// Push an array into the source.
    ///
    /// This blocks while the internal queue is full.
    pub fn push(&self, array: HostArray) -> Result<()> {
        self.push_timeout(array, None)
    }

    /// Push raw data of the given shape.
    pub fn push_data(&self, requisition: Requisition, data: Vec<f32>) -> Result<()> {
        self.push(HostArray::new(requisition, data)?)
    }

    /// Push an array with a timeout.
    pub fn push_timeout(&self, array: HostArray, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();

        if state.eos {
            return Err(Error::compute("appsrc is at EOS"));
        }

        while state.queue.len() >= state.max_buffers && !state.flushing {
            state = if let Some(t) = timeout {
                let (s, result) = self.inner.space_available.wait_timeout(state, t).unwrap();
                if result.timed_out() {
                    return Err(Error::compute("appsrc push timeout"));
                }
                s
            } else {
                self.inner.space_available.wait(state).unwrap()
            };
        }

        if state.flushing {
            return Err(Error::compute("appsrc is flushing"));
        }

        state.queue.push_back(array);
        state.total_pushed += 1;

        self.inner.data_available.notify_one();
        Ok(())
    }

    /// Signal end of stream.
    ///
    /// Arrays already queued are still published. After calling this, no
    /// more arrays can be pushed.
    pub fn end_stream(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.eos = true;
        self.inner.data_available.notify_all();
    }

    /// Set flushing mode: pending and future pushes fail, and the source
    /// node fails, which aborts the run.
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

    /// Check if the queue is full.
    pub fn is_full(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.queue.len() >= state.max_buffers
    }
}

/// Statistics about AppSrc operation.
#[derive(Debug, Clone, Copy)]
pub struct AppSrcStats {
    /// Number of arrays currently queued.
    pub queued_buffers: usize,
    /// Total arrays pushed by the application.
    pub total_pushed: u64,
    /// Total buffers published into the graph.
    pub total_produced: u64,
    /// Whether EOS has been signaled.
    pub eos: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::device::Context;
    use std::thread;

    fn array(value: f32) -> HostArray {
        HostArray::from_vec(vec![value; 3]).unwrap()
    }

    /// Drive the source the way a root node does: negotiate, then compute.
    fn produce(src: &mut AppSrc) -> Option<Vec<f32>> {
        let requisition = src.negotiate_output_shape(&[]).unwrap();
        if requisition.is_none() {
            assert!(!src.compute(&[], None, &requisition).unwrap());
            return None;
        }

        let ctx = Context::sim(1);
        let queue = ctx.queue(0).unwrap();
        let mut buffer = Buffer::new(requisition, &ctx).unwrap();
        let view = buffer.host_view_mut(&queue).unwrap();
        assert!(src.compute(&[], Some(view), &requisition).unwrap());
        Some(buffer.host_view(&queue).unwrap().data().to_vec())
    }

    #[test]
    fn test_appsrc_push_produce() {
        let mut src = AppSrc::new();
        let handle = src.handle();

        handle.push(array(1.0)).unwrap();
        handle.push(array(2.0)).unwrap();
        assert_eq!(handle.queue_len(), 2);

        assert_eq!(produce(&mut src), Some(vec![1.0; 3]));
        assert_eq!(produce(&mut src), Some(vec![2.0; 3]));
    }

    #[test]
    fn test_appsrc_eos() {
        let mut src = AppSrc::new();
        let handle = src.handle();

        handle.push(array(1.0)).unwrap();
        handle.end_stream();

        // Queued data is still delivered.
        assert!(produce(&mut src).is_some());
        assert!(produce(&mut src).is_none());
        assert!(src.stats().eos);
    }

    #[test]
    fn test_appsrc_push_after_eos() {
        let src = AppSrc::new();
        let handle = src.handle();
        handle.end_stream();
        assert!(handle.push(array(0.0)).is_err());
    }

    #[test]
    fn test_appsrc_flushing_fails_negotiation() {
        let mut src = AppSrc::new();
        src.handle().set_flushing(true);
        assert!(src.negotiate_output_shape(&[]).is_err());
    }

    #[test]
    fn test_appsrc_push_timeout_when_full() {
        let src = AppSrc::with_max_buffers(1);
        let handle = src.handle();
        handle.push(array(0.0)).unwrap();
        assert!(handle.is_full());

        let result = handle.push_timeout(array(1.0), Some(Duration::from_millis(10)));
        assert!(result.is_err());
    }

    #[test]
    fn test_appsrc_multithreaded() {
        let mut src = AppSrc::with_max_buffers(2);
        let handle = src.handle();

        let producer = thread::spawn(move || {
            for i in 0..10 {
                handle.push(array(i as f32)).unwrap();
            }
            handle.end_stream();
        });

        let mut received = Vec::new();
        while let Some(data) = produce(&mut src) {
            received.push(data[0]);
        }

        producer.join().unwrap();
        assert_eq!(received, (0..10).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(src.stats().total_produced, 10);
    }
}
