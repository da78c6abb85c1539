//! The task contract: what a pipeline stage must implement.
//!
//! Every stage implements [`Task`] (arity, modes, shape negotiation) plus
//! one of the placement traits:
//!
//! - [`CpuTask`]: computes on host memory; the scheduler makes every buffer
//!   host-authoritative before calling it
//! - [`DeviceTask`]: computes on device memory through the command queue of
//!   the resource the node was mapped to
//!
//! The scheduler dispatches on [`TaskKind`] to decide which view of a
//! buffer it forces before `compute`.
//!
//! # Example
//!
//! ```rust
//! use tomoflow::buffer::{HostView, HostViewMut, Requisition};
//! use tomoflow::error::{Error, Result};
//! use tomoflow::task::{CpuTask, Task};
//!
//! /// Multiplies every element by two.
//! struct Double;
//!
//! impl Task for Double {
//!     fn input_arity(&self) -> usize {
//!         1
//!     }
//!
//!     fn negotiate_output_shape(&mut self, inputs: &[Requisition]) -> Result<Requisition> {
//!         inputs.first().copied().ok_or_else(|| Error::shape("no input"))
//!     }
//! }
//!
//! impl CpuTask for Double {
//!     fn compute(
//!         &mut self,
//!         inputs: &[HostView<'_>],
//!         output: Option<HostViewMut<'_>>,
//!         _requisition: &Requisition,
//!     ) -> Result<bool> {
//!         if let Some(mut out) = output {
//!             for (o, i) in out.data_mut().iter_mut().zip(inputs[0].data()) {
//!                 *o = 2.0 * i;
//!             }
//!         }
//!         Ok(true)
//!     }
//! }
//! ```

use crate::buffer::{DeviceView, DeviceViewMut, HostView, HostViewMut, Location, Requisition};
use crate::device::CommandQueue;
use crate::error::Result;
use crate::resources::Resources;

/// How a task turns input tuples into outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskMode {
    /// One `compute` per input tuple, one output per tuple.
    #[default]
    Single,
    /// One `compute` per input tuple, then `generate` until it returns
    /// `false`; each successful `generate` publishes one output.
    Generate,
    /// `compute` accumulates every tuple into the same output; after the
    /// inputs end, `finalize` runs once and that output is published.
    Reduce,
}

/// Which memory a task computes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Host memory.
    Cpu,
    /// Accelerator memory.
    Device,
}

impl Placement {
    /// Buffer location the scheduler forces before `compute`.
    pub fn location(self) -> Location {
        match self {
            Placement::Cpu => Location::Host,
            Placement::Device => Location::Device,
        }
    }
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Placement::Cpu => write!(f, "cpu"),
            Placement::Device => write!(f, "device"),
        }
    }
}

/// Placement-independent part of the task contract.
pub trait Task: Send {
    /// Acquire whatever the task needs from the run's resources.
    ///
    /// Called once per run before any node thread starts. An error aborts
    /// the run.
    fn setup(&mut self, _resources: &Resources) -> Result<()> {
        Ok(())
    }

    /// Number of input ports.
    fn input_arity(&self) -> usize;

    /// Expected rank of the buffers arriving on `port`, if the task cares.
    fn input_rank(&self, _port: usize) -> Option<usize> {
        None
    }

    /// Execution mode.
    fn mode(&self) -> TaskMode {
        TaskMode::Single
    }

    /// Shape of the output for the given input shapes (one per port).
    ///
    /// Return [`Requisition::NONE`] for a task that publishes nothing.
    fn negotiate_output_shape(&mut self, inputs: &[Requisition]) -> Result<Requisition>;

    /// Called once when the node's inputs have reached end-of-stream.
    fn inputs_stopped(&mut self) {}
}

/// A task computing on host memory.
pub trait CpuTask: Task {
    /// Process one input tuple.
    ///
    /// `output` is `None` when the negotiated requisition has rank 0, and
    /// always `None` for [`TaskMode::Generate`]. Returning `false` stops
    /// the node.
    fn compute(
        &mut self,
        inputs: &[HostView<'_>],
        output: Option<HostViewMut<'_>>,
        requisition: &Requisition,
    ) -> Result<bool>;

    /// Produce the next output of a [`TaskMode::Generate`] task.
    ///
    /// Returns `false` when nothing more is produced for the current tuple.
    fn generate(&mut self, _output: HostViewMut<'_>, _requisition: &Requisition) -> Result<bool> {
        Ok(false)
    }

    /// Complete the accumulated output of a [`TaskMode::Reduce`] task.
    fn finalize(
        &mut self,
        _output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<()> {
        Ok(())
    }
}

/// A task computing on accelerator memory.
pub trait DeviceTask: Task {
    /// Process one input tuple on the device behind `queue`.
    ///
    /// Same contract as [`CpuTask::compute`].
    fn compute(
        &mut self,
        inputs: &[DeviceView<'_>],
        output: Option<DeviceViewMut<'_>>,
        requisition: &Requisition,
        queue: &CommandQueue,
    ) -> Result<bool>;

    /// Produce the next output of a [`TaskMode::Generate`] task.
    fn generate(
        &mut self,
        _output: DeviceViewMut<'_>,
        _requisition: &Requisition,
        _queue: &CommandQueue,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Complete the accumulated output of a [`TaskMode::Reduce`] task.
    fn finalize(
        &mut self,
        _output: Option<DeviceViewMut<'_>>,
        _requisition: &Requisition,
        _queue: &CommandQueue,
    ) -> Result<()> {
        Ok(())
    }

    /// A fresh copy of this task for a duplicated path.
    ///
    /// The copy is set up independently and must not share mutable state
    /// with the original.
    fn duplicate(&self) -> Box<dyn DeviceTask>;
}

/// A task together with its placement.
pub enum TaskKind {
    /// Host task.
    Cpu(Box<dyn CpuTask>),
    /// Device task.
    Device(Box<dyn DeviceTask>),
}

impl TaskKind {
    /// Wrap a host task.
    pub fn cpu(task: impl CpuTask + 'static) -> Self {
        TaskKind::Cpu(Box::new(task))
    }

    /// Wrap a device task.
    pub fn device(task: impl DeviceTask + 'static) -> Self {
        TaskKind::Device(Box::new(task))
    }

    /// Placement of the wrapped task.
    pub fn placement(&self) -> Placement {
        match self {
            TaskKind::Cpu(_) => Placement::Cpu,
            TaskKind::Device(_) => Placement::Device,
        }
    }

    /// See [`Task::setup`].
    pub fn setup(&mut self, resources: &Resources) -> Result<()> {
        match self {
            TaskKind::Cpu(t) => t.setup(resources),
            TaskKind::Device(t) => t.setup(resources),
        }
    }

    /// See [`Task::input_arity`].
    pub fn input_arity(&self) -> usize {
        match self {
            TaskKind::Cpu(t) => t.input_arity(),
            TaskKind::Device(t) => t.input_arity(),
        }
    }

    /// See [`Task::input_rank`].
    pub fn input_rank(&self, port: usize) -> Option<usize> {
        match self {
            TaskKind::Cpu(t) => t.input_rank(port),
            TaskKind::Device(t) => t.input_rank(port),
        }
    }

    /// See [`Task::mode`].
    pub fn mode(&self) -> TaskMode {
        match self {
            TaskKind::Cpu(t) => t.mode(),
            TaskKind::Device(t) => t.mode(),
        }
    }

    /// See [`Task::negotiate_output_shape`].
    pub fn negotiate_output_shape(&mut self, inputs: &[Requisition]) -> Result<Requisition> {
        match self {
            TaskKind::Cpu(t) => t.negotiate_output_shape(inputs),
            TaskKind::Device(t) => t.negotiate_output_shape(inputs),
        }
    }

    /// See [`Task::inputs_stopped`].
    pub fn inputs_stopped(&mut self) {
        match self {
            TaskKind::Cpu(t) => t.inputs_stopped(),
            TaskKind::Device(t) => t.inputs_stopped(),
        }
    }

    /// Copy for a duplicated path. Host tasks cannot be duplicated.
    pub fn duplicate(&self) -> Option<TaskKind> {
        match self {
            TaskKind::Cpu(_) => None,
            TaskKind::Device(t) => Some(TaskKind::Device(t.duplicate())),
        }
    }
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskKind")
            .field("placement", &self.placement())
            .field("arity", &self.input_arity())
            .field("mode", &self.mode())
            .finish()
    }
}
