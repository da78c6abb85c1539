//! # tomoflow
//!
//! A streaming dataflow engine for array processing on host and
//! accelerator devices.
//!
//! A computation is a DAG of tasks. Every node runs on its own thread and
//! hands n-dimensional `f32` buffers to its successors through bounded
//! buffer pools, so a slow consumer throttles its producers.
//!
//! ## Features
//!
//! - **Dual-location buffers**: Data lives on the host, the device or both;
//!   transfers happen lazily when a task asks for the other side
//! - **Execution modes**: One output per input, many outputs per input
//!   (generate) or one output per stream (reduce)
//! - **Device mapping**: Independent branches land on distinct devices
//! - **Path splitting**: Independent device paths can be copied once per
//!   device, with inputs handed out round-robin
//! - **Simulated backend**: Runs and tests without hardware
//!
//! ## Quick Start
//!
//! ```rust
//! use tomoflow::prelude::*;
//! use tomoflow::tasks::{AppSink, NullSource};
//!
//! let sink = AppSink::new();
//! let output = sink.handle();
//!
//! let mut graph = TaskGraph::new();
//! let src = graph.add_cpu_task("src", NullSource::new(3, Requisition::new(&[4])));
//! let sink = graph.add_cpu_task("sink", sink);
//! graph.connect(src, sink).unwrap();
//!
//! let resources = Resources::new(Context::sim(1)).unwrap();
//! Scheduler::new(resources).run(&mut graph).unwrap();
//!
//! assert_eq!(output.collect().unwrap().len(), 3);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod clock;
pub mod device;
pub mod error;
pub mod group;
pub mod metadata;
pub mod observability;
pub mod pipeline;
pub mod resources;
pub mod task;
pub mod tasks;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{
        Buffer, DeviceView, DeviceViewMut, HostView, HostViewMut, Location, Requisition,
    };
    pub use crate::device::{CommandQueue, Context};
    pub use crate::error::{Error, Result};
    pub use crate::metadata::Metadata;
    pub use crate::pipeline::{Scheduler, SchedulerConfig, Split, TaskGraph};
    pub use crate::resources::Resources;
    pub use crate::task::{CpuTask, DeviceTask, Placement, Task, TaskKind, TaskMode};
}

pub use error::{Error, Result};
