//! Task graph construction and execution.
//!
//! This module provides the core pipeline infrastructure:
//!
//! - [`TaskGraph`]: The DAG of task nodes, with device mapping and path
//!   splitting
//! - [`TaskNode`]: A node in the graph (wraps a task)
//! - [`Scheduler`]: Runs a graph with one thread per node
//! - [`RunEvent`]: Lifecycle events emitted during a run
//!
//! # Example
//!
//! ```rust,ignore
//! use tomoflow::prelude::*;
//!
//! let mut graph = TaskGraph::new();
//!
//! let reader = graph.add_cpu_task("reader", Reader::new("slices/"));
//! let filter = graph.add_device_task("filter", RampFilter::new());
//! let backproject = graph.add_device_task("backproject", Backproject::new());
//! let writer = graph.add_cpu_task("writer", Writer::new("volume/"));
//!
//! graph.connect(reader, filter)?;
//! graph.connect(filter, backproject)?;
//! graph.connect(backproject, writer)?;
//!
//! let config = SchedulerConfig::default().with_split(Split::Auto);
//! let report = Scheduler::with_config(resources, config).run(&mut graph)?;
//! ```

mod events;
mod graph;
mod mapping;
mod node;
mod port;
mod scheduler;
mod worker;

pub use events::{EventReceiver, EventSender, RunEvent};
pub use graph::{NodeId, TaskGraph};
pub use node::{SendPattern, TaskNode};
pub use scheduler::{NodeStats, RunReport, Scheduler, SchedulerConfig, Split};
