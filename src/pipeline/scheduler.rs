//! Thread-per-node scheduler.
//!
//! # Run sequence
//!
//! 1. Validate the graph, optionally [split](TaskGraph::split) it, then
//!    [map](TaskGraph::map) device nodes onto processing resources.
//! 2. Call `setup` on every task. Any failure aborts before a thread starts.
//! 3. Create one output [`Group`] per node and register every consumer on
//!    the declared port it reads. Consumers of one producer that are split
//!    copies of the same node share a lane and take turns; all other
//!    consumers each receive every buffer unless the producer scatters or
//!    sends sequentially.
//! 4. Spawn one named thread per node, join them all and hand every task
//!    back to its node.
//!
//! The first error raised by any node aborts the whole run: all groups are
//! aborted, blocked threads wake up and wind down, and `run` returns that
//! error.
//!
//! # Example
//!
//! ```rust
//! use tomoflow::prelude::*;
//! use tomoflow::tasks::{AppSink, AppSrc};
//!
//! let src = AppSrc::new();
//! let input = src.handle();
//! let sink = AppSink::new();
//! let output = sink.handle();
//!
//! let mut graph = TaskGraph::new();
//! let src = graph.add_cpu_task("src", src);
//! let sink = graph.add_cpu_task("sink", sink);
//! graph.connect(src, sink).unwrap();
//!
//! input.push_data(Requisition::new(&[2]), vec![1.0, 2.0]).unwrap();
//! input.end_stream();
//!
//! let resources = Resources::new(Context::sim(1)).unwrap();
//! let report = Scheduler::new(resources).run(&mut graph).unwrap();
//!
//! assert_eq!(output.pull().unwrap().unwrap().data, vec![1.0, 2.0]);
//! assert_eq!(report.node("src").unwrap().published, 1);
//! ```

use super::events::{EventReceiver, EventSender, RunEvent};
use super::graph::{NodeId, TaskGraph};
use super::node::SendPattern;
use super::port::InputPort;
use super::worker::{NodeSetup, RunControl, Worker, WorkerOptions};
use crate::clock::wall_clock;
use crate::error::{Error, Result};
use crate::group::{self, Group, LaneKey, Signal};
use crate::observability::{self, TracingConfig, run_span};
use crate::resources::Resources;
use crate::task::Placement;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Whether and how the scheduler splits device paths before a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Split {
    /// Run the graph as built.
    #[default]
    Off,
    /// One copy of every independent device path per local device.
    Auto,
    /// The given number of copies.
    Replicas(usize),
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of buffers in each node's output pool.
    ///
    /// Raised to one more than the number of consumers where needed.
    /// Default is 4.
    pub group_capacity: usize,
    /// Path splitting before the run.
    pub split: Split,
    /// Reject inputs whose rank differs from [`Task::input_rank`].
    ///
    /// [`Task::input_rank`]: crate::task::Task::input_rank
    pub strict_ranks: bool,
    /// Stamp a `timestamp` entry on every buffer a root publishes.
    pub timestamps: bool,
    /// Prefix of node thread names (`<prefix>-<node>`).
    pub thread_name_prefix: String,
    /// Span configuration.
    pub tracing: TracingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            group_capacity: group::DEFAULT_CAPACITY,
            split: Split::Off,
            strict_ranks: false,
            timestamps: false,
            thread_name_prefix: "tomoflow".to_string(),
            tracing: TracingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Set the output pool capacity.
    pub fn with_group_capacity(mut self, capacity: usize) -> Self {
        self.group_capacity = capacity;
        self
    }

    /// Set the split policy.
    pub fn with_split(mut self, split: Split) -> Self {
        self.split = split;
        self
    }

    /// Enable or disable strict input rank checking.
    pub fn with_strict_ranks(mut self, strict: bool) -> Self {
        self.strict_ranks = strict;
        self
    }

    /// Enable or disable root timestamps.
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the tracing configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}

/// What one node did during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    /// Node name.
    pub name: String,
    /// Where the node computed.
    pub placement: Placement,
    /// Number of compute steps.
    pub processed: u64,
    /// Number of buffers published.
    pub published: u64,
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Wall time from validation to the last thread joined.
    pub elapsed: Duration,
    /// Per-node statistics in node id order.
    pub nodes: Vec<NodeStats>,
}

impl RunReport {
    /// Statistics of the node called `name`.
    pub fn node(&self, name: &str) -> Option<&NodeStats> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Runs task graphs, one thread per node.
pub struct Scheduler {
    resources: Resources,
    config: SchedulerConfig,
    events: EventSender,
}

type NodeThread = JoinHandle<Option<(crate::task::TaskKind, NodeStats)>>;

impl Scheduler {
    /// Create a scheduler with the default configuration.
    pub fn new(resources: Resources) -> Self {
        Self::with_config(resources, SchedulerConfig::default())
    }

    /// Create a scheduler with the given configuration.
    pub fn with_config(resources: Resources, config: SchedulerConfig) -> Self {
        Self {
            resources,
            config,
            events: EventSender::default(),
        }
    }

    /// The scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The resources tasks are set up with.
    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Receive events of subsequent runs.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Run `graph` until every node has finished.
    ///
    /// The graph may be modified by splitting and mapping. Tasks are
    /// returned to their nodes afterwards, except for nodes whose thread
    /// panicked.
    pub fn run(&self, graph: &mut TaskGraph) -> Result<RunReport> {
        let span = run_span(&self.config.tracing, graph.node_count());
        let _enter = span.enter();

        let result = self.execute(graph);
        observability::record_run(result.is_err());
        result
    }

    fn execute(&self, graph: &mut TaskGraph) -> Result<RunReport> {
        let start = wall_clock().now();

        if let Err(err) = self.prepare(graph) {
            warn!(error = %err, "run could not start");
            self.events
                .send_error(err.to_string(), err.node().map(str::to_string));
            return Err(err);
        }

        let (workers, control) = self.wire(graph);
        info!(nodes = workers.len(), "run started");
        self.events.send(RunEvent::Started);

        let handles = self.spawn(graph, workers, &control);
        let nodes = self.join(graph, handles, &control);

        let elapsed: Duration = (wall_clock().now() - start).into();
        let result = match control.take_error() {
            Some(err) => Err(err),
            None => {
                info!(elapsed = ?elapsed, "run finished");
                self.events.send_eos();
                Ok(RunReport { elapsed, nodes })
            }
        };
        self.events.send(RunEvent::Stopped);
        result
    }

    /// Validate, split, map and set up.
    fn prepare(&self, graph: &mut TaskGraph) -> Result<()> {
        graph.validate()?;

        let replicas = match self.config.split {
            Split::Off => 1,
            Split::Auto => self.resources.num_devices(),
            Split::Replicas(n) => n,
        };
        if replicas > 1 {
            let already_split = graph
                .node_ids()
                .into_iter()
                .any(|id| graph.get_node(id).is_some_and(|n| n.replica_of().is_some()));
            if already_split {
                debug!("graph already split");
            } else {
                let added = graph.split(replicas)?;
                info!(replicas, added, "split device path");
            }
        }

        graph.map(&self.resources)?;

        for id in graph.node_ids() {
            let Some(node) = graph.get_node_mut(id) else {
                continue;
            };
            let name = node.name().to_string();
            let task = node.task_mut().ok_or_else(|| Error::Setup {
                node: name.clone(),
                message: "task was lost in an earlier run".into(),
            })?;
            task.setup(&self.resources)
                .map_err(|e| e.into_setup(&name))?;
            debug!(node = %name, "task set up");
        }
        Ok(())
    }

    /// Create groups and ports, take the tasks out of the graph.
    fn wire(&self, graph: &mut TaskGraph) -> (Vec<(NodeId, Worker)>, Arc<RunControl>) {
        let ids = graph.node_ids();
        let context = self.resources.context();

        let mut groups = HashMap::with_capacity(ids.len());
        let mut signals = HashMap::with_capacity(ids.len());
        for &id in &ids {
            let name = graph.get_node(id).map(|n| n.name()).unwrap_or_default();
            groups.insert(
                id,
                Group::new(name, context.clone(), self.config.group_capacity),
            );
            signals.insert(id, Arc::new(Signal::new()));
        }

        let mut ports: HashMap<NodeId, Vec<InputPort>> = HashMap::with_capacity(ids.len());
        for &dst in &ids {
            let arity = graph.get_node(dst).map(|n| n.arity()).unwrap_or(0);
            let mut node_ports: Vec<InputPort> = (0..arity).map(|_| InputPort::new()).collect();

            for (src, port) in graph.predecessors(dst) {
                let key = lane_key(graph, src, dst, port);
                let group = &groups[&src];
                let signal = signals[&dst].clone();
                let sequential = graph
                    .get_node(src)
                    .is_some_and(|n| n.send_pattern() == SendPattern::Sequential);
                let consumer = if sequential {
                    let expected = graph.get_node(dst).and_then(|n| n.num_expected(port));
                    group.register_sequential(key, signal, expected)
                } else {
                    group.register_consumer(key, signal)
                };
                node_ports[port].add_source(group.clone(), consumer);
            }
            ports.insert(dst, node_ports);
        }

        let control = Arc::new(RunControl::new(
            groups.values().cloned().collect(),
            self.events.clone(),
        ));
        let options = WorkerOptions {
            strict_ranks: self.config.strict_ranks,
            timestamps: self.config.timestamps,
            tracing: self.config.tracing.clone(),
        };

        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(node) = graph.get_node_mut(id) else {
                continue;
            };
            let Some(task) = node.take_task() else {
                continue;
            };
            let queue = node
                .resource()
                .and_then(|index| self.resources.processing_resource(index))
                .map(|resource| resource.queue().clone())
                .unwrap_or_else(|| self.resources.default_queue().clone());

            let setup = NodeSetup {
                name: node.name().to_string(),
                task,
                ports: ports.remove(&id).unwrap_or_default(),
                signal: signals[&id].clone(),
                output: groups[&id].clone(),
                queue,
            };
            workers.push((id, Worker::new(setup, options.clone(), control.clone())));
        }

        (workers, control)
    }

    fn spawn(
        &self,
        graph: &mut TaskGraph,
        workers: Vec<(NodeId, Worker)>,
        control: &Arc<RunControl>,
    ) -> Vec<(NodeId, NodeThread)> {
        let mut handles = Vec::with_capacity(workers.len());
        let mut pending = workers.into_iter();

        for (id, worker) in pending.by_ref() {
            let thread_name = format!("{}-{}", self.config.thread_name_prefix, worker.name());
            let parent = tracing::Span::current();
            let control_clone = control.clone();

            let spawned = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let _enter = parent.enter();
                    let name = worker.name().to_string();
                    let output = worker.output().clone();
                    match panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
                        Ok(done) => Some(done),
                        Err(_) => {
                            control_clone.fail(Error::ThreadPanicked(name));
                            output.finish();
                            None
                        }
                    }
                });

            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(e) => {
                    control.fail(Error::Io(e));
                    break;
                }
            }
        }

        // Threads that never started give their tasks back right away.
        for (id, worker) in pending {
            if let Some(node) = graph.get_node_mut(id) {
                node.restore_task(worker.into_task());
            }
        }

        handles
    }

    fn join(
        &self,
        graph: &mut TaskGraph,
        handles: Vec<(NodeId, NodeThread)>,
        control: &RunControl,
    ) -> Vec<NodeStats> {
        let mut nodes = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let name = graph
                .get_node(id)
                .map(|n| n.name().to_string())
                .unwrap_or_default();

            match handle.join() {
                Ok(Some((task, stats))) => {
                    if let Some(node) = graph.get_node_mut(id) {
                        node.restore_task(task);
                    }
                    nodes.push(stats);
                }
                Ok(None) => warn!(node = %name, "node thread panicked"),
                Err(_) => control.fail(Error::ThreadPanicked(name)),
            }
        }
        nodes.sort_by(|a, b| {
            let a = graph.node_id(&a.name);
            let b = graph.node_id(&b.name);
            a.cmp(&b)
        });
        nodes
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("resources", &self.resources)
            .field("config", &self.config)
            .finish()
    }
}

/// Lane of `dst` in the output group of `src`.
///
/// Copies of one node made by splitting share a lane, so they take turns.
/// A scattering or sequential producer puts all its consumers of a port in
/// one lane.
fn lane_key(graph: &TaskGraph, src: NodeId, dst: NodeId, port: usize) -> LaneKey {
    let scatter = graph
        .get_node(src)
        .is_some_and(|n| n.send_pattern() != SendPattern::Broadcast);
    let family = if scatter {
        usize::MAX
    } else {
        graph
            .get_node(dst)
            .and_then(|n| n.replica_of())
            .unwrap_or(dst)
            .index()
    };
    LaneKey { family, port }
}
