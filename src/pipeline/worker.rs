//! The execution loop of one node thread.
//!
//! A worker pulls one buffer per input port, negotiates the output shape,
//! runs the task on the views its placement needs and publishes into the
//! node's output group. Inputs of one tuple are locked in buffer id order,
//! so two consumers sharing broadcast buffers never wait on each other in
//! a cycle.

use super::events::EventSender;
use super::port::{InputPort, Pulled};
use super::scheduler::NodeStats;
use crate::buffer::{Buffer, DeviceView, HostView, Requisition};
use crate::clock::wall_clock;
use crate::device::CommandQueue;
use crate::error::{Error, Result};
use crate::group::{Group, Signal};
use crate::metadata::{Metadata, TIMESTAMP_KEY};
use crate::observability::{NodeMetrics, TracingConfig, node_span};
use crate::task::{Placement, TaskKind, TaskMode};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, trace};

/// One buffer per input port.
type Tuple = SmallVec<[Pulled; 4]>;

/// Failure state shared by all node threads of a run.
///
/// The first error is kept; any error aborts every group so blocked
/// threads wake up and wind down.
pub(crate) struct RunControl {
    first_error: Mutex<Option<Error>>,
    aborted: AtomicBool,
    groups: Vec<Group>,
    events: EventSender,
}

impl RunControl {
    pub(crate) fn new(groups: Vec<Group>, events: EventSender) -> Self {
        Self {
            first_error: Mutex::new(None),
            aborted: AtomicBool::new(false),
            groups,
            events,
        }
    }

    /// Record `err` and abort the run. [`Error::Aborted`] is ignored.
    pub(crate) fn fail(&self, err: Error) {
        if err.is_aborted() {
            return;
        }

        {
            let mut slot = self.first_error.lock().unwrap();
            if slot.is_none() {
                error!(error = %err, "run failed");
                self.events
                    .send_error(err.to_string(), err.node().map(str::to_string));
                *slot = Some(err);
            } else {
                debug!(error = %err, "further error after run failure");
            }
        }
        self.abort();
    }

    /// Abort every group.
    pub(crate) fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            for group in &self.groups {
                group.abort();
            }
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn take_error(&self) -> Option<Error> {
        self.first_error.lock().unwrap().take()
    }

    pub(crate) fn events(&self) -> &EventSender {
        &self.events
    }
}

/// Per-run settings every worker needs.
#[derive(Debug, Clone)]
pub(crate) struct WorkerOptions {
    pub(crate) strict_ranks: bool,
    pub(crate) timestamps: bool,
    pub(crate) tracing: TracingConfig,
}

/// Everything the scheduler wires up for one node.
pub(crate) struct NodeSetup {
    pub(crate) name: String,
    pub(crate) task: TaskKind,
    pub(crate) ports: Vec<InputPort>,
    pub(crate) signal: Arc<Signal>,
    pub(crate) output: Group,
    pub(crate) queue: CommandQueue,
}

/// Accumulated output of a reducing node.
struct Reduction {
    requisition: Requisition,
    output: Option<Buffer>,
}

pub(crate) struct Worker {
    name: String,
    task: TaskKind,
    mode: TaskMode,
    placement: Placement,
    ports: Vec<InputPort>,
    signal: Arc<Signal>,
    output: Group,
    queue: CommandQueue,
    options: WorkerOptions,
    control: Arc<RunControl>,
    metrics: NodeMetrics,
    /// Input metadata of the tuple a generating task is working on.
    carried: Metadata,
    inputs_ended: bool,
    processed: u64,
    published: u64,
}

impl Worker {
    pub(crate) fn new(node: NodeSetup, options: WorkerOptions, control: Arc<RunControl>) -> Self {
        Self {
            metrics: NodeMetrics::new(&node.name),
            mode: node.task.mode(),
            placement: node.task.placement(),
            name: node.name,
            task: node.task,
            ports: node.ports,
            signal: node.signal,
            output: node.output,
            queue: node.queue,
            options,
            control,
            carried: Metadata::new(),
            inputs_ended: false,
            processed: 0,
            published: 0,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn output(&self) -> &Group {
        &self.output
    }

    /// Give the task back without running.
    pub(crate) fn into_task(self) -> TaskKind {
        self.task
    }

    /// Run the node to completion and hand the task back.
    pub(crate) fn run(mut self) -> (TaskKind, NodeStats) {
        let mode = format!("{:?}", self.mode).to_lowercase();
        let span = node_span(
            &self.options.tracing,
            &self.name,
            &self.placement.to_string(),
            &mode,
        );
        let _enter = span.enter();

        debug!(
            node = %self.name,
            ports = self.ports.len(),
            sources = self.ports.iter().map(InputPort::num_sources).sum::<usize>(),
            "node started"
        );
        self.control.events().send_node_started(&self.name);

        let result = match self.mode {
            TaskMode::Single => self.run_single(),
            TaskMode::Generate => self.run_generate(),
            TaskMode::Reduce => self.run_reduce(),
        };
        if let Err(err) = result {
            self.control.fail(err.in_node(&self.name));
        }

        for port in &mut self.ports {
            port.detach();
        }
        self.output.finish();

        debug!(
            node = %self.name,
            processed = self.processed,
            published = self.published,
            "node finished"
        );
        self.control
            .events()
            .send_node_finished(&self.name, self.processed, self.published);

        let stats = NodeStats {
            name: self.name,
            placement: self.placement,
            processed: self.processed,
            published: self.published,
        };
        (self.task, stats)
    }

    fn run_single(&mut self) -> Result<()> {
        while let Some(tuple) = self.next_tuple() {
            let step = self.single_step(&tuple);
            self.release(tuple);
            if !step? {
                break;
            }
        }
        Ok(())
    }

    fn single_step(&mut self, tuple: &[Pulled]) -> Result<bool> {
        let requisition = self.negotiate(tuple)?;
        if requisition.is_none() {
            return self.compute(tuple, None, &requisition);
        }

        let mut output = self.output.acquire_output(&requisition)?;
        match self.compute(tuple, Some(&mut output), &requisition) {
            Ok(true) => {
                self.publish(output);
                Ok(true)
            }
            other => {
                self.output.recycle(output);
                other
            }
        }
    }

    fn run_generate(&mut self) -> Result<()> {
        while let Some(tuple) = self.next_tuple() {
            let step = self.ingest(&tuple);
            self.release(tuple);
            let Some(requisition) = step? else {
                break;
            };

            loop {
                let mut output = self.output.acquire_output(&requisition)?;
                output.discard_location(self.placement.location().other());
                match self.generate(&mut output, &requisition) {
                    Ok(true) => self.publish(output),
                    Ok(false) => {
                        self.output.recycle(output);
                        break;
                    }
                    Err(e) => {
                        self.output.recycle(output);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand a tuple to a generating task. `None` if the task stopped.
    fn ingest(&mut self, tuple: &[Pulled]) -> Result<Option<Requisition>> {
        let requisition = self.negotiate(tuple)?;
        if requisition.is_none() {
            return Err(Error::ShapeNegotiation {
                node: self.name.clone(),
                message: "generating task negotiated an empty output".into(),
            });
        }
        Ok(self
            .compute(tuple, None, &requisition)?
            .then_some(requisition))
    }

    fn run_reduce(&mut self) -> Result<()> {
        let mut reduction = None;
        let mut result = Ok(());

        while let Some(tuple) = self.next_tuple() {
            let step = self.reduce_step(&tuple, &mut reduction);
            self.release(tuple);
            match step {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let Some(Reduction {
            requisition,
            mut output,
        }) = reduction
        else {
            trace!(node = %self.name, "no input, nothing to reduce");
            return result;
        };

        if result.is_err() || self.control.is_aborted() {
            if let Some(output) = output {
                self.output.recycle(output);
            }
            return result;
        }

        if let Err(e) = self.finalize(output.as_mut(), &requisition) {
            if let Some(output) = output {
                self.output.recycle(output);
            }
            return Err(e);
        }
        if let Some(output) = output {
            self.publish(output);
        }
        Ok(())
    }

    fn reduce_step(&mut self, tuple: &[Pulled], slot: &mut Option<Reduction>) -> Result<bool> {
        if slot.is_some() {
            self.check_ranks(tuple)?;
        }
        let mut reduction = match slot.take() {
            Some(reduction) => reduction,
            None => self.begin_reduction(tuple)?,
        };
        let result = self.compute(tuple, reduction.output.as_mut(), &reduction.requisition);
        *slot = Some(reduction);
        result
    }

    fn begin_reduction(&mut self, tuple: &[Pulled]) -> Result<Reduction> {
        let requisition = self.negotiate(tuple)?;
        let output = if requisition.is_none() {
            None
        } else {
            let mut buffer = self.output.acquire_output(&requisition)?;
            buffer.clear();
            Some(buffer)
        };
        Ok(Reduction {
            requisition,
            output,
        })
    }

    /// Pull the next tuple, or `None` at end-of-stream.
    ///
    /// Roots get empty tuples: forever in single mode, once otherwise.
    fn next_tuple(&mut self) -> Option<Tuple> {
        if self.control.is_aborted() {
            return None;
        }

        if self.ports.is_empty() {
            if self.mode != TaskMode::Single && self.processed > 0 {
                return self.end_of_inputs();
            }
            return Some(Tuple::new());
        }

        let waiting = Instant::now();
        let mut tuple = Tuple::new();
        for index in 0..self.ports.len() {
            match self.ports[index].pull(&self.signal) {
                Some(pulled) => tuple.push(pulled),
                None => {
                    self.release(tuple);
                    return self.end_of_inputs();
                }
            }
        }
        self.metrics.record_input_wait(waiting.elapsed());
        Some(tuple)
    }

    fn end_of_inputs(&mut self) -> Option<Tuple> {
        if !self.inputs_ended && !self.control.is_aborted() {
            self.inputs_ended = true;
            trace!(node = %self.name, "inputs reached end-of-stream");
            self.task.inputs_stopped();
        }
        None
    }

    fn release(&self, tuple: Tuple) {
        for (port, pulled) in self.ports.iter().zip(tuple) {
            port.release(pulled);
        }
    }

    fn check_ranks(&self, tuple: &[Pulled]) -> Result<()> {
        if !self.options.strict_ranks {
            return Ok(());
        }
        for (port, pulled) in tuple.iter().enumerate() {
            let rank = pulled.input().requisition().rank();
            if let Some(expected) = self.task.input_rank(port) {
                if rank != expected {
                    return Err(Error::ShapeNegotiation {
                        node: self.name.clone(),
                        message: format!(
                            "input {} has rank {}, expected {}",
                            port, rank, expected
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn negotiate(&mut self, tuple: &[Pulled]) -> Result<Requisition> {
        self.check_ranks(tuple)?;
        let inputs: SmallVec<[Requisition; 4]> =
            tuple.iter().map(|p| p.input().requisition()).collect();
        self.task
            .negotiate_output_shape(&inputs)
            .map_err(|e| e.into_shape(&self.name))
    }

    /// Lock the tuple's buffers, make them authoritative where the task
    /// computes and run `compute`.
    ///
    /// An output is simply claimed at the compute location, since the task
    /// overwrites it. A reduction's output carries the running result and is
    /// synchronized instead.
    fn compute(
        &mut self,
        tuple: &[Pulled],
        mut output: Option<&mut Buffer>,
        requisition: &Requisition,
    ) -> Result<bool> {
        let location = self.placement.location();

        // The same buffer may arrive on several ports; lock it once.
        let mut order: SmallVec<[usize; 4]> = (0..tuple.len()).collect();
        order.sort_by_key(|&i| tuple[i].input().id());
        order.dedup_by_key(|i| tuple[*i].input().id());
        let slots: SmallVec<[usize; 4]> = tuple
            .iter()
            .map(|p| {
                order
                    .iter()
                    .position(|&i| tuple[i].input().id() == p.input().id())
                    .unwrap_or(0)
            })
            .collect();

        let mut guards: SmallVec<[MutexGuard<'_, Buffer>; 4]> = order
            .iter()
            .map(|&i| tuple[i].input().buffer().lock().unwrap())
            .collect();
        for guard in guards.iter_mut() {
            guard.sync_to(location, &self.queue)?;
        }

        match output.as_deref_mut() {
            Some(out) => {
                if self.mode == TaskMode::Reduce {
                    out.sync_to(location, &self.queue)?;
                } else {
                    out.discard_location(location.other());
                }
                for guard in &guards {
                    out.metadata_mut().merge_from(guard.metadata());
                }
            }
            None if self.mode == TaskMode::Generate => {
                self.carried.clear();
                for guard in &guards {
                    self.carried.merge_from(guard.metadata());
                }
            }
            None => {}
        }

        if self.options.tracing.step_events {
            trace!(node = %self.name, step = self.processed, "compute");
        }

        let timer = self.metrics.start_timer();
        let result = match &mut self.task {
            TaskKind::Cpu(task) => {
                let inputs: SmallVec<[HostView<'_>; 4]> =
                    slots.iter().map(|&s| guards[s].view_host()).collect();
                let output = output.map(|b| b.host_view_mut(&self.queue)).transpose()?;
                task.compute(&inputs, output, requisition)
            }
            TaskKind::Device(task) => {
                let inputs: SmallVec<[DeviceView<'_>; 4]> =
                    slots.iter().map(|&s| guards[s].view_device()).collect();
                let output = output
                    .map(|b| b.device_view_mut(&self.queue))
                    .transpose()?;
                task.compute(&inputs, output, requisition, &self.queue)
            }
        };
        drop(timer);

        self.processed += 1;
        self.metrics.record_processed();
        result.map_err(|e| e.in_node(&self.name))
    }

    fn generate(&mut self, output: &mut Buffer, requisition: &Requisition) -> Result<bool> {
        output.metadata_mut().merge_from(&self.carried);
        let _timer = self.metrics.start_timer();
        let result = match &mut self.task {
            TaskKind::Cpu(task) => {
                let view = output.host_view_mut(&self.queue)?;
                task.generate(view, requisition)
            }
            TaskKind::Device(task) => {
                let view = output.device_view_mut(&self.queue)?;
                task.generate(view, requisition, &self.queue)
            }
        };
        result.map_err(|e| e.in_node(&self.name))
    }

    fn finalize(&mut self, output: Option<&mut Buffer>, requisition: &Requisition) -> Result<()> {
        let _timer = self.metrics.start_timer();
        let result = match &mut self.task {
            TaskKind::Cpu(task) => {
                let view = output.map(|b| b.host_view_mut(&self.queue)).transpose()?;
                task.finalize(view, requisition)
            }
            TaskKind::Device(task) => {
                let view = output
                    .map(|b| b.device_view_mut(&self.queue))
                    .transpose()?;
                task.finalize(view, requisition, &self.queue)
            }
        };
        result.map_err(|e| e.in_node(&self.name))
    }

    fn publish(&mut self, mut output: Buffer) {
        if self.options.timestamps && self.ports.is_empty() {
            let now = wall_clock().now().nanos() as i64;
            output.metadata_mut().set(TIMESTAMP_KEY, now);
        }
        if self.options.tracing.step_events {
            trace!(node = %self.name, buffer = output.id().get(), "publish");
        }
        self.output.publish(output);
        self.published += 1;
        self.metrics.record_published();
    }
}
