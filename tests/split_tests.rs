//! Integration tests for splitting device paths across resources.
//!
//! These tests verify that:
//! - A split graph produces the same multiset of outputs as the unsplit one
//! - Replicas take turns on the inputs of their path
//! - Replicas are mapped onto distinct devices

use tomoflow::pipeline::{NodeId, RunReport};
use tomoflow::prelude::*;
use tomoflow::tasks::{AppSink, AppSinkHandle};

/// Root producing `0.0, 1.0, ...`.
struct Counter {
    next: usize,
    max: usize,
}

impl Task for Counter {
    fn input_arity(&self) -> usize {
        0
    }

    fn negotiate_output_shape(&mut self, _inputs: &[Requisition]) -> Result<Requisition> {
        if self.next >= self.max {
            return Ok(Requisition::NONE);
        }
        Ok(Requisition::new(&[1]))
    }
}

impl CpuTask for Counter {
    fn compute(
        &mut self,
        _inputs: &[HostView<'_>],
        output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let Some(mut output) = output else {
            return Ok(false);
        };
        output.data_mut()[0] = self.next as f32;
        self.next += 1;
        Ok(true)
    }
}

/// Device task computing `x * factor`.
#[derive(Clone)]
struct Scale(f32);

impl Task for Scale {
    fn input_arity(&self) -> usize {
        1
    }

    fn negotiate_output_shape(&mut self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs[0])
    }
}

impl DeviceTask for Scale {
    fn compute(
        &mut self,
        inputs: &[DeviceView<'_>],
        output: Option<DeviceViewMut<'_>>,
        _requisition: &Requisition,
        _queue: &CommandQueue,
    ) -> Result<bool> {
        let Some(mut output) = output else {
            return Ok(false);
        };
        let src = inputs[0].array().sim_data();
        for (dst, x) in output.array_mut().sim_data_mut().iter_mut().zip(src) {
            *dst = x * self.0;
        }
        Ok(true)
    }

    fn duplicate(&self) -> Box<dyn DeviceTask> {
        Box::new(self.clone())
    }
}

/// Device reducer summing all inputs into one element.
#[derive(Clone)]
struct DeviceSum;

impl Task for DeviceSum {
    fn input_arity(&self) -> usize {
        1
    }

    fn mode(&self) -> TaskMode {
        TaskMode::Reduce
    }

    fn negotiate_output_shape(&mut self, _inputs: &[Requisition]) -> Result<Requisition> {
        Ok(Requisition::new(&[1]))
    }
}

impl DeviceTask for DeviceSum {
    fn compute(
        &mut self,
        inputs: &[DeviceView<'_>],
        output: Option<DeviceViewMut<'_>>,
        _requisition: &Requisition,
        _queue: &CommandQueue,
    ) -> Result<bool> {
        let Some(mut output) = output else {
            return Ok(false);
        };
        output.array_mut().sim_data_mut()[0] += inputs[0].array().sim_data().iter().sum::<f32>();
        Ok(true)
    }

    fn duplicate(&self) -> Box<dyn DeviceTask> {
        Box::new(self.clone())
    }
}

struct Chain {
    graph: TaskGraph,
    output: AppSinkHandle,
    first: NodeId,
    second: NodeId,
}

/// counter -> scale(2) -> scale(3) -> sink
fn chain(inputs: usize) -> Chain {
    let mut graph = TaskGraph::new();
    let src = graph.add_cpu_task("counter", Counter { next: 0, max: inputs });
    let first = graph.add_device_task("times2", Scale(2.0));
    let second = graph.add_device_task("times3", Scale(3.0));
    let sink = AppSink::new();
    let output = sink.handle();
    let sink = graph.add_cpu_task("sink", sink);
    graph.connect(src, first).unwrap();
    graph.connect(first, second).unwrap();
    graph.connect(second, sink).unwrap();
    Chain {
        graph,
        output,
        first,
        second,
    }
}

fn run(graph: &mut TaskGraph, devices: usize, split: Split) -> RunReport {
    let resources = Resources::new(Context::sim(devices)).unwrap();
    let config = SchedulerConfig::default().with_split(split);
    Scheduler::with_config(resources, config).run(graph).unwrap()
}

fn sorted(output: &AppSinkHandle) -> Vec<f32> {
    let mut values: Vec<f32> = output
        .collect()
        .unwrap()
        .into_iter()
        .flat_map(|array| array.data)
        .collect();
    values.sort_by(f32::total_cmp);
    values
}

#[test]
fn test_split_preserves_output_multiset() {
    let mut chain = chain(40);
    let report = run(&mut chain.graph, 3, Split::Replicas(3));

    let expected: Vec<f32> = (0..40).map(|x| x as f32 * 6.0).collect();
    assert_eq!(sorted(&chain.output), expected);

    // Two inner nodes, two extra copies each.
    assert_eq!(chain.graph.node_count(), 8);
    assert_eq!(report.nodes.len(), 8);
}

#[test]
fn test_replicas_take_turns() {
    let mut chain = chain(30);
    let report = run(&mut chain.graph, 3, Split::Replicas(3));
    sorted(&chain.output);

    let processed: Vec<u64> = ["times2", "times2#1", "times2#2"]
        .iter()
        .map(|name| report.node(name).unwrap().processed)
        .collect();
    assert_eq!(processed.iter().sum::<u64>(), 30);
    assert!(processed.iter().all(|&n| n == 10), "got {processed:?}");
}

#[test]
fn test_replicas_on_distinct_devices() {
    let mut chain = chain(6);
    run(&mut chain.graph, 3, Split::Auto);
    sorted(&chain.output);

    let graph = &chain.graph;
    let resource = |name: &str| {
        let id = graph.node_id(name).unwrap();
        graph.get_node(id).unwrap().resource().unwrap()
    };

    let mut first = vec![resource("times2"), resource("times2#1"), resource("times2#2")];
    first.sort();
    assert_eq!(first, vec![0, 1, 2]);

    // Each copy of the path stays on one device.
    assert_eq!(resource("times2"), resource("times3"));
    assert_eq!(resource("times2#1"), resource("times3#1"));
    assert_eq!(resource("times2#2"), resource("times3#2"));

    assert_eq!(
        graph.get_node(chain.second).unwrap().replica_of(),
        None
    );
    let copy = graph.node_id("times2#1").unwrap();
    assert_eq!(graph.get_node(copy).unwrap().replica_of(), Some(chain.first));
}

#[test]
fn test_split_with_reducing_exit() {
    let mut graph = TaskGraph::new();
    let src = graph.add_cpu_task("counter", Counter { next: 0, max: 25 });
    let scale = graph.add_device_task("times2", Scale(2.0));
    let sum = graph.add_device_task("sum", DeviceSum);
    let sink = AppSink::new();
    let output = sink.handle();
    let sink = graph.add_cpu_task("sink", sink);
    graph.connect(src, scale).unwrap();
    graph.connect(scale, sum).unwrap();
    graph.connect(sum, sink).unwrap();

    let report = run(&mut graph, 2, Split::Auto);

    // 2 * (0 + 1 + ... + 24)
    assert_eq!(sorted(&output), vec![600.0]);
    assert_eq!(report.node("sum").unwrap().processed, 25);
    assert!(graph.node_id("sum#1").is_none());
    assert!(graph.node_id("times2#1").is_some());
}

#[test]
fn test_split_off_runs_graph_as_built() {
    let mut chain = chain(5);
    run(&mut chain.graph, 3, Split::Off);

    assert_eq!(sorted(&chain.output), vec![0.0, 6.0, 12.0, 18.0, 24.0]);
    assert_eq!(chain.graph.node_count(), 4);
}

#[test]
fn test_second_run_does_not_split_again() {
    let mut chain = chain(4);
    run(&mut chain.graph, 2, Split::Replicas(2));
    assert_eq!(chain.graph.node_count(), 6);
    sorted(&chain.output);

    run(&mut chain.graph, 2, Split::Replicas(2));
    assert_eq!(chain.graph.node_count(), 6);
}

#[test]
fn test_independent_chains_both_split() {
    // counter -> times2 -> sink and counter -> times5 -> sink, side by side.
    let mut graph = TaskGraph::new();
    let mut outputs = Vec::new();
    for (name, factor) in [("times2", 2.0), ("times5", 5.0)] {
        let src = graph.add_cpu_task(format!("{name}-counter"), Counter { next: 0, max: 20 });
        let scale = graph.add_device_task(name, Scale(factor));
        let sink = AppSink::new();
        outputs.push((factor, sink.handle()));
        let sink = graph.add_cpu_task(format!("{name}-sink"), sink);
        graph.connect(src, scale).unwrap();
        graph.connect(scale, sink).unwrap();
    }

    let report = run(&mut graph, 2, Split::Auto);

    for (factor, output) in &outputs {
        let expected: Vec<f32> = (0..20).map(|x| x as f32 * factor).collect();
        assert_eq!(sorted(output), expected);
    }
    for name in ["times2", "times5"] {
        let copy = format!("{name}#1");
        assert!(graph.node_id(&copy).is_some(), "{copy} missing");
        assert_eq!(report.node(name).unwrap().processed, 10);
        assert_eq!(report.node(&copy).unwrap().processed, 10);
    }
    assert_eq!(graph.node_count(), 8);
}
