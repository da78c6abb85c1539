//! Splitting a device path across simulated devices.
//!
//! The graph reads slices from the application, runs a two-stage device
//! filter and sums the results:
//!
//! ```text
//! appsrc -> scale -> offset -> sum -> appsink
//! ```
//!
//! With `Split::Auto` the scale/offset chain is copied once per device and
//! the slices are handed to the copies in turn.
//!
//! Run with: cargo run --example split_pipeline

use std::thread;
use tomoflow::pipeline::RunEvent;
use tomoflow::prelude::*;
use tomoflow::tasks::{AppSink, AppSrc};

const SLICES: usize = 64;
const WIDTH: usize = 256;

/// `x * factor + offset` on the device.
#[derive(Clone)]
struct Affine {
    factor: f32,
    offset: f32,
}

impl Task for Affine {
    fn input_arity(&self) -> usize {
        1
    }

    fn input_rank(&self, _port: usize) -> Option<usize> {
        Some(2)
    }

    fn negotiate_output_shape(&mut self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs[0])
    }
}

impl DeviceTask for Affine {
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
            *dst = x * self.factor + self.offset;
        }
        Ok(true)
    }

    fn duplicate(&self) -> Box<dyn DeviceTask> {
        Box::new(self.clone())
    }
}

/// Accumulates all slices into one.
struct Accumulate;

impl Task for Accumulate {
    fn input_arity(&self) -> usize {
        1
    }

    fn mode(&self) -> TaskMode {
        TaskMode::Reduce
    }

    fn negotiate_output_shape(&mut self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs[0])
    }
}

impl CpuTask for Accumulate {
    fn compute(
        &mut self,
        inputs: &[HostView<'_>],
        output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        let Some(mut output) = output else {
            return Ok(false);
        };
        for (acc, x) in output.data_mut().iter_mut().zip(inputs[0].data()) {
            *acc += x;
        }
        Ok(true)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("tomoflow=debug")
        .init();
    tomoflow::observability::init_metrics();

    let (ctx, transfers) = Context::sim_with_stats(4);
    let resources = Resources::new(ctx)?;

    let src = AppSrc::with_max_buffers(8);
    let input = src.handle();
    let sink = AppSink::new();
    let output = sink.handle();

    let mut graph = TaskGraph::new();
    let src = graph.add_cpu_task("appsrc", src);
    let scale = graph.add_device_task(
        "scale",
        Affine {
            factor: 2.0,
            offset: 0.0,
        },
    );
    let offset = graph.add_device_task(
        "offset",
        Affine {
            factor: 1.0,
            offset: 1.0,
        },
    );
    let sum = graph.add_cpu_task("sum", Accumulate);
    let sink = graph.add_cpu_task("appsink", sink);
    graph.connect(src, scale)?;
    graph.connect(scale, offset)?;
    graph.connect(offset, sum)?;
    graph.connect(sum, sink)?;

    let config = SchedulerConfig::default()
        .with_split(Split::Auto)
        .with_strict_ranks(true)
        .with_timestamps(true);
    let scheduler = Scheduler::with_config(resources, config);
    let events = scheduler.subscribe();

    let producer = thread::spawn(move || -> Result<()> {
        for slice in 0..SLICES {
            input.push_data(Requisition::new(&[1, WIDTH]), vec![slice as f32; WIDTH])?;
        }
        input.end_stream();
        Ok(())
    });

    let report = scheduler.run(&mut graph)?;
    producer.join().expect("producer thread panicked")?;

    let result = output.pull()?.expect("sum publishes one slice");
    println!("sum[0] = {} after {:?}", result.data[0], report.elapsed);
    println!("{}", graph.to_dot());

    for node in &report.nodes {
        println!(
            "{:>12} {:>6} processed {:>4} published {:>4}",
            node.name, node.placement, node.processed, node.published
        );
    }
    println!(
        "transfers: {} host->device, {} device->host",
        transfers.host_to_device(),
        transfers.device_to_host()
    );

    for event in events.drain() {
        if !matches!(event, RunEvent::NodeStarted { .. }) {
            println!("event: {}", event);
        }
    }
    Ok(())
}
