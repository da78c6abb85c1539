//! Integration tests for backpressure and flow control.
//!
//! These tests verify that:
//! - A slow consumer bounds how far its producer runs ahead
//! - A broadcast buffer returns to the pool only after every lane released it
//! - Aborting a group wakes blocked producers and consumers

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tomoflow::group::{Group, LaneKey, Signal};
use tomoflow::prelude::*;
use tomoflow::tasks::NullSource;

/// Root that counts how many buffers it has started to fill.
struct Producer {
    produced: Arc<AtomicUsize>,
    max: usize,
}

impl Task for Producer {
    fn input_arity(&self) -> usize {
        0
    }

    fn negotiate_output_shape(&mut self, _inputs: &[Requisition]) -> Result<Requisition> {
        if self.produced.load(Ordering::SeqCst) >= self.max {
            return Ok(Requisition::NONE);
        }
        Ok(Requisition::new(&[16]))
    }
}

impl CpuTask for Producer {
    fn compute(
        &mut self,
        _inputs: &[HostView<'_>],
        output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        if output.is_none() {
            return Ok(false);
        }
        self.produced.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Leaf that sleeps on every buffer and records the producer's lead.
struct SlowSink {
    produced: Arc<AtomicUsize>,
    consumed: usize,
    max_lead: Arc<AtomicUsize>,
    delay: Duration,
}

impl Task for SlowSink {
    fn input_arity(&self) -> usize {
        1
    }

    fn negotiate_output_shape(&mut self, _inputs: &[Requisition]) -> Result<Requisition> {
        Ok(Requisition::NONE)
    }
}

impl CpuTask for SlowSink {
    fn compute(
        &mut self,
        _inputs: &[HostView<'_>],
        _output: Option<HostViewMut<'_>>,
        _requisition: &Requisition,
    ) -> Result<bool> {
        thread::sleep(self.delay);
        let lead = self.produced.load(Ordering::SeqCst) - self.consumed;
        self.max_lead.fetch_max(lead, Ordering::SeqCst);
        self.consumed += 1;
        Ok(true)
    }
}

fn context() -> Context {
    Context::sim(1)
}

fn lane(family: usize) -> LaneKey {
    LaneKey { family, port: 0 }
}

#[test]
fn test_slow_sink_bounds_in_flight_buffers() {
    let produced = Arc::new(AtomicUsize::new(0));
    let max_lead = Arc::new(AtomicUsize::new(0));

    let mut graph = TaskGraph::new();
    let src = graph.add_cpu_task(
        "producer",
        Producer {
            produced: Arc::clone(&produced),
            max: 20,
        },
    );
    let sink = graph.add_cpu_task(
        "sink",
        SlowSink {
            produced: Arc::clone(&produced),
            consumed: 0,
            max_lead: Arc::clone(&max_lead),
            delay: Duration::from_millis(2),
        },
    );
    graph.connect(src, sink).unwrap();

    let config = SchedulerConfig::default().with_group_capacity(2);
    let report = Scheduler::with_config(Resources::new(context()).unwrap(), config)
        .run(&mut graph)
        .unwrap();

    assert_eq!(report.node("sink").unwrap().processed, 20);
    // Every buffer the producer got ahead with is one of the pool's two.
    let lead = max_lead.load(Ordering::SeqCst);
    assert!(lead <= 2, "producer ran {lead} buffers ahead");
}

#[test]
fn test_acquire_output_blocks_until_release() {
    let group = Group::new("producer", context(), 1);
    let signal = Arc::new(Signal::new());
    let consumer = group.register_consumer(lane(1), Arc::clone(&signal));

    // One consumer raises the capacity to two.
    assert_eq!(group.stats().capacity, 2);

    let requisition = Requisition::new(&[8]);
    group.publish(group.acquire_output(&requisition).unwrap());
    group.publish(group.acquire_output(&requisition).unwrap());
    assert_eq!(group.stats().allocated, 2);

    let producer = {
        let group = group.clone();
        thread::spawn(move || group.acquire_output(&requisition).map(|b| b.id()))
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!producer.is_finished());

    let first = group.acquire_input(consumer).unwrap();
    let first_id = first.id();
    group.release_input(first);

    let reused = producer.join().unwrap().unwrap();
    assert_eq!(reused, first_id);
    assert_eq!(group.stats().allocated, 2);
}

#[test]
fn test_broadcast_waits_for_every_lane() {
    let group = Group::new("producer", context(), 4);
    let a = group.register_consumer(lane(1), Arc::new(Signal::new()));
    let b = group.register_consumer(lane(2), Arc::new(Signal::new()));

    group.publish(group.acquire_output(&Requisition::new(&[4])).unwrap());

    let from_a = group.acquire_input(a).unwrap();
    let from_b = group.acquire_input(b).unwrap();
    assert_eq!(from_a.id(), from_b.id());

    group.release_input(from_a);
    let stats = group.stats();
    assert_eq!(stats.free, 0);
    assert_eq!(stats.pending, 1);

    group.release_input(from_b);
    let stats = group.stats();
    assert_eq!(stats.free, 1);
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_abort_wakes_blocked_threads() {
    let group = Group::new("producer", context(), 1);
    let signal = Arc::new(Signal::new());
    let consumer = group.register_consumer(lane(1), Arc::clone(&signal));

    let requisition = Requisition::new(&[2]);
    let _held = group.acquire_output(&requisition).unwrap();
    let _held2 = group.acquire_output(&requisition).unwrap();

    let producer = {
        let group = group.clone();
        thread::spawn(move || group.acquire_output(&requisition).err())
    };
    let reader = {
        let group = group.clone();
        thread::spawn(move || group.acquire_input(consumer).is_none())
    };

    thread::sleep(Duration::from_millis(20));
    group.abort();

    assert!(matches!(producer.join().unwrap(), Some(Error::Aborted)));
    assert!(reader.join().unwrap());
}

#[test]
fn test_detached_consumer_does_not_stall_producer() {
    let group = Group::new("producer", context(), 1);
    let consumer = group.register_consumer(lane(1), Arc::new(Signal::new()));
    let requisition = Requisition::new(&[2]);

    group.publish(group.acquire_output(&requisition).unwrap());
    group.publish(group.acquire_output(&requisition).unwrap());
    group.detach(consumer);

    // The backlog went back to the pool, and with nobody left the producer
    // is told to stop.
    assert_eq!(group.stats().free, 2);
    assert!(matches!(group.acquire_output(&requisition), Err(Error::Aborted)));
}

#[test]
fn test_many_buffers_through_small_pool() {
    let mut graph = TaskGraph::new();
    let src = graph.add_cpu_task("src", NullSource::new(500, Requisition::new(&[32, 32])));
    let sink = tomoflow::tasks::NullSink::new();
    let consumed = sink.counter();
    let sink = graph.add_cpu_task("sink", sink);
    graph.connect(src, sink).unwrap();

    let config = SchedulerConfig::default().with_group_capacity(1);
    Scheduler::with_config(Resources::new(context()).unwrap(), config)
        .run(&mut graph)
        .unwrap();

    assert_eq!(consumed.load(Ordering::Relaxed), 500);
}
