//! Buffer exchange between a producer node and its consumers.
//!
//! A [`Group`] sits on the output edge of one node. It owns the pool of
//! buffers the producer writes into and hands every published buffer to
//! the consumers downstream:
//!
//! - Consumers are organised in **lanes**. Every lane receives every
//!   published buffer (broadcast); consumers inside one lane take turns
//!   (scatter). Distinct downstream nodes get distinct lanes, replicas made
//!   by splitting share the lane of the node they copy.
//! - A **sequential** lane cuts the stream into sub-streams instead: its
//!   current member receives buffers until it has seen its expected count,
//!   then gets its own end-of-stream and the next member takes over.
//! - A published buffer returns to the free pool only after every consumer
//!   it was handed to has released it.
//! - The pool is bounded. [`Group::acquire_output`] blocks while all
//!   buffers are in flight; that is the pipeline's backpressure.
//! - Each consumer reads buffers in publish order.
//!
//! Consumers are woken through a [`Signal`] they register with, so one node
//! can wait on several groups at once.

use crate::buffer::{Buffer, BufferId, Requisition};
use crate::device::Context;
use crate::error::{Error, Result};
use crate::observability;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Default number of buffers a group may allocate.
pub const DEFAULT_CAPACITY: usize = 4;

/// Wakeup signal shared by all input sources of one consumer node.
///
/// Every notification bumps a sequence number, so a waiter that read the
/// sequence before checking its sources cannot miss a wakeup.
#[derive(Debug, Default)]
pub struct Signal {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    /// Create a new signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence number.
    pub fn sequence(&self) -> u64 {
        *self.seq.lock().unwrap()
    }

    /// Wake all waiters.
    pub fn notify(&self) {
        let mut seq = self.seq.lock().unwrap();
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until the sequence differs from `seen`.
    pub fn wait_past(&self, seen: u64) {
        let mut seq = self.seq.lock().unwrap();
        while *seq == seen {
            seq = self.cond.wait(seq).unwrap();
        }
    }
}

/// Identifies a lane inside a group.
///
/// Consumers registered with equal keys share the published stream
/// round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneKey {
    /// The node family (original node id for split replicas).
    pub family: usize,
    /// The input port of the consumer.
    pub port: usize,
}

/// Handle a consumer uses to talk to a group.
pub type ConsumerId = usize;

/// A published buffer on loan to a consumer.
///
/// Must be handed back with [`Group::release_input`].
pub struct InputBuffer {
    id: BufferId,
    requisition: Requisition,
    buffer: Arc<Mutex<Buffer>>,
}

impl InputBuffer {
    /// Id of the underlying buffer.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Shape of the underlying buffer.
    pub fn requisition(&self) -> Requisition {
        self.requisition
    }

    /// The buffer, shared with the other lanes it was broadcast to.
    pub fn buffer(&self) -> &Arc<Mutex<Buffer>> {
        &self.buffer
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuffer")
            .field("id", &self.id.get())
            .field("requisition", &self.requisition)
            .finish()
    }
}

/// Result of a non-blocking input poll.
#[derive(Debug)]
pub enum InputPoll {
    /// The next buffer in publish order.
    Ready(InputBuffer),
    /// Nothing available yet.
    Pending,
    /// The producer finished and everything was delivered.
    EndOfStream,
}

/// Group statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Buffers published so far.
    pub published: u64,
    /// Buffers currently allocated (free, in flight or held by the producer).
    pub allocated: usize,
    /// Buffers in the free pool.
    pub free: usize,
    /// Published buffers not yet released by all their consumers.
    pub pending: usize,
    /// Maximum number of buffers.
    pub capacity: usize,
}

struct Lane {
    key: LaneKey,
    members: Vec<ConsumerId>,
    next: usize,
    sequential: bool,
}

struct Consumer {
    queue: VecDeque<BufferId>,
    attached: bool,
    signal: Arc<Signal>,
    /// Sub-stream length in a sequential lane, unbounded if `None`.
    expected: Option<u64>,
    received: u64,
    /// Got its whole sub-stream.
    ended: bool,
}

impl Consumer {
    fn accepts(&self) -> bool {
        self.attached && !self.ended
    }
}

struct InFlight {
    buffer: Arc<Mutex<Buffer>>,
    requisition: Requisition,
    pending: usize,
}

struct GroupState {
    capacity: usize,
    allocated: usize,
    free: Vec<Buffer>,
    lanes: Vec<Lane>,
    consumers: Vec<Consumer>,
    in_flight: HashMap<BufferId, InFlight>,
    finished: bool,
    aborted: bool,
    published: u64,
}

impl GroupState {
    /// Whether consumers were registered but all of them went away.
    fn abandoned(&self) -> bool {
        !self.consumers.is_empty() && self.consumers.iter().all(|c| !c.attached)
    }

    /// Drop one consumer's claim on an in-flight buffer, returning the
    /// buffer to the pool when it was the last one.
    fn release(&mut self, id: BufferId) -> bool {
        let Some(entry) = self.in_flight.get_mut(&id) else {
            return false;
        };
        entry.pending -= 1;
        if entry.pending > 0 {
            return false;
        }

        if let Some(entry) = self.in_flight.remove(&id) {
            match Arc::try_unwrap(entry.buffer) {
                Ok(mutex) => self
                    .free
                    .push(mutex.into_inner().unwrap_or_else(PoisonError::into_inner)),
                // A consumer still holds a clone; let it drop the storage.
                Err(_) => self.allocated -= 1,
            }
        }
        true
    }
}

struct GroupInner {
    name: String,
    context: Context,
    state: Mutex<GroupState>,
    space: Condvar,
}

/// Buffer channel from one producer to its consumers.
///
/// Cheap to clone; clones share the same pool and queues.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    /// Create a group allocating at most `capacity` buffers from `context`.
    pub fn new(name: impl Into<String>, context: Context, capacity: usize) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                name: name.into(),
                context,
                state: Mutex::new(GroupState {
                    capacity: capacity.max(1),
                    allocated: 0,
                    free: Vec::new(),
                    lanes: Vec::new(),
                    consumers: Vec::new(),
                    in_flight: HashMap::new(),
                    finished: false,
                    aborted: false,
                    published: 0,
                }),
                space: Condvar::new(),
            }),
        }
    }

    /// Name of the group (the producer's name).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a consumer in the lane `key`.
    ///
    /// The capacity grows to keep one buffer more than there are consumers,
    /// so every consumer can hold a buffer while the producer fills the next.
    pub fn register_consumer(&self, key: LaneKey, signal: Arc<Signal>) -> ConsumerId {
        self.register(key, signal, false, None)
    }

    /// Register a consumer in the sequential lane `key`.
    ///
    /// Members are served in registration order. This one receives
    /// `expected` buffers followed by its own end-of-stream; with `None` it
    /// keeps receiving until the producer finishes.
    pub fn register_sequential(
        &self,
        key: LaneKey,
        signal: Arc<Signal>,
        expected: Option<u64>,
    ) -> ConsumerId {
        self.register(key, signal, true, expected)
    }

    fn register(
        &self,
        key: LaneKey,
        signal: Arc<Signal>,
        sequential: bool,
        expected: Option<u64>,
    ) -> ConsumerId {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.consumers.len();
        state.consumers.push(Consumer {
            queue: VecDeque::new(),
            attached: true,
            signal,
            expected,
            received: 0,
            ended: expected == Some(0),
        });

        match state.lanes.iter_mut().find(|lane| lane.key == key) {
            Some(lane) => {
                lane.members.push(id);
                lane.sequential |= sequential;
            }
            None => state.lanes.push(Lane {
                key,
                members: vec![id],
                next: 0,
                sequential,
            }),
        }

        let needed = state.consumers.len() + 1;
        if state.capacity < needed {
            state.capacity = needed;
        }
        id
    }

    /// Get a buffer to write the next output into.
    ///
    /// Reuses a free buffer (resized if its shape differs) or allocates a
    /// new one while below capacity; otherwise blocks until a consumer
    /// releases one. Fails with [`Error::Aborted`] once the run is aborted
    /// or every consumer has detached.
    pub fn acquire_output(&self, requisition: &Requisition) -> Result<Buffer> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.aborted || state.abandoned() {
                return Err(Error::Aborted);
            }

            if let Some(mut buffer) = state.free.pop() {
                observability::record_group_pool(&self.inner.name, state.allocated, state.free.len());
                drop(state);
                buffer.metadata_mut().clear();
                if !buffer.compare_shape(requisition) {
                    tracing::trace!(group = %self.inner.name, ?requisition, "resizing pooled buffer");
                    buffer.resize(*requisition)?;
                }
                return Ok(buffer);
            }

            if state.allocated < state.capacity {
                state.allocated += 1;
                drop(state);
                return match Buffer::new(*requisition, &self.inner.context) {
                    Ok(buffer) => {
                        tracing::trace!(group = %self.inner.name, ?requisition, "allocated buffer");
                        Ok(buffer)
                    }
                    Err(e) => {
                        self.inner.state.lock().unwrap().allocated -= 1;
                        Err(e)
                    }
                };
            }

            state = self.inner.space.wait(state).unwrap();
        }
    }

    /// Return an output buffer that will not be published.
    pub fn recycle(&self, buffer: Buffer) {
        let mut state = self.inner.state.lock().unwrap();
        state.free.push(buffer);
        self.inner.space.notify_all();
    }

    /// Hand a filled buffer to the consumers.
    ///
    /// Each lane gets the buffer once, going to the next attached member
    /// in turn, or to the current member of a sequential lane. Without
    /// consumers left to take it the buffer goes straight back to the pool.
    pub fn publish(&self, buffer: Buffer) {
        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;

        if state.aborted {
            state.free.push(buffer);
            self.inner.space.notify_all();
            return;
        }

        let mut targets = Vec::with_capacity(state.lanes.len());
        for lane in &mut state.lanes {
            let n = lane.members.len();
            if lane.sequential {
                while lane.next < n && !state.consumers[lane.members[lane.next]].accepts() {
                    lane.next += 1;
                }
                let Some(&member) = lane.members.get(lane.next) else {
                    continue;
                };
                let consumer = &mut state.consumers[member];
                consumer.received += 1;
                if consumer.expected == Some(consumer.received) {
                    consumer.ended = true;
                    lane.next += 1;
                }
                targets.push(member);
                continue;
            }
            for step in 0..n {
                let member = lane.members[(lane.next + step) % n];
                if state.consumers[member].accepts() {
                    lane.next = (lane.next + step + 1) % n;
                    targets.push(member);
                    break;
                }
            }
        }

        state.published += 1;
        if targets.is_empty() {
            state.free.push(buffer);
            self.inner.space.notify_all();
            return;
        }

        let id = buffer.id();
        let requisition = buffer.requisition();
        state.in_flight.insert(
            id,
            InFlight {
                buffer: Arc::new(Mutex::new(buffer)),
                requisition,
                pending: targets.len(),
            },
        );
        for &target in &targets {
            let consumer = &mut state.consumers[target];
            consumer.queue.push_back(id);
            consumer.signal.notify();
        }
        tracing::trace!(group = %self.inner.name, buffer = id.get(), consumers = targets.len(), "published");
    }

    /// Take the next buffer for `consumer` without blocking.
    pub fn try_acquire_input(&self, consumer: ConsumerId) -> InputPoll {
        let mut state = self.inner.state.lock().unwrap();
        if state.aborted {
            return InputPoll::EndOfStream;
        }

        let consumer = &mut state.consumers[consumer];
        let ended = consumer.ended;
        match consumer.queue.pop_front() {
            Some(id) => match state.in_flight.get(&id) {
                Some(entry) => InputPoll::Ready(InputBuffer {
                    id,
                    requisition: entry.requisition,
                    buffer: entry.buffer.clone(),
                }),
                None => InputPoll::Pending,
            },
            None if state.finished || ended => InputPoll::EndOfStream,
            None => InputPoll::Pending,
        }
    }

    /// Block until the next buffer for `consumer` is available.
    ///
    /// Returns `None` at end-of-stream.
    pub fn acquire_input(&self, consumer: ConsumerId) -> Option<InputBuffer> {
        let signal = {
            let state = self.inner.state.lock().unwrap();
            state.consumers[consumer].signal.clone()
        };

        loop {
            let seen = signal.sequence();
            match self.try_acquire_input(consumer) {
                InputPoll::Ready(input) => return Some(input),
                InputPoll::EndOfStream => return None,
                InputPoll::Pending => signal.wait_past(seen),
            }
        }
    }

    /// Give a consumed buffer back.
    pub fn release_input(&self, input: InputBuffer) {
        let InputBuffer { id, buffer, .. } = input;
        drop(buffer);

        let mut state = self.inner.state.lock().unwrap();
        if state.release(id) {
            observability::record_group_pool(&self.inner.name, state.allocated, state.free.len());
            self.inner.space.notify_all();
        }
    }

    /// Stop delivering to `consumer` and drop its backlog.
    ///
    /// Used by consumers that stop before end-of-stream, so the producer
    /// never waits on them.
    pub fn detach(&self, consumer: ConsumerId) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.consumers[consumer].attached {
            return;
        }
        state.consumers[consumer].attached = false;
        let backlog: Vec<BufferId> = state.consumers[consumer].queue.drain(..).collect();
        for id in backlog {
            state.release(id);
        }
        self.inner.space.notify_all();
    }

    /// Mark the end of the stream. Consumers see end-of-stream once they
    /// have drained what was already published.
    pub fn finish(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.finished {
            return;
        }
        state.finished = true;
        for consumer in &state.consumers {
            consumer.signal.notify();
        }
    }

    /// Abort: wake everybody, consumers see end-of-stream immediately and
    /// producers get [`Error::Aborted`].
    pub fn abort(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.aborted = true;
        state.finished = true;
        for consumer in &state.consumers {
            consumer.signal.notify();
        }
        self.inner.space.notify_all();
    }

    /// Whether [`Group::finish`] or [`Group::abort`] was called.
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().unwrap().finished
    }

    /// Current statistics.
    pub fn stats(&self) -> GroupStats {
        let state = self.inner.state.lock().unwrap();
        GroupStats {
            published: state.published,
            allocated: state.allocated,
            free: state.free.len(),
            pending: state.in_flight.len(),
            capacity: state.capacity,
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn lane(family: usize) -> LaneKey {
        LaneKey { family, port: 0 }
    }

    fn fill(group: &Group, value: f32) -> Buffer {
        let ctx = Context::sim(1);
        let queue = ctx.queue(0).unwrap();
        let mut buffer = group.acquire_output(&Requisition::new(&[4])).unwrap();
        buffer.host_view_mut(&queue).unwrap().data_mut().fill(value);
        buffer
    }

    fn first_value(input: &InputBuffer) -> f32 {
        let ctx = Context::sim(1);
        let queue = ctx.queue(0).unwrap();
        let mut buffer = input.buffer().lock().unwrap();
        buffer.host_view(&queue).unwrap().data()[0]
    }

    #[test]
    fn test_broadcast_to_two_consumers() {
        let group = Group::new("src", Context::sim(1), 4);
        let a = group.register_consumer(lane(1), Arc::new(Signal::new()));
        let b = group.register_consumer(lane(2), Arc::new(Signal::new()));

        group.publish(fill(&group, 5.0));

        let ia = group.acquire_input(a).unwrap();
        let ib = group.acquire_input(b).unwrap();
        assert_eq!(ia.id(), ib.id());
        assert_eq!(first_value(&ia), 5.0);
        assert_eq!(first_value(&ib), 5.0);

        // Not back in the pool until both consumers released it.
        group.release_input(ia);
        assert_eq!(group.stats().free, 0);
        assert_eq!(group.stats().pending, 1);
        group.release_input(ib);
        assert_eq!(group.stats().free, 1);
        assert_eq!(group.stats().pending, 0);
    }

    #[test]
    fn test_scatter_within_lane() {
        let group = Group::new("src", Context::sim(1), 4);
        let a = group.register_consumer(lane(7), Arc::new(Signal::new()));
        let b = group.register_consumer(lane(7), Arc::new(Signal::new()));

        for i in 0..4 {
            group.publish(fill(&group, i as f32));
            // Release right away so the pool never runs dry.
            let consumer = if i % 2 == 0 { a } else { b };
            let input = group.acquire_input(consumer).unwrap();
            assert_eq!(first_value(&input), i as f32);
            group.release_input(input);
        }

        group.finish();
        assert!(group.acquire_input(a).is_none());
        assert!(group.acquire_input(b).is_none());
    }

    #[test]
    fn test_fifo_per_consumer() {
        let group = Group::new("src", Context::sim(1), 8);
        let c = group.register_consumer(lane(1), Arc::new(Signal::new()));
        for i in 0..5 {
            group.publish(fill(&group, i as f32));
        }
        group.finish();

        let mut seen = Vec::new();
        while let Some(input) = group.acquire_input(c) {
            seen.push(first_value(&input));
            group.release_input(input);
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_sequential_lane_cuts_sub_streams() {
        let group = Group::new("src", Context::sim(1), 8);
        let a = group.register_sequential(lane(1), Arc::new(Signal::new()), Some(2));
        let b = group.register_sequential(lane(1), Arc::new(Signal::new()), None);
        for i in 0..5 {
            group.publish(fill(&group, i as f32));
        }

        let drain = |consumer| {
            let mut seen = Vec::new();
            while let InputPoll::Ready(input) = group.try_acquire_input(consumer) {
                seen.push(first_value(&input));
                group.release_input(input);
            }
            seen
        };

        // `a` got its two buffers and its own end-of-stream before the
        // producer finished.
        assert_eq!(drain(a), vec![0.0, 1.0]);
        assert!(matches!(group.try_acquire_input(a), InputPoll::EndOfStream));
        assert!(group.acquire_input(a).is_none());

        assert_eq!(drain(b), vec![2.0, 3.0, 4.0]);
        assert!(matches!(group.try_acquire_input(b), InputPoll::Pending));
        group.finish();
        assert!(group.acquire_input(b).is_none());
        assert_eq!(group.stats().pending, 0);
    }

    #[test]
    fn test_sequential_lane_without_open_member_recycles() {
        let group = Group::new("src", Context::sim(1), 2);
        let a = group.register_sequential(lane(1), Arc::new(Signal::new()), Some(1));
        group.publish(fill(&group, 1.0));
        group.publish(fill(&group, 2.0));

        let input = group.acquire_input(a).unwrap();
        assert_eq!(first_value(&input), 1.0);
        group.release_input(input);
        assert!(group.acquire_input(a).is_none());
        assert_eq!(group.stats().published, 2);
        assert_eq!(group.stats().pending, 0);
    }

    #[test]
    fn test_capacity_tracks_consumers() {
        let group = Group::new("src", Context::sim(1), 1);
        assert_eq!(group.stats().capacity, 1);
        for family in 0..3 {
            group.register_consumer(lane(family), Arc::new(Signal::new()));
        }
        assert_eq!(group.stats().capacity, 4);
    }

    #[test]
    fn test_acquire_output_blocks_until_release() {
        let group = Group::new("src", Context::sim(1), 1);
        let c = group.register_consumer(lane(1), Arc::new(Signal::new()));
        // Capacity is now 2.
        group.publish(fill(&group, 1.0));
        group.publish(fill(&group, 2.0));
        assert_eq!(group.stats().allocated, 2);

        let producer = {
            let group = group.clone();
            thread::spawn(move || {
                let buffer = group.acquire_output(&Requisition::new(&[4])).unwrap();
                group.recycle(buffer);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let input = group.acquire_input(c).unwrap();
        group.release_input(input);
        producer.join().unwrap();
        assert_eq!(group.stats().allocated, 2);
    }

    #[test]
    fn test_pooled_buffer_is_resized() {
        let group = Group::new("src", Context::sim(1), 1);
        let buffer = group.acquire_output(&Requisition::new(&[4])).unwrap();
        let id = buffer.id();
        group.recycle(buffer);

        let buffer = group.acquire_output(&Requisition::new(&[2, 2, 2])).unwrap();
        assert_eq!(buffer.id(), id);
        assert_eq!(buffer.requisition(), Requisition::new(&[2, 2, 2]));
    }

    #[test]
    fn test_detach_releases_backlog() {
        let group = Group::new("src", Context::sim(1), 4);
        let a = group.register_consumer(lane(1), Arc::new(Signal::new()));
        let b = group.register_consumer(lane(2), Arc::new(Signal::new()));

        group.publish(fill(&group, 1.0));
        group.detach(b);

        let input = group.acquire_input(a).unwrap();
        group.release_input(input);
        assert_eq!(group.stats().pending, 0);

        // Later buffers skip the detached consumer.
        group.publish(fill(&group, 2.0));
        assert!(matches!(group.try_acquire_input(b), InputPoll::Pending));
        let input = group.acquire_input(a).unwrap();
        group.release_input(input);

        group.detach(a);
        assert!(matches!(
            group.acquire_output(&Requisition::new(&[4])),
            Err(Error::Aborted)
        ));
    }

    #[test]
    fn test_detached_replica_is_skipped() {
        let group = Group::new("src", Context::sim(1), 4);
        let a = group.register_consumer(lane(1), Arc::new(Signal::new()));
        let b = group.register_consumer(lane(1), Arc::new(Signal::new()));
        group.detach(a);

        for _ in 0..3 {
            group.publish(fill(&group, 1.0));
            let input = group.acquire_input(b).unwrap();
            group.release_input(input);
        }
        assert_eq!(group.stats().published, 3);
    }

    #[test]
    fn test_abort_wakes_consumer_and_producer() {
        let group = Group::new("src", Context::sim(1), 1);
        let c = group.register_consumer(lane(1), Arc::new(Signal::new()));

        let consumer = {
            let group = group.clone();
            thread::spawn(move || group.acquire_input(c).is_none())
        };

        thread::sleep(Duration::from_millis(20));
        group.abort();
        assert!(consumer.join().unwrap());
        assert!(matches!(
            group.acquire_output(&Requisition::new(&[1])),
            Err(Error::Aborted)
        ));
    }

    #[test]
    fn test_publish_without_consumers_recycles() {
        let group = Group::new("sink", Context::sim(1), 2);
        group.publish(fill(&group, 1.0));
        let stats = group.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.free, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_signal_wait_past() {
        let signal = Arc::new(Signal::new());
        let seen = signal.sequence();
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_past(seen))
        };
        thread::sleep(Duration::from_millis(10));
        signal.notify();
        waiter.join().unwrap();
        assert_ne!(signal.sequence(), seen);
    }
}
