//! Input ports: where a node pulls its buffers from.
//!
//! A port usually reads from a single group. After splitting, the exit node
//! of a duplicated path reads the same port from several groups; the port
//! then rotates over them, starting after the one that delivered last, so
//! no upstream replica starves and each edge stays FIFO.

use crate::group::{ConsumerId, Group, InputBuffer, InputPoll, Signal};

struct Source {
    group: Group,
    consumer: ConsumerId,
    done: bool,
}

/// A buffer pulled from a port, remembering where it came from.
#[derive(Debug)]
pub(crate) struct Pulled {
    source: usize,
    input: InputBuffer,
}

impl Pulled {
    pub(crate) fn input(&self) -> &InputBuffer {
        &self.input
    }
}

/// One input port of a node.
#[derive(Default)]
pub(crate) struct InputPort {
    sources: Vec<Source>,
    next: usize,
}

impl InputPort {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add an upstream group this port reads from.
    pub(crate) fn add_source(&mut self, group: Group, consumer: ConsumerId) {
        self.sources.push(Source {
            group,
            consumer,
            done: false,
        });
    }

    pub(crate) fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Block until any source delivers a buffer.
    ///
    /// Returns `None` once every source has reached end-of-stream.
    pub(crate) fn pull(&mut self, signal: &Signal) -> Option<Pulled> {
        let n = self.sources.len();
        loop {
            let seen = signal.sequence();
            let mut all_done = true;

            for step in 0..n {
                let index = (self.next + step) % n;
                let source = &mut self.sources[index];
                if source.done {
                    continue;
                }

                match source.group.try_acquire_input(source.consumer) {
                    InputPoll::Ready(input) => {
                        self.next = (index + 1) % n;
                        return Some(Pulled {
                            source: index,
                            input,
                        });
                    }
                    InputPoll::EndOfStream => source.done = true,
                    InputPoll::Pending => all_done = false,
                }
            }

            if all_done {
                return None;
            }
            signal.wait_past(seen);
        }
    }

    /// Hand a pulled buffer back to the group it came from.
    pub(crate) fn release(&self, pulled: Pulled) {
        self.sources[pulled.source].group.release_input(pulled.input);
    }

    /// Stop reading from every source that has not ended yet.
    pub(crate) fn detach(&mut self) {
        for source in &mut self.sources {
            if !source.done {
                source.group.detach(source.consumer);
                source.done = true;
            }
        }
    }
}
