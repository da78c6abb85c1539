//! Run events.
//!
//! The scheduler emits events while a graph runs. Any number of receivers
//! can subscribe; each one gets every event sent after it subscribed.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Events emitted by the scheduler during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The run started: all nodes were set up and threads are spawning.
    Started,

    /// A node thread started processing.
    NodeStarted {
        /// The node that started.
        node: String,
    },

    /// A node thread finished.
    NodeFinished {
        /// The node that finished.
        node: String,
        /// Number of times the node's compute step ran.
        processed: u64,
        /// Number of buffers the node published.
        published: u64,
    },

    /// A node failed. The run is being aborted.
    Error {
        /// The error message.
        message: String,
        /// The node where the error occurred (if known).
        node: Option<String>,
    },

    /// Every node ran to completion.
    Eos,

    /// All node threads have been joined.
    Stopped,
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::Started => write!(f, "Run started"),
            RunEvent::NodeStarted { node } => write!(f, "Node {} started", node),
            RunEvent::NodeFinished {
                node,
                processed,
                published,
            } => write!(
                f,
                "Node {} finished ({} processed, {} published)",
                node, processed, published
            ),
            RunEvent::Error { message, node } => {
                if let Some(n) = node {
                    write!(f, "Error in {}: {}", n, message)
                } else {
                    write!(f, "Error: {}", message)
                }
            }
            RunEvent::Eos => write!(f, "EOS"),
            RunEvent::Stopped => write!(f, "Run stopped"),
        }
    }
}

/// Sender side of the event fan-out.
///
/// Cheap to clone. Events are dropped for receivers whose queue is full or
/// that went away; sending never blocks a node thread.
#[derive(Clone)]
pub struct EventSender {
    subscribers: Arc<Mutex<Vec<kanal::Sender<RunEvent>>>>,
    capacity: usize,
}

impl EventSender {
    /// Create a sender whose receivers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Send an event to all receivers.
    ///
    /// Returns the number of receivers that got it.
    pub fn send(&self, event: RunEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers
            .iter()
            .filter(|tx| matches!(tx.try_send(event.clone()), Ok(true)))
            .count()
    }

    /// Send an EOS event.
    pub fn send_eos(&self) {
        self.send(RunEvent::Eos);
    }

    /// Send an error event.
    pub fn send_error(&self, message: impl Into<String>, node: Option<String>) {
        self.send(RunEvent::Error {
            message: message.into(),
            node,
        });
    }

    /// Send a node started event.
    pub fn send_node_started(&self, node: impl Into<String>) {
        self.send(RunEvent::NodeStarted { node: node.into() });
    }

    /// Send a node finished event.
    pub fn send_node_finished(&self, node: impl Into<String>, processed: u64, published: u64) {
        self.send(RunEvent::NodeFinished {
            node: node.into(),
            processed,
            published,
        });
    }

    /// Create a receiver for events sent from now on.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = kanal::bounded(self.capacity);
        self.subscribers.lock().unwrap().push(tx);
        EventReceiver { receiver: rx }
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("receivers", &self.receiver_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Receiver for run events.
pub struct EventReceiver {
    receiver: kanal::Receiver<RunEvent>,
}

impl EventReceiver {
    /// Block until the next event.
    ///
    /// Returns `None` once the scheduler that created the sender is gone
    /// and all events were received.
    pub fn recv(&self) -> Option<RunEvent> {
        self.receiver.recv().ok()
    }

    /// Wait at most `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RunEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Take an event without blocking.
    pub fn try_recv(&self) -> Option<RunEvent> {
        self.receiver.try_recv().ok().flatten()
    }

    /// Drain all currently queued events.
    pub fn drain(&self) -> Vec<RunEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Wait for EOS or an error.
    ///
    /// Returns `Ok(())` on EOS, `Err(message)` on error.
    pub fn wait_eos(&self) -> Result<(), String> {
        while let Some(event) = self.recv() {
            match event {
                RunEvent::Eos => return Ok(()),
                RunEvent::Error { message, node } => {
                    let full_msg = if let Some(n) = node {
                        format!("Error in {}: {}", n, message)
                    } else {
                        message
                    };
                    return Err(full_msg);
                }
                _ => continue,
            }
        }
        Err("Event channel closed unexpectedly".to_string())
    }
}

impl fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReceiver")
            .field("queued", &self.receiver.len())
            .finish()
    }
}
