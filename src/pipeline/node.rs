//! Task graph nodes.

use super::graph::NodeId;
use crate::task::{Placement, TaskKind, TaskMode};

/// How a node hands its outputs to distinct downstream nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SendPattern {
    /// Every downstream node receives every output.
    #[default]
    Broadcast,
    /// Downstream nodes take turns; each output goes to exactly one of them.
    Scatter,
    /// The stream is cut into consecutive sub-streams, one per downstream
    /// node in node id order. Each node receives the count set with
    /// [`TaskNode::set_num_expected`] and then its own end-of-stream; a node
    /// without a count takes the rest of the stream.
    Sequential,
}

/// A node of a [`TaskGraph`](super::TaskGraph): one task plus its
/// scheduling attributes.
pub struct TaskNode {
    name: String,
    /// Taken out while the node's thread runs.
    task: Option<TaskKind>,
    placement: Placement,
    mode: TaskMode,
    arity: usize,
    resource: Option<usize>,
    send_pattern: SendPattern,
    expected: Vec<Option<u64>>,
    replica_of: Option<NodeId>,
}

impl TaskNode {
    /// Wrap a task.
    pub fn new(name: impl Into<String>, task: TaskKind) -> Self {
        Self {
            name: name.into(),
            placement: task.placement(),
            mode: task.mode(),
            arity: task.input_arity(),
            expected: vec![None; task.input_arity()],
            task: Some(task),
            resource: None,
            send_pattern: SendPattern::default(),
            replica_of: None,
        }
    }

    /// Copy of this node for a duplicated path, or `None` for host tasks
    /// and nodes whose task is currently running.
    pub(crate) fn replicate(&self, id: NodeId, copy: usize) -> Option<TaskNode> {
        let task = self.task.as_ref()?.duplicate()?;
        let mut node = TaskNode::new(format!("{}#{}", self.name, copy), task);
        node.send_pattern = self.send_pattern;
        node.expected = self.expected.clone();
        node.replica_of = Some(self.replica_of.unwrap_or(id));
        Some(node)
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped task, `None` while it runs.
    pub fn task(&self) -> Option<&TaskKind> {
        self.task.as_ref()
    }

    /// Mutable access to the wrapped task.
    pub fn task_mut(&mut self) -> Option<&mut TaskKind> {
        self.task.as_mut()
    }

    pub(crate) fn take_task(&mut self) -> Option<TaskKind> {
        self.task.take()
    }

    pub(crate) fn restore_task(&mut self, task: TaskKind) {
        self.task = Some(task);
    }

    /// Host or device.
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Execution mode.
    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    /// Number of input ports.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Index of the processing resource this node was mapped to.
    pub fn resource(&self) -> Option<usize> {
        self.resource
    }

    /// Pin the node to a processing resource; mapping leaves it alone.
    pub fn set_resource(&mut self, resource: Option<usize>) {
        self.resource = resource;
    }

    /// How outputs are distributed to downstream nodes.
    pub fn send_pattern(&self) -> SendPattern {
        self.send_pattern
    }

    /// Set the send pattern.
    pub fn set_send_pattern(&mut self, pattern: SendPattern) {
        self.send_pattern = pattern;
    }

    /// Number of buffers port `port` takes from a sequential producer.
    pub fn num_expected(&self, port: usize) -> Option<u64> {
        self.expected.get(port).copied().flatten()
    }

    /// Set the sub-stream length port `port` takes from a sequential
    /// producer. Ports the node does not have are ignored.
    pub fn set_num_expected(&mut self, port: usize, expected: u64) {
        if let Some(slot) = self.expected.get_mut(port) {
            *slot = Some(expected);
        }
    }

    /// The node this one was copied from by splitting.
    pub fn replica_of(&self) -> Option<NodeId> {
        self.replica_of
    }

    /// Whether splitting may duplicate this node.
    pub fn is_splittable(&self) -> bool {
        self.placement == Placement::Device && self.mode != TaskMode::Reduce
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("placement", &self.placement)
            .field("mode", &self.mode)
            .field("arity", &self.arity)
            .field("resource", &self.resource)
            .finish()
    }
}
