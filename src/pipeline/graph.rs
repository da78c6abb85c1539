//! Task graph structure using daggy.

use super::node::{SendPattern, TaskNode};
use crate::error::{Error, Result};
use crate::task::{CpuTask, DeviceTask, TaskKind};
use daggy::petgraph::Direction;
use daggy::{Dag, NodeIndex, Walker};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Unique identifier for a node in the task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) NodeIndex);

impl NodeId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// A directed acyclic graph of tasks.
///
/// Edges carry the input port of the consumer they lead into.
pub struct TaskGraph {
    pub(crate) dag: Dag<TaskNode, usize>,
    nodes_by_name: HashMap<String, NodeId>,
    /// Names added more than once; [`TaskGraph::validate`] rejects them.
    duplicate_names: Vec<String>,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            dag: Dag::new(),
            nodes_by_name: HashMap::new(),
            duplicate_names: Vec::new(),
        }
    }

    /// Add a node wrapping `task`.
    ///
    /// Names identify nodes in lookups and run reports and must be unique.
    /// A repeated name keeps resolving to the first node, and the graph no
    /// longer validates.
    pub fn add_node(&mut self, name: impl Into<String>, task: TaskKind) -> NodeId {
        self.insert(TaskNode::new(name, task))
    }

    /// Add a host task.
    pub fn add_cpu_task(&mut self, name: impl Into<String>, task: impl CpuTask + 'static) -> NodeId {
        self.add_node(name, TaskKind::cpu(task))
    }

    /// Add a device task.
    pub fn add_device_task(
        &mut self,
        name: impl Into<String>,
        task: impl DeviceTask + 'static,
    ) -> NodeId {
        self.add_node(name, TaskKind::device(task))
    }

    pub(crate) fn insert(&mut self, node: TaskNode) -> NodeId {
        let name = node.name().to_string();
        let id = NodeId(self.dag.add_node(node));
        if self.nodes_by_name.contains_key(&name) {
            self.duplicate_names.push(name);
        } else {
            self.nodes_by_name.insert(name, id);
        }
        id
    }

    /// Connect `src`'s output to input port 0 of `dst`.
    pub fn connect(&mut self, src: NodeId, dst: NodeId) -> Result<()> {
        self.connect_port(src, dst, 0)
    }

    /// Connect `src`'s output to input `port` of `dst`.
    pub fn connect_port(&mut self, src: NodeId, dst: NodeId, port: usize) -> Result<()> {
        let src_name = self
            .get_node(src)
            .map(|n| n.name().to_string())
            .ok_or_else(|| Error::GraphStructure("source node not found".into()))?;
        let dst_node = self
            .get_node(dst)
            .ok_or_else(|| Error::GraphStructure("destination node not found".into()))?;

        if port >= dst_node.arity() {
            return Err(Error::GraphStructure(format!(
                "node '{}' has no input port {} (arity {})",
                dst_node.name(),
                port,
                dst_node.arity()
            )));
        }
        let dst_name = dst_node.name().to_string();

        self.dag.add_edge(src.0, dst.0, port).map_err(|_| {
            Error::GraphStructure(format!(
                "connecting '{}' to '{}' would create a cycle",
                src_name, dst_name
            ))
        })?;
        Ok(())
    }

    /// Get a node by ID.
    pub fn get_node(&self, id: NodeId) -> Option<&TaskNode> {
        self.dag.node_weight(id.0)
    }

    /// Get a mutable reference to a node by ID.
    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut TaskNode> {
        self.dag.node_weight_mut(id.0)
    }

    /// Get a node ID by name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes_by_name.get(name).copied()
    }

    /// Set how `id` distributes its outputs to downstream nodes.
    pub fn set_send_pattern(&mut self, id: NodeId, pattern: SendPattern) {
        if let Some(node) = self.get_node_mut(id) {
            node.set_send_pattern(pattern);
        }
    }

    /// Set how many buffers `id` reads on `port` from a
    /// [`SendPattern::Sequential`] producer.
    pub fn set_num_expected(&mut self, id: NodeId, port: usize, expected: u64) {
        if let Some(node) = self.get_node_mut(id) {
            node.set_num_expected(port, expected);
        }
    }

    /// All node ids in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.dag.graph().node_indices().map(NodeId).collect()
    }

    /// Nodes without incoming edges.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Incoming)
    }

    /// Nodes without outgoing edges.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Outgoing)
    }

    fn nodes_without(&self, direction: Direction) -> Vec<NodeId> {
        self.dag
            .graph()
            .node_indices()
            .filter(|&idx| {
                self.dag
                    .graph()
                    .neighbors_directed(idx, direction)
                    .next()
                    .is_none()
            })
            .map(NodeId)
            .collect()
    }

    /// Downstream nodes of `id` with the port each edge leads into, ordered
    /// by node id.
    pub fn successors(&self, id: NodeId) -> Vec<(NodeId, usize)> {
        let mut out: Vec<_> = self
            .dag
            .children(id.0)
            .iter(&self.dag)
            .map(|(edge, node)| (NodeId(node), self.dag[edge]))
            .collect();
        out.sort();
        out
    }

    /// Upstream nodes of `id` with the port of `id` each edge leads into,
    /// ordered by node id.
    pub fn predecessors(&self, id: NodeId) -> Vec<(NodeId, usize)> {
        let mut out: Vec<_> = self
            .dag
            .parents(id.0)
            .iter(&self.dag)
            .map(|(edge, node)| (NodeId(node), self.dag[edge]))
            .collect();
        out.sort();
        out
    }

    /// Port label of the edge `src → dst`, if connected.
    pub fn edge_port(&self, src: NodeId, dst: NodeId) -> Option<usize> {
        self.dag
            .find_edge(src.0, dst.0)
            .and_then(|e| self.dag.edge_weight(e).copied())
    }

    /// Get the number of nodes.
    pub fn node_count(&self) -> usize {
        self.dag.node_count()
    }

    /// Get the number of edges.
    pub fn edge_count(&self) -> usize {
        self.dag.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// Validate the graph structure.
    ///
    /// Checks that:
    /// - There is at least one root and one leaf
    /// - Node names are unique
    /// - Every declared input port of every node is connected
    /// - No edge leads into an undeclared port
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::GraphStructure("graph is empty".into()));
        }
        if self.roots().is_empty() {
            return Err(Error::GraphStructure("graph has no root nodes".into()));
        }
        if self.leaves().is_empty() {
            return Err(Error::GraphStructure("graph has no leaf nodes".into()));
        }
        if let Some(name) = self.duplicate_names.first() {
            return Err(Error::GraphStructure(format!(
                "node name '{}' is used more than once",
                name
            )));
        }

        for id in self.node_ids() {
            let node = &self.dag[id.0];
            let mut connected = vec![false; node.arity()];
            for (_, port) in self.predecessors(id) {
                match connected.get_mut(port) {
                    Some(slot) => *slot = true,
                    None => {
                        return Err(Error::GraphStructure(format!(
                            "edge into undeclared port {} of node '{}'",
                            port,
                            node.name()
                        )));
                    }
                }
            }
            if let Some(port) = connected.iter().position(|c| !c) {
                return Err(Error::GraphStructure(format!(
                    "input port {} of node '{}' is not connected",
                    port,
                    node.name()
                )));
            }
        }

        Ok(())
    }

    /// GraphViz representation, for debugging.
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph tasks {\n");
        for id in self.node_ids() {
            let node = &self.dag[id.0];
            let _ = writeln!(
                dot,
                "  n{} [label=\"{}\\n{}\"];",
                id.index(),
                node.name(),
                node.placement()
            );
        }
        for id in self.node_ids() {
            for (succ, port) in self.successors(id) {
                let _ = writeln!(
                    dot,
                    "  n{} -> n{} [label=\"{}\"];",
                    id.index(),
                    succ.index(),
                    port
                );
            }
        }
        dot.push_str("}\n");
        dot
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
