//! Mapping nodes onto processing resources and splitting device paths.

use super::graph::{NodeId, TaskGraph};
use super::node::TaskNode;
use crate::error::{Error, Result};
use crate::resources::Resources;
use crate::task::Placement;
use tracing::debug;

impl TaskGraph {
    /// Assign a processing resource to every device node not mapped yet.
    ///
    /// Walks depth-first from each root, moving to the next resource after
    /// each branch, so parallel branches (and split replicas) land on
    /// different resources. Host nodes stay unmapped.
    pub fn map(&mut self, resources: &Resources) -> Result<()> {
        let n = resources.processing_resources().len();
        let device_nodes = self
            .node_ids()
            .into_iter()
            .filter(|&id| self.dag[id.0].placement() == Placement::Device)
            .count();

        if device_nodes == 0 {
            return Ok(());
        }
        if n == 0 {
            return Err(Error::setup(format!(
                "{} device tasks but no processing resources",
                device_nodes
            )));
        }

        for root in self.roots() {
            self.map_node(root, 0, resources);
        }
        Ok(())
    }

    fn map_node(&mut self, id: NodeId, mut index: usize, resources: &Resources) {
        let node = &mut self.dag[id.0];
        if node.placement() == Placement::Device && node.resource().is_none() {
            if let Some(resource) = resources.processing_resource(index) {
                debug!(node = node.name(), %resource, "mapped");
            }
            node.set_resource(Some(index));
        }

        let n = resources.processing_resources().len();
        for (succ, _) in self.successors(id) {
            self.map_node(succ, index, resources);
            index = (index + 1) % n;
        }
    }

    /// Duplicate every independent splittable path so each runs `replicas`
    /// times.
    ///
    /// A splittable path is a chain of device nodes that are not reducers,
    /// together with the node feeding it and the node it feeds. Paths
    /// sharing a node with an earlier path are dropped. The inner nodes of
    /// each remaining path are copied `replicas - 1` times; the entry node
    /// scatters its outputs over the copies and the exit node merges them.
    /// Inner nodes with more than one predecessor are not copied: the
    /// copied chain reconnects into them.
    ///
    /// Returns the number of nodes added over all paths.
    pub fn split(&mut self, replicas: usize) -> Result<usize> {
        if replicas <= 1 {
            return Ok(0);
        }

        let paths = self.paths(TaskNode::is_splittable);
        debug!(paths = paths.len(), "identified splittable paths");
        let paths = remove_common_ancestry(paths);
        debug!(paths = paths.len(), "independent splittable paths");

        let before = self.node_count();
        for path in paths.iter().filter(|path| path.len() >= 3) {
            for copy in 1..replicas {
                self.expand(path, copy)?;
            }
        }
        let added = self.node_count() - before;
        debug!(replicas, added, "split paths");
        Ok(added)
    }

    /// All maximal chains of nodes satisfying `pred`, each extended by the
    /// node feeding it and the node it feeds.
    ///
    /// A chain reachable over several routes is reported once per route.
    pub fn paths(&self, pred: impl Fn(&TaskNode) -> bool) -> Vec<Vec<NodeId>> {
        let mut paths = Vec::new();
        for root in self.roots() {
            self.pickup_paths(&pred, root, root, Vec::new(), &mut paths);
        }
        paths
    }

    fn pickup_paths(
        &self,
        pred: &dyn Fn(&TaskNode) -> bool,
        current: NodeId,
        last: NodeId,
        mut path: Vec<NodeId>,
        paths: &mut Vec<Vec<NodeId>>,
    ) {
        if pred(&self.dag[current.0]) {
            if !pred(&self.dag[last.0]) {
                path.push(last);
            }
            path.push(current);
        } else {
            if !path.is_empty() {
                path.push(current);
                paths.push(path);
            }
            path = Vec::new();
        }

        for (succ, _) in self.successors(current) {
            self.pickup_paths(pred, succ, current, path.clone(), paths);
        }
    }

    /// Copy the inner nodes of `path` once, wiring the copies between the
    /// path's entry and exit.
    fn expand(&mut self, path: &[NodeId], copy: usize) -> Result<()> {
        let (head, rest) = path.split_first().ok_or_else(|| cannot_split("empty path"))?;
        let (tail, inner) = rest.split_last().ok_or_else(|| cannot_split("path too short"))?;

        let mut orig = *head;
        let mut current = *head;

        for &next in inner {
            let port = self
                .edge_port(orig, next)
                .ok_or_else(|| cannot_split("path is not connected"))?;

            if self.predecessors(next).len() <= 1 {
                let replica = self.dag[next.0]
                    .replicate(next, copy)
                    .ok_or_else(|| cannot_split("node cannot be duplicated"))?;
                if self.node_id(replica.name()).is_some() {
                    return Err(cannot_split(&format!(
                        "a node called '{}' already exists",
                        replica.name()
                    )));
                }
                let replica = self.insert(replica);
                self.add_path_edge(current, replica, port)?;
                current = replica;
            } else {
                self.add_path_edge(current, next, port)?;
                current = next;
            }
            orig = next;
        }

        let port = self
            .edge_port(orig, *tail)
            .ok_or_else(|| cannot_split("path is not connected"))?;
        self.add_path_edge(current, *tail, port)
    }

    fn add_path_edge(&mut self, src: NodeId, dst: NodeId, port: usize) -> Result<()> {
        if self.dag.find_edge(src.0, dst.0).is_some() {
            return Ok(());
        }
        self.dag
            .add_edge(src.0, dst.0, port)
            .map(|_| ())
            .map_err(|_| cannot_split("duplicated edge would create a cycle"))
    }
}

fn cannot_split(reason: &str) -> Error {
    Error::GraphStructure(format!("cannot split path: {}", reason))
}

/// Keep only paths whose nodes (except the exit) no earlier path visited.
fn remove_common_ancestry(paths: Vec<Vec<NodeId>>) -> Vec<Vec<NodeId>> {
    let mut visited = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|path| {
            let body = &path[..path.len().saturating_sub(1)];
            if body.iter().any(|id| visited.contains(id)) {
                return false;
            }
            visited.extend(body.iter().copied());
            true
        })
        .collect()
}
