//! Pipeline graph: owns the nodes, wires edges and drives the lifecycle.
//!
//! Edges are only accepted if they keep the graph acyclic, so a topological
//! order always exists. Lifecycle operations walk that order: `init_all`
//! upstream first, `start_all` downstream first (so no node receives data
//! before its consumers run), `stop_all` drains upstream first.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{DataId, NodeId};
use crate::pipeline::node::{
    NodeLifecycle, NodeProcessor, NodeRuntime, NodeSnapshot, PipelineNode, DEFAULT_DRAIN_TIMEOUT,
};
use crate::pipeline::request::FrameRequest;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A `from -> to` connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub id: DataId,
    pub from: NodeId,
    pub to: NodeId,
}

/// Point-in-time view of the whole graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<Edge>,
}

pub struct PipelineGraph {
    nodes: Vec<Arc<PipelineNode>>,
    edges: Vec<Edge>,
    runtime: NodeRuntime,
}

impl PipelineGraph {
    pub fn new(runtime: NodeRuntime) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            runtime,
        }
    }

    pub fn runtime(&self) -> &NodeRuntime {
        &self.runtime
    }

    // ── Graph building ──

    /// Add a node to the graph. Returns its NodeId.
    pub fn add_node(&mut self, name: impl Into<String>, processor: impl NodeProcessor + 'static) -> NodeId {
        self.add_boxed_node(name, Box::new(processor))
    }

    pub fn add_boxed_node(
        &mut self,
        name: impl Into<String>,
        processor: Box<dyn NodeProcessor>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let node = PipelineNode::new(id, name, processor, self.runtime.clone());
        tracing::debug!("Graph: added node '{}' as {}", node.name(), id);
        self.nodes.push(node);
        id
    }

    /// Connect `from` to `to`. The first edge connected from a node becomes
    /// its `Route::Downstream` target.
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> PipelineResult<DataId> {
        let from_node = self.node(from).ok_or(PipelineError::UnknownNode(from))?;
        let to_node = self.node(to).ok_or(PipelineError::UnknownNode(to))?;

        if from == to {
            return Err(PipelineError::InvalidEdge(format!(
                "'{}' cannot feed itself",
                from_node.name()
            )));
        }
        if self.edges.iter().any(|e| e.from == from && e.to == to) {
            return Err(PipelineError::InvalidEdge(format!(
                "'{}' -> '{}' already connected",
                from_node.name(),
                to_node.name()
            )));
        }
        if self.reaches(to, from) {
            tracing::warn!(
                "Graph: rejected edge '{}' -> '{}', it would close a cycle",
                from_node.name(),
                to_node.name()
            );
            return Err(PipelineError::CycleDetected { from, to });
        }

        let id = DataId(self.edges.len() as u32 + 1);
        from_node.add_downstream(id, to_node);
        tracing::debug!(
            "Graph: connected '{}' -> '{}' as {}",
            from_node.name(),
            to_node.name(),
            id
        );
        self.edges.push(Edge { id, from, to });
        Ok(id)
    }

    /// Whether `target` is reachable from `start` along existing edges.
    fn reaches(&self, start: NodeId, target: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if std::mem::replace(&mut visited[node.index()], true) {
                continue;
            }
            stack.extend(self.edges.iter().filter(|e| e.from == node).map(|e| e.to));
        }
        false
    }

    /// Topological order of all nodes (Kahn's algorithm).
    pub fn execution_order(&self) -> Vec<NodeId> {
        let n = self.nodes.len();
        let mut in_degree = vec![0u32; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

        for edge in &self.edges {
            adj[edge.from.index()].push(edge.to.index());
            in_degree[edge.to.index()] += 1;
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            order.push(NodeId(node as u32));
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            tracing::warn!(
                "Pipeline graph has a cycle! Only {} of {} nodes scheduled.",
                order.len(),
                n
            );
        }
        order
    }

    // ── Lifecycle ──

    pub fn init_all(&self) -> PipelineResult<()> {
        for id in self.execution_order() {
            self.nodes[id.index()].init()?;
        }
        tracing::info!("Graph: {} nodes initialized", self.nodes.len());
        Ok(())
    }

    pub fn start_all(&self) -> PipelineResult<()> {
        for id in self.execution_order().into_iter().rev() {
            self.nodes[id.index()].start()?;
        }
        tracing::info!("Graph: {} nodes running", self.nodes.len());
        Ok(())
    }

    /// Drain every node upstream first, then uninitialize all of them.
    /// Returns the first drain failure, after all nodes were stopped.
    pub fn stop_all(&self, drain_timeout: Duration) -> PipelineResult<()> {
        let order = self.execution_order();
        let mut first_error = None;
        for id in &order {
            if let Err(e) = self.nodes[id.index()].drain(drain_timeout) {
                first_error.get_or_insert(e);
            }
        }
        for id in &order {
            self.nodes[id.index()].uninit();
        }
        tracing::info!("Graph: stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Data path ──

    /// Feed an external request into `root`.
    pub fn on_data(&self, root: NodeId, request: FrameRequest) -> PipelineResult<()> {
        match self.node(root) {
            Some(node) => node.on_data(DataId::ROOT, request),
            None => {
                let mut request = request;
                request.release_buffers();
                Err(PipelineError::UnknownNode(root))
            }
        }
    }

    // ── Queries ──

    pub fn node(&self, id: NodeId) -> Option<&Arc<PipelineNode>> {
        self.nodes.get(id.index())
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<PipelineNode>> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Requests queued or in flight across all nodes.
    pub fn pending(&self) -> usize {
        self.nodes.iter().map(|n| n.pending()).sum()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.iter().map(|n| n.snapshot()).collect(),
            edges: self.edges.clone(),
        }
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        let active = self.nodes.iter().any(|n| {
            matches!(
                n.state(),
                NodeLifecycle::Running | NodeLifecycle::Draining | NodeLifecycle::Initialized
            )
        });
        if active {
            if let Err(e) = self.stop_all(DEFAULT_DRAIN_TIMEOUT) {
                tracing::warn!("Graph dropped while active: {}", e);
            }
        }
    }
}
