//! Pipeline-specific error types.

use crate::arbiter::ArbiterError;
use crate::buffer::BufferError;
use crate::pipeline::id::NodeId;
use crate::pipeline::node::NodeLifecycle;
use crate::task_queue::TaskQueueError;
use thiserror::Error;

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Edge {from:?} -> {to:?} would create a cycle")]
    CycleDetected { from: NodeId, to: NodeId },

    #[error("Node '{node}' is not running ({state})")]
    NotRunning { node: String, state: NodeLifecycle },

    #[error("Node '{node}' cannot {op} while {state}")]
    InvalidState {
        node: String,
        state: NodeLifecycle,
        op: &'static str,
    },

    #[error("Missing node resource: {0}")]
    MissingResource(String),

    #[error("Node {node_id:?} error: {message}")]
    Node { node_id: NodeId, message: String },

    #[error("Node '{node}' still has {pending} requests in flight after drain timeout")]
    DrainTimeout { node: String, pending: usize },

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Arbiter error: {0}")]
    Arbiter(#[from] ArbiterError),

    #[error("Task queue error: {0}")]
    TaskQueue(#[from] TaskQueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
