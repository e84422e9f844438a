//! Node-based frame pipeline.
//!
//! Frames travel through a DAG of [`PipelineNode`]s as [`FrameRequest`]s.
//! Each processing node queues incoming requests privately; its routing loop
//! hands them to the shared [`TaskQueue`](crate::task_queue::TaskQueue),
//! which runs the node's [`NodeProcessor`] and forwards the request along the
//! returned [`Route`].
//!
//! # Default graph
//!
//! ```text
//! [root] ──► [p2a] ──► [mdp] ──► [output] ──► FrameResult channel
//!  bypass    arbitrated  in-out    in-place
//! ```
//!
//! # Design
//!
//! - **Weak downstream links**: the graph owns every node, nodes only hold
//!   `Weak` references to their consumers.
//! - **One worker pool**: per-node routing loops are cheap; the actual
//!   processing shares one bounded set of worker threads.
//! - **Buffers travel with the request**: a request owns its pooled buffers
//!   until a terminal node releases them.

pub mod error;
pub mod graph;
pub mod id;
pub mod node;
pub mod nodes;
pub mod request;

pub use error::{PipelineError, PipelineResult};
pub use graph::{Edge, GraphSnapshot, PipelineGraph};
pub use id::{DataId, NodeId};
pub use node::{
    IoPolicy, NodeInitContext, NodeLifecycle, NodeProcessor, NodeRuntime, NodeSnapshot,
    PipelineNode, Route, DEFAULT_DRAIN_TIMEOUT, DEFAULT_NODE_IDLE_WAIT,
};
pub use nodes::{ArbitratedNode, OutputNode, RootNode, StageNode};
pub use request::{FrameRequest, FrameResult};
