//! RootNode: graph entry point.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::node::{IoPolicy, NodeProcessor, Route};
use crate::pipeline::request::FrameRequest;

/// Bypass entry node. Accepts requests from outside the graph on
/// `DataId::ROOT` and forwards them to its first downstream node.
#[derive(Debug, Default)]
pub struct RootNode;

impl RootNode {
    pub fn new() -> Self {
        Self
    }
}

impl NodeProcessor for RootNode {
    fn io_policy(&self) -> IoPolicy {
        IoPolicy::Bypass
    }

    fn process(&self, _request: &mut FrameRequest) -> PipelineResult<Route> {
        Ok(Route::Downstream)
    }
}
