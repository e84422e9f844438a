//! OutputNode: reports finished requests.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::node::{IoPolicy, NodeProcessor, Route};
use crate::pipeline::request::{FrameRequest, FrameResult};
use crossbeam_channel::Sender;

/// Sends a [`FrameResult`] for every request and ends its route. The
/// request's buffers are released by the node afterwards.
pub struct OutputNode {
    results: Sender<FrameResult>,
}

impl OutputNode {
    pub fn new(results: Sender<FrameResult>) -> Self {
        Self { results }
    }
}

impl NodeProcessor for OutputNode {
    fn io_policy(&self) -> IoPolicy {
        IoPolicy::InPlace
    }

    fn process(&self, request: &mut FrameRequest) -> PipelineResult<Route> {
        let result = FrameResult::from_request(request);
        if self.results.send(result).is_err() {
            tracing::debug!(
                "Result receiver gone, request #{} not reported",
                request.request_no
            );
        }
        Ok(Route::Sink)
    }
}
