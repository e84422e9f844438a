//! StageNode: runs a processing closure on the task queue.
//!
//! With [`IoPolicy::InOut`] the node owns an output pool created during
//! `init`; each request gets one output buffer appended after the stage ran.
//! With [`IoPolicy::InPlace`] the stage only sees the request's existing
//! buffers.

use crate::buffer::{BufferPool, BufferSpec, PooledBuffer};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node::{IoPolicy, NodeInitContext, NodeProcessor, Route};
use crate::pipeline::request::FrameRequest;
use std::sync::Arc;

/// Stage callback. The output buffer is `Some` only for `InOut` stages.
pub type StageFn =
    dyn Fn(&mut FrameRequest, Option<&mut PooledBuffer>) -> PipelineResult<()> + Send + Sync;

pub struct StageNode {
    policy: IoPolicy,
    stage: Box<StageFn>,
    output: Option<(BufferSpec, usize)>,
    pool: Option<Arc<BufferPool>>,
}

impl StageNode {
    /// Stage that works on the request's buffers in place.
    pub fn in_place<F>(stage: F) -> Self
    where
        F: Fn(&mut FrameRequest, Option<&mut PooledBuffer>) -> PipelineResult<()>
            + Send
            + Sync
            + 'static,
    {
        Self {
            policy: IoPolicy::InPlace,
            stage: Box::new(stage),
            output: None,
            pool: None,
        }
    }

    /// Stage producing one `spec`-shaped output buffer per request, from a
    /// pool of `capacity` buffers.
    pub fn in_out<F>(spec: BufferSpec, capacity: usize, stage: F) -> Self
    where
        F: Fn(&mut FrameRequest, Option<&mut PooledBuffer>) -> PipelineResult<()>
            + Send
            + Sync
            + 'static,
    {
        Self {
            policy: IoPolicy::InOut,
            stage: Box::new(stage),
            output: Some((spec, capacity)),
            pool: None,
        }
    }

    /// Stage that does nothing; useful as a placeholder in a graph.
    pub fn passthrough() -> Self {
        Self::in_place(|_, _| Ok(()))
    }

    pub fn output_pool(&self) -> Option<&Arc<BufferPool>> {
        self.pool.as_ref()
    }
}

impl NodeProcessor for StageNode {
    fn io_policy(&self) -> IoPolicy {
        self.policy
    }

    fn on_init(&mut self, ctx: &mut NodeInitContext<'_>) -> PipelineResult<()> {
        if let Some((spec, capacity)) = &self.output {
            self.pool = Some(ctx.create_pool(spec.clone(), *capacity)?);
        }
        Ok(())
    }

    fn process(&self, request: &mut FrameRequest) -> PipelineResult<Route> {
        match self.policy {
            IoPolicy::InOut => {
                let pool = self.pool.as_ref().ok_or_else(|| {
                    PipelineError::MissingResource("output pool of an uninitialized stage".into())
                })?;
                let mut output = pool.acquire()?;
                (self.stage)(request, Some(&mut output))?;
                request.buffers.push(output);
            }
            IoPolicy::InPlace | IoPolicy::Bypass => (self.stage)(request, None)?,
        }
        Ok(Route::Downstream)
    }

    fn on_uninit(&mut self) {
        self.pool = None;
    }
}
