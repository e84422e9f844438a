//! ArbitratedNode: serializes an inner processor on a shared hardware block.

use crate::arbiter::{ArbiterError, ClientHandle, ResourceArbiter};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node::{IoPolicy, NodeInitContext, NodeProcessor, Route};
use crate::pipeline::request::FrameRequest;
use std::sync::{Arc, Mutex, PoisonError};

/// Wraps another processor. The node requests one client handle in
/// `on_init` and keeps it until `on_uninit`, so the number of workers
/// running this node never competes for handles. Every `process` call
/// acquires the resource with that handle for its whole duration; a timed
/// out acquisition fails the request.
pub struct ArbitratedNode {
    inner: Box<dyn NodeProcessor>,
    arbiter: Arc<ResourceArbiter>,
    client: Option<ClientHandle>,
    // Requests of this node share one handle; only one may hold it at a time.
    gate: Mutex<()>,
}

impl ArbitratedNode {
    pub fn new(inner: impl NodeProcessor + 'static, arbiter: Arc<ResourceArbiter>) -> Self {
        Self {
            inner: Box::new(inner),
            arbiter,
            client: None,
            gate: Mutex::new(()),
        }
    }

    pub fn arbiter(&self) -> &Arc<ResourceArbiter> {
        &self.arbiter
    }

    /// Handle held between `on_init` and `on_uninit`.
    pub fn client(&self) -> Option<ClientHandle> {
        self.client
    }

    fn return_client(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = self.arbiter.return_client(client) {
                tracing::warn!("[{}] uninit: {}", self.arbiter.name(), e);
            }
        }
    }
}

impl NodeProcessor for ArbitratedNode {
    fn io_policy(&self) -> IoPolicy {
        self.inner.io_policy()
    }

    fn on_init(&mut self, ctx: &mut NodeInitContext<'_>) -> PipelineResult<()> {
        if self.client.is_none() {
            let client =
                self.arbiter
                    .request_client()
                    .ok_or_else(|| ArbiterError::NoClientAvailable {
                        name: self.arbiter.name().to_string(),
                        max_clients: self.arbiter.max_clients(),
                    })?;
            self.client = Some(client);
        }

        if let Err(e) = self.inner.on_init(ctx) {
            self.return_client();
            return Err(e);
        }
        Ok(())
    }

    fn process(&self, request: &mut FrameRequest) -> PipelineResult<Route> {
        let client = self
            .client
            .ok_or_else(|| PipelineError::MissingResource(format!("{} client", self.arbiter.name())))?;

        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.arbiter.acquire_resource(client)?;
        tracing::trace!(
            "[{}] request #{} holds {}",
            self.arbiter.name(),
            request.request_no,
            client
        );
        let route = self.inner.process(request);
        if let Err(e) = self.arbiter.release_resource(client) {
            tracing::warn!("[{}] request #{}: {}", self.arbiter.name(), request.request_no, e);
        }
        route
    }

    fn on_uninit(&mut self) {
        self.inner.on_uninit();
        self.return_client();
    }
}
