//! Pipeline nodes.
//!
//! A [`PipelineNode`] wraps a [`NodeProcessor`] with everything the graph
//! needs around it:
//! - a lifecycle (`Created -> Initialized -> Running -> Draining ->
//!   Uninitialized`) checked by every entry point,
//! - a private queue drained by the node's own routing loop, which hands the
//!   actual processing to the shared [`TaskQueue`],
//! - weak references to downstream nodes, keyed by [`DataId`].
//!
//! Bypass nodes have no routing loop; `on_data` forwards on the caller's
//! thread.

use crate::buffer::{BufferAllocator, BufferPool, BufferSpec};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{DataId, NodeId};
use crate::pipeline::request::FrameRequest;
use crate::task_queue::TaskQueue;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default bound on how long `uninit` waits for a running node to drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default wait of the routing loop between stop checks.
pub const DEFAULT_NODE_IDLE_WAIT: Duration = Duration::from_millis(20);

/// How a node treats the buffers of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPolicy {
    /// Forward untouched, no processing.
    Bypass,
    /// Produce a new output buffer from the node's pool.
    InOut,
    /// Process the request's buffers in place.
    InPlace,
}

/// Where a processed request goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// First registered downstream edge.
    Downstream,
    /// A specific downstream edge.
    Edge(DataId),
    /// Terminal: release the request's buffers.
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLifecycle {
    Created,
    Initialized,
    Running,
    Draining,
    Uninitialized,
}

impl fmt::Display for NodeLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeLifecycle::Created => "created",
            NodeLifecycle::Initialized => "initialized",
            NodeLifecycle::Running => "running",
            NodeLifecycle::Draining => "draining",
            NodeLifecycle::Uninitialized => "uninitialized",
        };
        f.write_str(name)
    }
}

/// Handed to [`NodeProcessor::on_init`] so processors can create their pools.
pub struct NodeInitContext<'a> {
    node_id: NodeId,
    name: &'a str,
    allocator: &'a Arc<dyn BufferAllocator>,
    pools: Vec<Arc<BufferPool>>,
}

impl<'a> NodeInitContext<'a> {
    pub fn new(node_id: NodeId, name: &'a str, allocator: &'a Arc<dyn BufferAllocator>) -> Self {
        Self {
            node_id,
            name,
            allocator,
            pools: Vec::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Create a pool owned by this node for its whole initialized lifetime.
    pub fn create_pool(
        &mut self,
        spec: BufferSpec,
        capacity: usize,
    ) -> PipelineResult<Arc<BufferPool>> {
        let pool = BufferPool::new(spec, capacity, Arc::clone(self.allocator))?;
        self.pools.push(Arc::clone(&pool));
        Ok(pool)
    }

    pub fn into_pools(self) -> Vec<Arc<BufferPool>> {
        self.pools
    }
}

/// Processing callback of a node.
///
/// `process` runs on TaskQueue workers and may be called concurrently for
/// different requests. `on_init`/`on_uninit` are never concurrent with it.
pub trait NodeProcessor: Send + Sync {
    fn io_policy(&self) -> IoPolicy;

    fn on_init(&mut self, _ctx: &mut NodeInitContext<'_>) -> PipelineResult<()> {
        Ok(())
    }

    fn process(&self, request: &mut FrameRequest) -> PipelineResult<Route>;

    fn on_uninit(&mut self) {}
}

/// Shared services every node of a graph uses.
#[derive(Clone)]
pub struct NodeRuntime {
    pub task_queue: Arc<TaskQueue>,
    pub allocator: Arc<dyn BufferAllocator>,
    pub idle_wait: Duration,
}

struct Downstream {
    data_id: DataId,
    node_id: NodeId,
    node: Weak<PipelineNode>,
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub name: String,
    pub io_policy: IoPolicy,
    pub state: NodeLifecycle,
    pub pending: usize,
    pub processed: u64,
    pub rejected: u64,
    pub downstream: Vec<(DataId, NodeId)>,
}

pub struct PipelineNode {
    id: NodeId,
    name: String,
    io_policy: IoPolicy,
    processor: RwLock<Box<dyn NodeProcessor>>,
    state: Mutex<NodeLifecycle>,
    /// Signalled with `state` held when `in_flight` drops to zero.
    idle: Condvar,
    downstream: RwLock<Vec<Downstream>>,
    pools: Mutex<Vec<Arc<BufferPool>>>,
    tx: Sender<FrameRequest>,
    rx: Receiver<FrameRequest>,
    /// Requests queued or being processed.
    in_flight: AtomicUsize,
    processed: AtomicU64,
    rejected: AtomicU64,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    runtime: NodeRuntime,
    self_ref: Weak<PipelineNode>,
}

/// Decrements `in_flight` even when `process` panics.
struct InFlight<'a>(&'a PipelineNode);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

impl PipelineNode {
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        processor: Box<dyn NodeProcessor>,
        runtime: NodeRuntime,
    ) -> Arc<Self> {
        let name = name.into();
        let io_policy = processor.io_policy();
        let (tx, rx) = unbounded();
        Arc::new_cyclic(|self_ref| Self {
            id,
            name,
            io_policy,
            processor: RwLock::new(processor),
            state: Mutex::new(NodeLifecycle::Created),
            idle: Condvar::new(),
            downstream: RwLock::new(Vec::new()),
            pools: Mutex::new(Vec::new()),
            tx,
            rx,
            in_flight: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
            runtime,
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn io_policy(&self) -> IoPolicy {
        self.io_policy
    }

    fn lock_state(&self) -> MutexGuard<'_, NodeLifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> NodeLifecycle {
        *self.lock_state()
    }

    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn pools(&self) -> Vec<Arc<BufferPool>> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn add_downstream(&self, data_id: DataId, node: &Arc<PipelineNode>) {
        self.downstream
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Downstream {
                data_id,
                node_id: node.id,
                node: Arc::downgrade(node),
            });
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let downstream = self
            .downstream
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|d| (d.data_id, d.node_id))
            .collect();
        NodeSnapshot {
            id: self.id,
            name: self.name.clone(),
            io_policy: self.io_policy,
            state: self.state(),
            pending: self.pending(),
            processed: self.processed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            downstream,
        }
    }

    // ── Lifecycle ──

    /// Acquire node resources. A no-op unless the node is created or
    /// uninitialized.
    pub fn init(&self) -> PipelineResult<()> {
        let mut state = self.lock_state();
        match *state {
            NodeLifecycle::Created | NodeLifecycle::Uninitialized => {}
            other => {
                tracing::debug!("[{}] init ignored while {}", self.name, other);
                return Ok(());
            }
        }

        let mut ctx = NodeInitContext::new(self.id, &self.name, &self.runtime.allocator);
        self.processor
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .on_init(&mut ctx)?;
        let pools = ctx.into_pools();
        let pool_count = pools.len();
        *self.pools.lock().unwrap_or_else(PoisonError::into_inner) = pools;

        *state = NodeLifecycle::Initialized;
        tracing::info!(
            "[{}] initialized ({:?}, {} pools)",
            self.name,
            self.io_policy,
            pool_count
        );
        Ok(())
    }

    /// Start the routing loop and accept requests.
    pub fn start(&self) -> PipelineResult<()> {
        let mut state = self.lock_state();
        match *state {
            NodeLifecycle::Initialized => {}
            NodeLifecycle::Running => {
                tracing::debug!("[{}] already running", self.name);
                return Ok(());
            }
            other => {
                tracing::warn!("[{}] cannot start while {}", self.name, other);
                return Err(PipelineError::InvalidState {
                    node: self.name.clone(),
                    state: other,
                    op: "start",
                });
            }
        }

        if self.io_policy != IoPolicy::Bypass {
            let node = self.self_ref.upgrade().ok_or_else(|| PipelineError::Node {
                node_id: self.id,
                message: "node is being dropped".into(),
            })?;
            self.running.store(true, Ordering::Release);
            let spawned = thread::Builder::new()
                .name(format!("node-{}", self.name))
                .spawn(move || {
                    tracing::debug!("[{}] routing loop started", node.name);
                    while node.thread_loop() {}
                    tracing::debug!("[{}] routing loop exited", node.name);
                });
            match spawned {
                Ok(handle) => {
                    *self.loop_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle)
                }
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    return Err(e.into());
                }
            }
        }

        *state = NodeLifecycle::Running;
        tracing::info!("[{}] running", self.name);
        Ok(())
    }

    /// Stop accepting requests and wait until everything queued or in flight
    /// has been processed.
    pub fn drain(&self, timeout: Duration) -> PipelineResult<()> {
        let mut state = self.lock_state();
        match *state {
            NodeLifecycle::Running => {
                *state = NodeLifecycle::Draining;
                tracing::info!("[{}] draining {} requests", self.name, self.pending());
            }
            NodeLifecycle::Draining => {}
            other => {
                tracing::debug!("[{}] drain ignored while {}", self.name, other);
                return Ok(());
            }
        }

        let deadline = Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        let pending = self.in_flight.load(Ordering::SeqCst);
        drop(state);

        self.stop_loop();

        if pending > 0 {
            tracing::warn!("[{}] drain timed out with {} pending", self.name, pending);
            return Err(PipelineError::DrainTimeout {
                node: self.name.clone(),
                pending,
            });
        }
        tracing::info!("[{}] drained", self.name);
        Ok(())
    }

    fn stop_loop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("[{}] routing loop panicked", self.name);
            }
        }
    }

    /// Release node resources, draining first if the node is still running.
    pub fn uninit(&self) {
        if self.state() == NodeLifecycle::Running {
            if let Err(e) = self.drain(DEFAULT_DRAIN_TIMEOUT) {
                tracing::warn!("[{}] uninit: {}", self.name, e);
            }
        }

        let mut state = self.lock_state();
        match *state {
            NodeLifecycle::Initialized | NodeLifecycle::Draining => {}
            other => {
                tracing::debug!("[{}] uninit ignored while {}", self.name, other);
                return;
            }
        }

        self.processor
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .on_uninit();
        let pools = std::mem::take(&mut *self.pools.lock().unwrap_or_else(PoisonError::into_inner));
        for pool in &pools {
            if pool.outstanding() > 0 {
                tracing::warn!(
                    "[{}] pool '{}' still has {} buffers in use",
                    self.name,
                    pool.name(),
                    pool.outstanding()
                );
            }
        }

        *state = NodeLifecycle::Uninitialized;
        tracing::info!("[{}] uninitialized", self.name);
    }

    // ── Data path ──

    /// Accept a request arriving on `data_id`. Rejected requests have their
    /// buffers released.
    pub fn on_data(&self, data_id: DataId, mut request: FrameRequest) -> PipelineResult<()> {
        let state = self.lock_state();
        if *state != NodeLifecycle::Running {
            let current = *state;
            drop(state);
            tracing::warn!(
                "[{}] rejected request #{} on {}: node is {}",
                self.name,
                request.request_no,
                data_id,
                current
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            request.release_buffers();
            return Err(PipelineError::NotRunning {
                node: self.name.clone(),
                state: current,
            });
        }

        tracing::debug!(
            "[{}] request #{} (frame {}) on {}",
            self.name,
            request.request_no,
            request.frame_number,
            data_id
        );

        if self.io_policy == IoPolicy::Bypass {
            drop(state);
            request.mark_processed(&self.name);
            self.processed.fetch_add(1, Ordering::Relaxed);
            self.forward(Route::Downstream, request);
            return Ok(());
        }

        // Counted under the state lock so a concurrent drain cannot miss it.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        drop(state);
        if self.tx.send(request).is_err() {
            self.finish_one();
            return Err(PipelineError::ChannelSend);
        }
        Ok(())
    }

    /// One iteration of the routing loop. Returns false once the node has
    /// been stopped and its queue is empty.
    pub fn thread_loop(&self) -> bool {
        if !self.running.load(Ordering::Acquire) && self.rx.is_empty() {
            return false;
        }
        match self.rx.recv_timeout(self.runtime.idle_wait) {
            Ok(request) => {
                self.dispatch(request);
                true
            }
            Err(RecvTimeoutError::Timeout) => self.running.load(Ordering::Acquire),
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn dispatch(&self, request: FrameRequest) {
        let Some(node) = self.self_ref.upgrade() else {
            self.finish_one();
            return;
        };
        let request_no = request.request_no;
        // A rejected task is dropped with its request, which returns the buffers.
        if let Err(e) = self.runtime.task_queue.submit(move || node.run(request)) {
            tracing::warn!("[{}] dropped request #{}: {}", self.name, request_no, e);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            self.finish_one();
        }
    }

    fn run(&self, mut request: FrameRequest) {
        let _in_flight = InFlight(self);
        let route = self
            .processor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .process(&mut request);

        match route {
            Ok(route) => {
                request.mark_processed(&self.name);
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.forward(route, request);
            }
            Err(e) => {
                tracing::error!(
                    "[{}] request #{} failed: {}",
                    self.name,
                    request.request_no,
                    e
                );
                self.rejected.fetch_add(1, Ordering::Relaxed);
                request.release_buffers();
            }
        }
    }

    fn forward(&self, route: Route, mut request: FrameRequest) {
        let target = {
            let downstream = self.downstream.read().unwrap_or_else(PoisonError::into_inner);
            match route {
                Route::Sink => None,
                Route::Downstream => downstream.first().map(|d| (d.data_id, d.node.clone())),
                Route::Edge(data_id) => {
                    let found = downstream.iter().find(|d| d.data_id == data_id);
                    if found.is_none() {
                        tracing::warn!(
                            "[{}] request #{} routed to unknown edge {}",
                            self.name,
                            request.request_no,
                            data_id
                        );
                    }
                    found.map(|d| (d.data_id, d.node.clone()))
                }
            }
        };

        let Some((data_id, next)) = target else {
            let released = request.release_buffers();
            tracing::debug!(
                "[{}] request #{} done, released {} buffers",
                self.name,
                request.request_no,
                released
            );
            return;
        };

        match next.upgrade() {
            Some(next) => {
                // Rejections are logged and cleaned up by the receiver.
                let _ = next.on_data(data_id, request);
            }
            None => {
                tracing::warn!(
                    "[{}] downstream on {} is gone, dropping request #{}",
                    self.name,
                    data_id,
                    request.request_no
                );
                request.release_buffers();
            }
        }
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _state = self.lock_state();
            self.idle.notify_all();
        }
    }
}

impl fmt::Debug for PipelineNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("io_policy", &self.io_policy)
            .field("state", &self.state())
            .finish()
    }
}
