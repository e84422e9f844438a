//! Top-level owner of the frame pipeline.
//!
//! A [`FrameCoordinator`] owns exactly one of each component: the sensor
//! path state machine, the resource arbiter, the task queue, the scenario
//! controller and the pipeline graph. Captured frames are tagged with the
//! current path state, given a request number and fed into the graph root;
//! finished frames come out of [`FrameCoordinator::results`].

use crate::arbiter::ResourceArbiter;
use crate::buffer::{BufferAllocator, HeapAllocator};
use crate::capture::CapturedFrame;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result, ResultExt};
use crate::pipeline::{
    ArbitratedNode, FrameRequest, FrameResult, GraphSnapshot, NodeId, NodeRuntime, OutputNode,
    PipelineError, PipelineGraph, RootNode, StageNode,
};
use crate::scenario::{
    LoggingPolicyBackend, PolicyBackend, PolicyDirective, ScenarioController, ScenarioParam,
};
use crate::sensor_path::{
    Action, LmvState, SensorId, SensorPathStateMachine, SwitchDecision, SwitchResult, Transition,
};
use crate::task_queue::{TaskQueue, TaskQueueStats};
use crossbeam_channel::{unbounded, Receiver};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Names of the nodes in the default graph.
pub const ROOT_NODE: &str = "root";
pub const P2A_NODE: &str = "p2a";
pub const MDP_NODE: &str = "mdp";
pub const OUTPUT_NODE: &str = "output";

/// What happened to a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Enqueued { request_no: u64 },
    /// Frame from an inactive sensor without drain credit.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub accepted: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub stale_discards: u64,
    pub lmv_state: String,
    pub tasks: TaskQueueStats,
}

/// Default P2A stage: inspect the sensor buffer in place.
fn p2a_stage() -> StageNode {
    StageNode::in_place(|request, _| {
        let input = request.buffers.first().ok_or_else(|| {
            PipelineError::MissingResource(format!(
                "request #{} has no sensor buffer",
                request.request_no
            ))
        })?;
        let checksum: u64 = input.data.iter().take(256).map(|b| u64::from(*b)).sum();
        tracing::trace!(
            "p2a: request #{} frame {} checksum {}",
            request.request_no,
            request.frame_number,
            checksum
        );
        Ok(())
    })
}

/// Default MDP stage: copy the frame header into a fresh output buffer.
fn mdp_stage(config: &CoordinatorConfig) -> StageNode {
    let spec = config.pipeline.output_spec("mdp-out");
    StageNode::in_out(spec, config.pipeline.output_buffers, |request, output| {
        if let (Some(input), Some(output)) = (request.buffers.first(), output) {
            let n = input.len().min(output.len()).min(8);
            output.data[..n].copy_from_slice(&input.data[..n]);
        }
        Ok(())
    })
}

pub struct FrameCoordinatorBuilder {
    config: CoordinatorConfig,
    allocator: Option<Arc<dyn BufferAllocator>>,
    policy_backend: Option<Arc<dyn PolicyBackend>>,
    p2a_stage: Option<StageNode>,
    mdp_stage: Option<StageNode>,
}

impl FrameCoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            allocator: None,
            policy_backend: None,
            p2a_stage: None,
            mdp_stage: None,
        }
    }

    pub fn allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn policy_backend(mut self, backend: Arc<dyn PolicyBackend>) -> Self {
        self.policy_backend = Some(backend);
        self
    }

    /// Replace the stage run under the arbiter.
    pub fn p2a_stage(mut self, stage: StageNode) -> Self {
        self.p2a_stage = Some(stage);
        self
    }

    pub fn mdp_stage(mut self, stage: StageNode) -> Self {
        self.mdp_stage = Some(stage);
        self
    }

    pub fn build(self) -> Result<FrameCoordinator> {
        let config = self.config;
        config.validate()?;

        let state_machine = Arc::new(SensorPathStateMachine::new(
            &config.sensor_path.sensors,
            config.sensor_path.initial,
            config.sensor_path.drain_credits,
        )?);
        let arbiter = ResourceArbiter::with_capacity(
            config.arbiter.name.clone(),
            config.arbiter.acquire_timeout(),
            config.arbiter.max_clients,
        );
        let task_queue = Arc::new(TaskQueue::new(
            "frame-coordinator",
            config.task_queue.to_config(),
        ));
        let backend = self
            .policy_backend
            .unwrap_or_else(|| Arc::new(LoggingPolicyBackend::new()));
        let scenario = ScenarioController::new(config.scenario.policy_table(), backend);

        let runtime = NodeRuntime {
            task_queue: Arc::clone(&task_queue),
            allocator: self
                .allocator
                .unwrap_or_else(|| Arc::new(HeapAllocator::new())),
            idle_wait: config.pipeline.node_idle_wait(),
        };
        let (results_tx, results_rx) = unbounded();

        let p2a = self.p2a_stage.unwrap_or_else(p2a_stage);
        let mdp = match self.mdp_stage {
            Some(stage) => stage,
            None => mdp_stage(&config),
        };

        let mut graph = PipelineGraph::new(runtime);
        let root = graph.add_node(ROOT_NODE, RootNode::new());
        let p2a = graph.add_node(P2A_NODE, ArbitratedNode::new(p2a, Arc::clone(&arbiter)));
        let mdp = graph.add_node(MDP_NODE, mdp);
        let output = graph.add_node(OUTPUT_NODE, OutputNode::new(results_tx));
        graph.connect(root, p2a)?;
        graph.connect(p2a, mdp)?;
        graph.connect(mdp, output)?;

        tracing::info!(
            "Coordinator built: {} sensor path(s), {} workers, arbiter '{}'",
            config.sensor_path.sensors.len(),
            config.task_queue.max_workers,
            config.arbiter.name
        );

        Ok(FrameCoordinator {
            config,
            state_machine,
            arbiter,
            task_queue,
            scenario,
            graph,
            root,
            results: results_rx,
            next_request_no: AtomicU64::new(1),
            accepted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stale_discards: AtomicU64::new(0),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }
}

pub struct FrameCoordinator {
    config: CoordinatorConfig,
    state_machine: Arc<SensorPathStateMachine>,
    arbiter: Arc<ResourceArbiter>,
    task_queue: Arc<TaskQueue>,
    scenario: ScenarioController,
    graph: PipelineGraph,
    root: NodeId,
    results: Receiver<FrameResult>,
    next_request_no: AtomicU64,
    accepted: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    stale_discards: AtomicU64,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl FrameCoordinator {
    pub fn builder(config: CoordinatorConfig) -> FrameCoordinatorBuilder {
        FrameCoordinatorBuilder::new(config)
    }

    /// Initialize and start every node, then enter the configured startup
    /// scenario.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::debug!("Coordinator already started");
            return Ok(());
        }
        self.graph.init_all().context("Failed to initialize pipeline")?;
        self.graph.start_all().context("Failed to start pipeline")?;

        if let Some(startup) = self.config.scenario.startup {
            self.scenario
                .enter_scenario(startup)
                .context("Failed to enter startup scenario")?;
        }
        tracing::info!(
            "Coordinator started on {}",
            self.state_machine.current_state()
        );
        Ok(())
    }

    /// Route a captured frame into the graph, or drop it if its sensor path
    /// does not need it.
    pub fn submit_frame(&self, frame: CapturedFrame) -> Result<SubmitOutcome> {
        let (state, needed) = self.state_machine.admit(frame.sensor, frame.will_follow);

        if !needed {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Frame {} from {} skipped ({})",
                frame.frame_number,
                frame.sensor,
                state
            );
            return Ok(SubmitOutcome::Skipped);
        }

        let request_no = self.next_request_no.fetch_add(1, Ordering::Relaxed);
        let request = FrameRequest::from_capture(request_no, frame, state);
        if let Err(e) = self.graph.on_data(self.root, request) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoordinatorError::from(e).with_context(format!("request #{}", request_no)));
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(SubmitOutcome::Enqueued { request_no })
    }

    pub fn switch_sensor(&self, sensor: SensorId) -> SwitchDecision {
        let decision = self.state_machine.switch_to(sensor);
        if let Action::DiscardStaleData { vacated } = decision.action {
            self.stale_discards.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Discarding stale motion data of {}", vacated);
        }
        decision
    }

    pub fn notify_switch_result(&self, source: SensorId, result: SwitchResult) -> Transition {
        self.state_machine.notify_switch_result(source, result)
    }

    pub fn notify_lmv_validity(&self, source: SensorId, is_valid: bool) -> Transition {
        self.state_machine.notify_lmv_validity(source, is_valid)
    }

    pub fn current_state(&self) -> LmvState {
        self.state_machine.current_state()
    }

    pub fn enter_scenario(&self, param: ScenarioParam) -> Result<PolicyDirective> {
        Ok(self.scenario.enter_scenario(param)?)
    }

    pub fn exit_scenario(&self) -> Result<()> {
        Ok(self.scenario.exit_scenario()?)
    }

    /// Receiver of finished frames, in completion order.
    pub fn results(&self) -> Receiver<FrameResult> {
        self.results.clone()
    }

    /// Wait until no request is queued or in flight anywhere in the graph.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.graph.pending() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.task_queue
                .wait_idle((deadline - now).min(Duration::from_millis(10)));
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Exit the active scenario, drain and stop the graph, stop the workers.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Coordinator shutting down");

        let scenario = self.scenario.exit_scenario();
        let graph = self.graph.stop_all(self.config.pipeline.drain_timeout());
        self.task_queue.shutdown();

        let stats = self.stats();
        tracing::info!(
            "Coordinator stopped: {} accepted, {} skipped, {} rejected",
            stats.accepted,
            stats.skipped,
            stats.rejected
        );

        graph.context("Failed to drain pipeline")?;
        scenario.context("Failed to exit scenario")?;
        Ok(())
    }

    /// Started and not yet shut down.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            lmv_state: self.state_machine.current_state().to_string(),
            tasks: self.task_queue.stats(),
        }
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn state_machine(&self) -> &Arc<SensorPathStateMachine> {
        &self.state_machine
    }

    pub fn arbiter(&self) -> &Arc<ResourceArbiter> {
        &self.arbiter
    }

    pub fn task_queue(&self) -> &Arc<TaskQueue> {
        &self.task_queue
    }

    pub fn scenario(&self) -> &ScenarioController {
        &self.scenario
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }
}

impl Drop for FrameCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Coordinator shutdown on drop: {}", e);
        }
    }
}
