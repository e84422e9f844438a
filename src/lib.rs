//! # frame-coordinator: camera frame pipeline coordination
//!
//! Coordinates captured camera frames through a graph of processing nodes.
//! Frames arrive as pooled buffers with metadata; the crate decides which
//! sensor path they belong to, routes them through the graph on a shared
//! worker pool, gates a scarce hardware block between competing nodes and
//! applies bandwidth/power policy per operating scenario.
//!
//! ## Architecture
//!
//! - **TaskQueue**: lazily grown worker pool shared by all processing nodes
//! - **Pipeline**: DAG of nodes with a lifecycle and per-node routing loops
//! - **SensorPath**: state machine choosing the authoritative sensor path
//! - **Arbiter**: bounded client handles plus timed exclusive acquisition
//! - **Scenario**: enter/exit transactions applying policy directives
//! - **Coordinator**: owns one of each and feeds frames into the graph
//!
//! ## Configuration
//!
//! [`CoordinatorConfig`] is read from TOML (or JSON) with per-field
//! defaults. The default location is `frame-coordinator/coordinator.toml`
//! in the platform config directory.
//!
//! ## Example
//!
//! ```ignore
//! use frame_coordinator::{
//!     buffer::{BufferPool, BufferSpec, HeapAllocator, ImageFormat},
//!     capture::{CaptureSource, SyntheticCaptureSource},
//!     CoordinatorConfig, FrameCoordinator, SensorId,
//! };
//! use std::sync::Arc;
//!
//! let coordinator = FrameCoordinator::builder(CoordinatorConfig::default()).build()?;
//! coordinator.start()?;
//!
//! let spec = BufferSpec::new("sensor", ImageFormat::Raw10, 4000, 3000);
//! let pool = BufferPool::new(spec, 8, Arc::new(HeapAllocator::new()))?;
//! let mut source = SyntheticCaptureSource::new(pool, SensorId::Wide, 30).with_limit(100);
//! while let Some(frame) = source.next_frame()? {
//!     coordinator.submit_frame(frame)?;
//! }
//!
//! for result in coordinator.results().try_iter() {
//!     println!("request #{} done in {:?}", result.request_no, result.latency);
//! }
//! coordinator.shutdown()?;
//! ```

pub mod arbiter;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod scenario;
pub mod sensor_path;
pub mod task_queue;

// Re-export commonly used types
pub use arbiter::{ArbiterError, ClientHandle, ResourceArbiter, ResourceLease};
pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorStats, FrameCoordinator, FrameCoordinatorBuilder, SubmitOutcome};
pub use error::{CoordinatorError, Result, ResultExt};
pub use pipeline::{FrameRequest, FrameResult, PipelineGraph};
pub use scenario::{ScenarioController, ScenarioKind, ScenarioParam};
pub use sensor_path::{LmvState, SensorId, SensorPathStateMachine, SwitchResult};
pub use task_queue::{TaskQueue, TaskQueueConfig};
