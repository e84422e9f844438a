//! Configuration for the frame coordinator.
//!
//! One [`CoordinatorConfig`] file with a section per subsystem. Every field
//! has a default, so a partial file (or none at all) is valid. Durations are
//! stored in milliseconds.
//!
//! # Location
//!
//! [`CoordinatorConfig::default_path`] resolves to the platform config
//! directory:
//! - **Linux**: `~/.config/frame-coordinator/coordinator.toml`
//! - **macOS**: `~/Library/Application Support/frame-coordinator/coordinator.toml`
//! - **Windows**: `%APPDATA%\frame-coordinator\coordinator.toml`
//!
//! Files ending in `.json` are read and written as JSON, everything else as
//! TOML.
//!
//! # Example
//!
//! ```toml
//! [task_queue]
//! max_workers = 4
//!
//! [sensor_path]
//! sensors = ["wide", "tele"]
//! initial = "wide"
//!
//! [scenario.startup]
//! kind = "normal_preview"
//! sensor_width = 4000
//! sensor_height = 3000
//! fps = 30
//! ```

use crate::arbiter::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_MAX_CLIENTS};
use crate::buffer::{BufferSpec, ImageFormat};
use crate::error::{CoordinatorError, Result};
use crate::pipeline::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_NODE_IDLE_WAIT};
use crate::scenario::{PolicyDirective, PolicyTable, ScenarioParam};
use crate::sensor_path::{SensorId, DEFAULT_DRAIN_CREDITS};
use crate::task_queue::{
    TaskQueueConfig, DEFAULT_IDLE_WAIT, DEFAULT_MAX_PENDING, DEFAULT_MAX_WORKERS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config dir
pub const APP_ID: &str = "frame-coordinator";

/// Config filename
pub const CONFIG_FILE: &str = "coordinator.toml";

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueSettings {
    pub max_workers: usize,
    pub idle_wait_ms: u64,
    /// Queued task bound; 0 disables the bound.
    pub max_pending: usize,
}

impl Default for TaskQueueSettings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            idle_wait_ms: millis(DEFAULT_IDLE_WAIT),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl TaskQueueSettings {
    pub fn to_config(&self) -> TaskQueueConfig {
        TaskQueueConfig {
            max_workers: self.max_workers,
            idle_wait: Duration::from_millis(self.idle_wait_ms),
            max_pending: (self.max_pending > 0).then_some(self.max_pending),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterSettings {
    /// Diagnostic name of the arbitrated hardware block
    pub name: String,
    pub max_clients: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        Self {
            name: "p2a".to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            acquire_timeout_ms: millis(DEFAULT_ACQUIRE_TIMEOUT),
        }
    }
}

impl ArbiterSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorPathSettings {
    /// Physical sensor paths present; one path selects the dummy machine.
    pub sensors: Vec<SensorId>,
    pub initial: SensorId,
    pub drain_credits: u32,
}

impl Default for SensorPathSettings {
    fn default() -> Self {
        Self {
            sensors: SensorId::ALL.to_vec(),
            initial: SensorId::Wide,
            drain_credits: DEFAULT_DRAIN_CREDITS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub node_idle_wait_ms: u64,
    pub drain_timeout_ms: u64,
    pub output_format: ImageFormat,
    pub output_width: u32,
    pub output_height: u32,
    /// Output buffers allocated by the in-out stage
    pub output_buffers: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            node_idle_wait_ms: millis(DEFAULT_NODE_IDLE_WAIT),
            drain_timeout_ms: millis(DEFAULT_DRAIN_TIMEOUT),
            output_format: ImageFormat::Yuv420,
            output_width: 1920,
            output_height: 1080,
            output_buffers: 4,
        }
    }
}

impl PipelineSettings {
    pub fn node_idle_wait(&self) -> Duration {
        Duration::from_millis(self.node_idle_wait_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn output_spec(&self, name: &str) -> BufferSpec {
        BufferSpec::new(name, self.output_format, self.output_width, self.output_height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScenarioSettings {
    /// Policy in force outside any scenario
    pub baseline: PolicyDirective,
    /// Scenario entered when the coordinator starts
    pub startup: Option<ScenarioParam>,
}

impl ScenarioSettings {
    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable::new(self.baseline)
    }
}

/// Complete coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub task_queue: TaskQueueSettings,
    pub arbiter: ArbiterSettings,
    pub sensor_path: SensorPathSettings,
    pub pipeline: PipelineSettings,
    pub scenario: ScenarioSettings,
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

impl CoordinatorConfig {
    /// Platform default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CoordinatorError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CoordinatorError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content).map_err(|e| {
                CoordinatorError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                CoordinatorError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        };

        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Load a config file, falling back to defaults on any error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoordinatorError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_json(path) {
            serde_json::to_string_pretty(self)
                .map_err(|e| CoordinatorError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            self.to_toml_string()?
        };

        std::fs::write(path, content).map_err(|e| {
            CoordinatorError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CoordinatorError::Config(msg));

        if self.task_queue.max_workers == 0 {
            return invalid("task_queue.max_workers must be at least 1".into());
        }
        if self.arbiter.max_clients == 0 {
            return invalid("arbiter.max_clients must be at least 1".into());
        }
        if self.arbiter.acquire_timeout_ms == 0 {
            return invalid("arbiter.acquire_timeout_ms must be positive".into());
        }

        let sensors = &self.sensor_path.sensors;
        if sensors.is_empty() {
            return invalid("sensor_path.sensors is empty".into());
        }
        if !sensors.contains(&self.sensor_path.initial) {
            return invalid(format!(
                "sensor_path.initial {} is not one of {:?}",
                self.sensor_path.initial, sensors
            ));
        }

        if self.pipeline.output_width == 0 || self.pipeline.output_height == 0 {
            return invalid("pipeline output size must be non-zero".into());
        }
        if self.pipeline.output_buffers == 0 {
            return invalid("pipeline.output_buffers must be at least 1".into());
        }

        if let Some(startup) = &self.scenario.startup {
            startup
                .validate()
                .map_err(|e| CoordinatorError::Config(format!("scenario.startup: {}", e)))?;
        }
        Ok(())
    }
}
