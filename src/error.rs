//! Error handling for the frame coordinator
//!
//! Each subsystem owns a focused error enum; this module collects them into
//! [`CoordinatorError`] for callers that drive the whole coordinator.

use crate::arbiter::ArbiterError;
use crate::buffer::BufferError;
use crate::pipeline::PipelineError;
use crate::scenario::ScenarioError;
use crate::sensor_path::SensorPathError;
use crate::task_queue::TaskQueueError;
use thiserror::Error;

/// Main error type for coordinator operations
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Errors from the node graph
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors from the worker task queue
    #[error("Task queue error: {0}")]
    TaskQueue(#[from] TaskQueueError),

    /// Errors from the sensor path state machine
    #[error("Sensor path error: {0}")]
    SensorPath(#[from] SensorPathError),

    /// Errors from the hardware resource arbiter
    #[error("Arbiter error: {0}")]
    Arbiter(#[from] ArbiterError),

    /// Errors from scenario policy handling
    #[error("Scenario error: {0}")]
    Scenario(#[from] ScenarioError),

    /// Errors from buffer pools and allocators
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CoordinatorError>,
    },
}

impl CoordinatorError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CoordinatorError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<CoordinatorError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Into::<CoordinatorError>::into(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Into::<CoordinatorError>::into(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoordinatorError::Config("missing section".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing section");
    }

    #[test]
    fn test_error_with_context() {
        let err = CoordinatorError::Config("bad".to_string());
        let with_ctx = err.with_context("Failed to load coordinator.toml");
        assert!(with_ctx.to_string().contains("Failed to load coordinator.toml"));
    }

    #[test]
    fn test_subsystem_conversion() {
        let res: std::result::Result<(), SensorPathError> =
            Err(SensorPathError::UnknownSensor("ultra".to_string()));
        let err = res.context("sensor list").unwrap_err();
        assert!(err.to_string().contains("sensor list"));
        assert!(err.to_string().contains("ultra"));

        let err: CoordinatorError = ArbiterError::UnknownClient(crate::arbiter::ClientHandle(7)).into();
        assert!(matches!(err, CoordinatorError::Arbiter(_)));
    }
}
