//! Mock construction helpers

use frame_coordinator::scenario::{PolicyBackend, PolicyDirective, ScenarioError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Policy backend that records every directive and can be told to fail.
#[derive(Default)]
pub struct RecordingPolicyBackend {
    applied: Mutex<Vec<PolicyDirective>>,
    fail: AtomicBool,
}

impl RecordingPolicyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<PolicyDirective> {
        self.applied.lock().unwrap().clone()
    }
}

impl PolicyBackend for RecordingPolicyBackend {
    fn apply(&self, directive: &PolicyDirective) -> Result<(), ScenarioError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ScenarioError::Backend("injected failure".into()));
        }
        self.applied.lock().unwrap().push(*directive);
        Ok(())
    }
}
