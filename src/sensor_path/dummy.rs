//! Single-path state machine.

use super::{Action, LmvState, SensorId, SwitchDecision, SwitchResult, Transition};
use std::sync::{Mutex, PoisonError};

/// Stand-in for configurations with one physical sensor path. The state is
/// fixed; only LMV validity is tracked.
pub struct DummyStateMachine {
    state: LmvState,
    lmv_valid: Mutex<bool>,
}

impl DummyStateMachine {
    pub fn new(sensor: SensorId) -> Self {
        Self {
            state: LmvState::steady(sensor),
            lmv_valid: Mutex::new(true),
        }
    }

    pub fn switch_to(&self, sensor: SensorId) -> SwitchDecision {
        if sensor != self.state.sensor {
            tracing::warn!(
                "Single-path configuration on {} cannot switch to {}",
                self.state.sensor,
                sensor
            );
        }
        SwitchDecision {
            transition: Transition::unchanged(self.state),
            action: Action::DoNothing,
        }
    }

    pub fn notify_switch_result(&self, source: SensorId, result: SwitchResult) -> Transition {
        tracing::error!(
            "Switch result {:?} from {} in single-path configuration ({})",
            result,
            source,
            self.state
        );
        Transition::unchanged(self.state)
    }

    pub fn notify_lmv_validity(&self, source: SensorId, is_valid: bool) -> Transition {
        if source == self.state.sensor {
            *self.lmv_valid.lock().unwrap_or_else(PoisonError::into_inner) = is_valid;
        }
        if !is_valid {
            tracing::warn!("LMV data of {} reported invalid", source);
        }
        Transition::unchanged(self.state)
    }

    pub fn need_enque(&self, _sensor: SensorId, _will_follow: bool) -> bool {
        false
    }

    /// The only path is always admitted; anything else never is.
    pub fn admit(&self, sensor: SensorId, _will_follow: bool) -> (LmvState, bool) {
        (self.state, sensor == self.state.sensor)
    }

    pub fn current_state(&self) -> LmvState {
        self.state
    }

    pub fn is_lmv_valid(&self, sensor: SensorId) -> bool {
        sensor == self.state.sensor
            && *self.lmv_valid.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
