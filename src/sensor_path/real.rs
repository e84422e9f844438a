//! Two-path state machine with drain credits.

use super::{
    Action, LmvState, SensorId, SwitchDecision, SwitchResult, Transition, SENSOR_COUNT,
};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Inner {
    current: LmvState,
    /// Sensor vacated by a switch that hardware has not confirmed yet.
    pending_from: Option<SensorId>,
    /// Extra frames each inactive sensor may still push downstream.
    credits: [u32; SENSOR_COUNT],
    lmv_valid: [bool; SENSOR_COUNT],
    switch_count: u64,
}

/// State machine for configurations with two physical sensor paths.
pub struct RealStateMachine {
    inner: Mutex<Inner>,
    drain_credits: u32,
}

impl RealStateMachine {
    pub fn new(initial: SensorId, drain_credits: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: LmvState::steady(initial),
                pending_from: None,
                credits: [0; SENSOR_COUNT],
                lmv_valid: [true; SENSOR_COUNT],
                switch_count: 0,
            }),
            drain_credits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn switch_to(&self, sensor: SensorId) -> SwitchDecision {
        let mut inner = self.lock();
        let old_state = inner.current;

        if sensor == old_state.sensor {
            return SwitchDecision {
                transition: Transition::unchanged(old_state),
                action: Action::DoNothing,
            };
        }

        let new_state = LmvState {
            sensor,
            switching: true,
        };
        let vacated = old_state.sensor;
        inner.current = new_state;
        inner.pending_from = Some(vacated);
        inner.credits[vacated.index()] = self.drain_credits;
        inner.credits[sensor.index()] = 0;
        inner.switch_count += 1;

        tracing::info!(
            "LMV switch #{}: {} -> {} (discard stale data of {})",
            inner.switch_count,
            old_state,
            new_state,
            vacated
        );

        SwitchDecision {
            transition: Transition {
                old_state,
                new_state,
            },
            action: Action::DiscardStaleData { vacated },
        }
    }

    pub fn notify_switch_result(&self, source: SensorId, result: SwitchResult) -> Transition {
        let mut inner = self.lock();
        let old_state = inner.current;

        let Some(vacated) = inner.pending_from else {
            tracing::warn!(
                "LMV switch result {:?} from {} but no switch is pending (state {})",
                result,
                source,
                old_state
            );
            return Transition::unchanged(old_state);
        };

        if source != old_state.sensor {
            tracing::warn!(
                "LMV switch result {:?} from {} does not match pending target {}",
                result,
                source,
                old_state.sensor
            );
            return Transition::unchanged(old_state);
        }

        match result {
            SwitchResult::Accept => {
                inner.current.switching = false;
                inner.pending_from = None;
                tracing::debug!("LMV switch to {} accepted", source);
            }
            SwitchResult::Reject => {
                inner.current = LmvState::steady(vacated);
                inner.pending_from = None;
                inner.credits[vacated.index()] = 0;
                tracing::warn!("LMV switch to {} rejected, back on {}", source, vacated);
            }
            SwitchResult::Ignore => {
                tracing::debug!("LMV switch to {} ignored by hardware, still pending", source);
            }
        }

        Transition {
            old_state,
            new_state: inner.current,
        }
    }

    pub fn notify_lmv_validity(&self, source: SensorId, is_valid: bool) -> Transition {
        let mut inner = self.lock();
        let previous = inner.lmv_valid[source.index()];
        inner.lmv_valid[source.index()] = is_valid;
        if !is_valid {
            tracing::warn!("LMV data of {} reported invalid (state {})", source, inner.current);
        } else if !previous {
            tracing::debug!("LMV data of {} valid again", source);
        }
        Transition::unchanged(inner.current)
    }

    /// True for the active sensor. An inactive sensor may still enqueue while
    /// it holds drain credits; the last frame of a group (`will_follow ==
    /// false`) consumes one.
    pub fn need_enque(&self, sensor: SensorId, will_follow: bool) -> bool {
        self.admit(sensor, will_follow).1
    }

    /// `need_enque` together with the state it was decided against, under
    /// one lock so a concurrent switch cannot split the two.
    pub fn admit(&self, sensor: SensorId, will_follow: bool) -> (LmvState, bool) {
        let mut inner = self.lock();
        let current = inner.current;
        if sensor == current.sensor {
            return (current, true);
        }
        let credits = &mut inner.credits[sensor.index()];
        if *credits == 0 {
            return (current, false);
        }
        if !will_follow {
            *credits -= 1;
        }
        (current, true)
    }

    pub fn current_state(&self) -> LmvState {
        self.lock().current
    }

    pub fn is_lmv_valid(&self, sensor: SensorId) -> bool {
        self.lock().lmv_valid[sensor.index()]
    }

    pub fn drain_credits(&self, sensor: SensorId) -> u32 {
        self.lock().credits[sensor.index()]
    }

    pub fn switch_count(&self) -> u64 {
        self.lock().switch_count
    }
}
