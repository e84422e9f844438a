//! Bandwidth and power policy lookup.

use super::{FeatureFlags, ScenarioError, ScenarioKind, ScenarioParam};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Reference frame rate for bandwidth scaling.
pub const REFERENCE_FPS: u32 = 30;

/// Reference sensor area (12 MP) for bandwidth scaling.
pub const REFERENCE_AREA: u64 = 4000 * 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerHint {
    #[default]
    Default,
    LowPower,
    Balanced,
    Performance,
}

/// Settings handed to the platform policy backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDirective {
    pub bandwidth_mbps: u32,
    pub power_hint: PowerHint,
}

impl Default for PolicyDirective {
    fn default() -> Self {
        Self {
            bandwidth_mbps: 1600,
            power_hint: PowerHint::Default,
        }
    }
}

impl fmt::Display for PolicyDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MB/s, {:?}", self.bandwidth_mbps, self.power_hint)
    }
}

/// Maps scenarios to directives relative to a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyTable {
    baseline: PolicyDirective,
}

impl PolicyTable {
    pub fn new(baseline: PolicyDirective) -> Self {
        Self { baseline }
    }

    pub fn baseline(&self) -> PolicyDirective {
        self.baseline
    }

    /// Bandwidth multiplier of a scenario, in percent of the baseline.
    fn bandwidth_percent(kind: ScenarioKind) -> u64 {
        match kind {
            ScenarioKind::NormalPreview => 100,
            ScenarioKind::ZsdPreview => 125,
            ScenarioKind::VideoRecord => 150,
            ScenarioKind::Vss => 175,
            ScenarioKind::Capture => 150,
            ScenarioKind::ContinuousShot => 200,
            ScenarioKind::StreamingWithJpeg => 125,
        }
    }

    fn power_hint(param: &ScenarioParam) -> PowerHint {
        let heavy =
            FeatureFlags::ADV_EIS | FeatureFlags::IVHDR | FeatureFlags::MVHDR | FeatureFlags::ZVHDR;
        if param.features.intersects(heavy) {
            return PowerHint::Performance;
        }
        match param.kind {
            ScenarioKind::NormalPreview | ScenarioKind::StreamingWithJpeg => PowerHint::Balanced,
            ScenarioKind::ZsdPreview => PowerHint::Balanced,
            ScenarioKind::VideoRecord
            | ScenarioKind::Vss
            | ScenarioKind::Capture
            | ScenarioKind::ContinuousShot => PowerHint::Performance,
        }
    }

    pub fn directive_for(&self, param: &ScenarioParam) -> PolicyDirective {
        let power_hint = Self::power_hint(param);
        if !param.bandwidth_control {
            return PolicyDirective {
                bandwidth_mbps: self.baseline.bandwidth_mbps,
                power_hint,
            };
        }

        let base = u128::from(self.baseline.bandwidth_mbps)
            * u128::from(Self::bandwidth_percent(param.kind));
        let scaled = base * u128::from(param.fps) * u128::from(param.sensor_area())
            / (100 * u128::from(REFERENCE_FPS) * u128::from(REFERENCE_AREA));

        PolicyDirective {
            bandwidth_mbps: u32::try_from(scaled.max(1)).unwrap_or(u32::MAX),
            power_hint,
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(PolicyDirective::default())
    }
}

/// Platform side that actually programs bandwidth and power settings.
#[cfg_attr(test, mockall::automock)]
pub trait PolicyBackend: Send + Sync {
    fn apply(&self, directive: &PolicyDirective) -> Result<(), ScenarioError>;
}

/// Backend that only logs directives and remembers the last one.
#[derive(Debug, Default)]
pub struct LoggingPolicyBackend {
    applied: Mutex<Vec<PolicyDirective>>,
}

impl LoggingPolicyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<PolicyDirective> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .copied()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl PolicyBackend for LoggingPolicyBackend {
    fn apply(&self, directive: &PolicyDirective) -> Result<(), ScenarioError> {
        tracing::info!("Policy: {}", directive);
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*directive);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(kind: ScenarioKind, fps: u32, bwc: bool) -> ScenarioParam {
        ScenarioParam::new(kind, 4000, 3000, fps).with_bandwidth_control(bwc)
    }

    #[test]
    fn test_reference_preview_keeps_baseline_bandwidth() {
        let table = PolicyTable::default();
        let d = table.directive_for(&param(ScenarioKind::NormalPreview, 30, true));
        assert_eq!(d.bandwidth_mbps, 1600);
        assert_eq!(d.power_hint, PowerHint::Balanced);
    }

    #[test]
    fn test_bandwidth_scales_with_fps_and_area() {
        let table = PolicyTable::default();
        let d = table.directive_for(&param(ScenarioKind::VideoRecord, 60, true));
        assert_eq!(d.bandwidth_mbps, 1600 * 3 / 2 * 2);

        let small = ScenarioParam::new(ScenarioKind::NormalPreview, 2000, 1500, 30)
            .with_bandwidth_control(true);
        assert_eq!(table.directive_for(&small).bandwidth_mbps, 400);
    }

    #[test]
    fn test_without_bandwidth_control_only_hint_changes() {
        let table = PolicyTable::default();
        let d = table.directive_for(&param(ScenarioKind::ContinuousShot, 120, false));
        assert_eq!(d.bandwidth_mbps, table.baseline().bandwidth_mbps);
        assert_eq!(d.power_hint, PowerHint::Performance);
    }

    #[test]
    fn test_heavy_features_force_performance() {
        let table = PolicyTable::default();
        let p = param(ScenarioKind::NormalPreview, 30, false).with_features(FeatureFlags::ADV_EIS);
        assert_eq!(table.directive_for(&p).power_hint, PowerHint::Performance);
        let p = param(ScenarioKind::NormalPreview, 30, false).with_features(FeatureFlags::VFB);
        assert_eq!(table.directive_for(&p).power_hint, PowerHint::Balanced);
    }

    #[test]
    fn test_logging_backend_records() {
        let backend = LoggingPolicyBackend::new();
        assert_eq!(backend.last(), None);
        backend.apply(&PolicyDirective::default()).unwrap();
        assert_eq!(backend.last(), Some(PolicyDirective::default()));
        assert_eq!(backend.applied_count(), 1);
    }
}
