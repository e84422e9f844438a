//! Scenario control.
//!
//! A scenario is a coarse operating mode (preview, recording, capture...)
//! that determines the bandwidth ceiling and power hint of the platform.
//! [`ScenarioController`] applies the matching [`PolicyDirective`] when a
//! scenario is entered and restores the baseline when it is exited.

mod policy;

pub use policy::{
    LoggingPolicyBackend, PolicyBackend, PolicyDirective, PolicyTable, PowerHint, REFERENCE_AREA,
    REFERENCE_FPS,
};

#[cfg(test)]
pub use policy::MockPolicyBackend;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Highest frame rate accepted by [`ScenarioParam::validate`].
pub const MAX_FPS: u32 = 240;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    #[error("Invalid scenario parameter: {0}")]
    InvalidParam(String),

    #[error("Policy backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    NormalPreview,
    ZsdPreview,
    VideoRecord,
    /// Video snapshot: still capture during recording.
    Vss,
    Capture,
    ContinuousShot,
    StreamingWithJpeg,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 7] = [
        ScenarioKind::NormalPreview,
        ScenarioKind::ZsdPreview,
        ScenarioKind::VideoRecord,
        ScenarioKind::Vss,
        ScenarioKind::Capture,
        ScenarioKind::ContinuousShot,
        ScenarioKind::StreamingWithJpeg,
    ];
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioKind::NormalPreview => "normal-preview",
            ScenarioKind::ZsdPreview => "zsd-preview",
            ScenarioKind::VideoRecord => "video-record",
            ScenarioKind::Vss => "vss",
            ScenarioKind::Capture => "capture",
            ScenarioKind::ContinuousShot => "continuous-shot",
            ScenarioKind::StreamingWithJpeg => "streaming-with-jpeg",
        };
        f.write_str(name)
    }
}

/// Feature bits that influence the chosen policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(pub u32);

impl FeatureFlags {
    pub const NONE: FeatureFlags = FeatureFlags(0);
    pub const ADV_EIS: FeatureFlags = FeatureFlags(1 << 0);
    pub const IVHDR: FeatureFlags = FeatureFlags(1 << 1);
    pub const MVHDR: FeatureFlags = FeatureFlags(1 << 2);
    pub const ZVHDR: FeatureFlags = FeatureFlags(1 << 3);
    pub const VFB: FeatureFlags = FeatureFlags(1 << 4);
    pub const DUAL_PD: FeatureFlags = FeatureFlags(1 << 5);

    const NAMES: [(FeatureFlags, &'static str); 6] = [
        (Self::ADV_EIS, "ADV_EIS"),
        (Self::IVHDR, "IVHDR"),
        (Self::MVHDR, "MVHDR"),
        (Self::ZVHDR, "ZVHDR"),
        (Self::VFB, "VFB"),
        (Self::DUAL_PD, "DUAL_PD"),
    ];

    #[inline]
    pub fn contains(self, other: FeatureFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: FeatureFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FeatureFlags {
    type Output = FeatureFlags;

    fn bitor(self, rhs: FeatureFlags) -> FeatureFlags {
        FeatureFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FeatureFlags {
    fn bitor_assign(&mut self, rhs: FeatureFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for FeatureFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Everything the controller needs to know about a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScenarioParam {
    pub kind: ScenarioKind,
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub fps: u32,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub bandwidth_control: bool,
}

impl ScenarioParam {
    pub fn new(kind: ScenarioKind, sensor_width: u32, sensor_height: u32, fps: u32) -> Self {
        Self {
            kind,
            sensor_width,
            sensor_height,
            fps,
            features: FeatureFlags::NONE,
            bandwidth_control: false,
        }
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn with_bandwidth_control(mut self, enabled: bool) -> Self {
        self.bandwidth_control = enabled;
        self
    }

    pub fn sensor_area(&self) -> u64 {
        u64::from(self.sensor_width) * u64::from(self.sensor_height)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.sensor_width == 0 || self.sensor_height == 0 {
            return Err(ScenarioError::InvalidParam(format!(
                "{}: sensor size {}x{} is empty",
                self.kind, self.sensor_width, self.sensor_height
            )));
        }
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(ScenarioError::InvalidParam(format!(
                "{}: fps {} outside 1..={}",
                self.kind, self.fps, MAX_FPS
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ScenarioParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{}@{} [{}]{}",
            self.kind,
            self.sensor_width,
            self.sensor_height,
            self.fps,
            self.features,
            if self.bandwidth_control { " bwc" } else { "" }
        )
    }
}

/// Applies scenario policy through a [`PolicyBackend`].
///
/// Enter and exit are serialized; the active scenario only changes after the
/// backend accepted the new directive. Dropping the controller exits the
/// active scenario.
pub struct ScenarioController {
    table: PolicyTable,
    backend: Arc<dyn PolicyBackend>,
    active: Mutex<Option<(ScenarioParam, PolicyDirective)>>,
}

impl ScenarioController {
    pub fn new(table: PolicyTable, backend: Arc<dyn PolicyBackend>) -> Self {
        Self {
            table,
            backend,
            active: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &PolicyTable {
        &self.table
    }

    fn lock(&self) -> MutexGuard<'_, Option<(ScenarioParam, PolicyDirective)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> Option<ScenarioParam> {
        (*self.lock()).map(|(param, _)| param)
    }

    /// Directive currently in force: the active scenario's, or the baseline.
    pub fn current_directive(&self) -> PolicyDirective {
        (*self.lock())
            .map(|(_, directive)| directive)
            .unwrap_or_else(|| self.table.baseline())
    }

    pub fn enter_scenario(&self, param: ScenarioParam) -> Result<PolicyDirective, ScenarioError> {
        param.validate()?;

        let mut active = self.lock();
        if let Some((current, directive)) = *active {
            if current == param {
                tracing::debug!("Scenario {} already active", param);
                return Ok(directive);
            }
        }

        let directive = self.table.directive_for(&param);
        if let Err(e) = self.backend.apply(&directive) {
            tracing::warn!("Failed to enter scenario {}: {}", param, e);
            return Err(e);
        }

        match active.replace((param, directive)) {
            Some((previous, _)) => {
                tracing::info!("Scenario {} -> {} ({})", previous, param, directive)
            }
            None => tracing::info!("Entered scenario {} ({})", param, directive),
        }
        Ok(directive)
    }

    pub fn exit_scenario(&self) -> Result<(), ScenarioError> {
        let mut active = self.lock();
        let Some((param, _)) = *active else {
            tracing::debug!("No scenario to exit");
            return Ok(());
        };

        let baseline = self.table.baseline();
        if let Err(e) = self.backend.apply(&baseline) {
            tracing::warn!("Failed to exit scenario {}: {}", param, e);
            return Err(e);
        }
        *active = None;
        tracing::info!("Exited scenario {} ({})", param, baseline);
        Ok(())
    }
}

impl Drop for ScenarioController {
    fn drop(&mut self) {
        if let Err(e) = self.exit_scenario() {
            tracing::error!("Scenario exit on drop failed: {}", e);
        }
    }
}
