//! Convergence thresholds and the measurement state machine.

use crate::error::{ColorError, ColorResult};
use serde::{Deserialize, Serialize};

/// Convergence thresholds for the stabilization engine.
///
/// Defaults come from one device family; drivers override them through
/// `InstrumentDriver::stabilization` and configuration can override both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    /// Samples taken before giving up on convergence.
    pub max_samples: u32,
    /// Relative band for the monotonic rule (0.005 = 0.5%).
    pub monotonic_band: f64,
    /// Relative band for the grow-then-shrink rule.
    pub alternation_band: f64,
    /// Relative band within which two consecutive samples count as repeats.
    pub repeat_band: f64,
    /// Absolute difference always accepted, for readings near black.
    pub near_black_floor: f64,
    /// Return the last value flagged degraded instead of `Unstable`.
    pub accept_degraded: bool,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            max_samples: 10,
            monotonic_band: 0.005,
            alternation_band: 0.02,
            repeat_band: 0.002,
            near_black_floor: 0.0001,
            accept_degraded: false,
        }
    }
}

impl StabilizationConfig {
    /// Reject thresholds that cannot converge or would accept anything.
    pub fn validate(&self) -> ColorResult<()> {
        if self.max_samples == 0 {
            return Err(ColorError::Configuration(
                "stabilization.max_samples must be at least 1".into(),
            ));
        }
        for (name, band) in [
            ("monotonic_band", self.monotonic_band),
            ("alternation_band", self.alternation_band),
            ("repeat_band", self.repeat_band),
        ] {
            if !(0.0..1.0).contains(&band) {
                return Err(ColorError::Configuration(format!(
                    "stabilization.{name} must be in [0, 1), got {band}"
                )));
            }
        }
        if self.near_black_floor < 0.0 {
            return Err(ColorError::Configuration(
                "stabilization.near_black_floor must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Phase of a single measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasurementState {
    /// No measurement in progress.
    #[default]
    Idle,
    /// Parameters set, about to trigger.
    Armed,
    /// Trigger issued.
    Triggered,
    /// Waiting for the result.
    Measuring,
}

impl MeasurementState {
    /// The only state this one may advance to.
    pub fn successor(self) -> MeasurementState {
        match self {
            MeasurementState::Idle => MeasurementState::Armed,
            MeasurementState::Armed => MeasurementState::Triggered,
            MeasurementState::Triggered => MeasurementState::Measuring,
            MeasurementState::Measuring => MeasurementState::Idle,
        }
    }
}

/// Enforces forward-only progress through [`MeasurementState`].
#[derive(Debug, Clone, Default)]
pub struct MeasurementCycle {
    state: MeasurementState,
    completed: u64,
}

impl MeasurementCycle {
    /// Current state.
    pub fn state(&self) -> MeasurementState {
        self.state
    }

    /// Number of full idle-to-idle cycles.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Move to `next`, which must be the successor of the current state.
    pub fn advance(&mut self, next: MeasurementState) -> ColorResult<()> {
        if next != self.state.successor() {
            return Err(ColorError::Internal(format!(
                "measurement state cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        if next == MeasurementState::Idle {
            self.completed += 1;
        }
        self.state = next;
        Ok(())
    }

    /// Return to idle after an error or abort.
    pub fn reset(&mut self) {
        self.state = MeasurementState::Idle;
    }
}
