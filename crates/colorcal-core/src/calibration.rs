//! Calibration types, requirements and calibration state.
//!
//! Calibration types are split into non-deferrable ones, which must complete
//! before any reading in the current mode, and deferrable ones, which can be
//! performed lazily at measurement time.

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Bitmask of calibration types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CalibrationType: u32 {
        /// Reflective white reference (tile).
        const WHITE_REFERENCE = 1 << 0;
        /// Dark / black level offsets.
        const DARK = 1 << 1;
        /// Wavelength registration.
        const WAVELENGTH = 1 << 2;
        /// Gloss reference.
        const GLOSS = 1 << 3;
        /// Integration time selection for the current light level.
        const INTEGRATION_TIME = 1 << 4;
        /// Display refresh rate measurement.
        const DISPLAY_REFRESH = 1 << 5;
    }
}

impl CalibrationType {
    /// Types that block every reading until done.
    pub const NON_DEFERRABLE: CalibrationType = CalibrationType::WHITE_REFERENCE
        .union(CalibrationType::DARK)
        .union(CalibrationType::WAVELENGTH)
        .union(CalibrationType::GLOSS);

    /// Types that may run lazily at measurement time.
    pub const DEFERRABLE: CalibrationType =
        CalibrationType::INTEGRATION_TIME.union(CalibrationType::DISPLAY_REFRESH);

    /// The non-deferrable subset.
    pub fn non_deferrable(self) -> CalibrationType {
        self & Self::NON_DEFERRABLE
    }

    /// The deferrable subset.
    pub fn deferrable(self) -> CalibrationType {
        self & Self::DEFERRABLE
    }

    /// Lowest set bit, used to pick the next step to describe.
    pub fn first(self) -> Option<CalibrationType> {
        self.iter().next()
    }

    /// Name of a single-bit value.
    pub fn label(self) -> &'static str {
        const LABELS: [(CalibrationType, &str); 6] = [
            (CalibrationType::WHITE_REFERENCE, "white reference"),
            (CalibrationType::DARK, "dark"),
            (CalibrationType::WAVELENGTH, "wavelength"),
            (CalibrationType::GLOSS, "gloss"),
            (CalibrationType::INTEGRATION_TIME, "integration time"),
            (CalibrationType::DISPLAY_REFRESH, "display refresh"),
        ];
        LABELS
            .iter()
            .find(|(bit, _)| *bit == self)
            .map(|(_, label)| *label)
            .unwrap_or("combined")
    }
}

/// What a caller asks `calibrate` to do, before expansion to concrete bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationRequest {
    /// Everything the current mode supports, whether needed or not.
    All,
    /// Only what the current mode still needs and can run ahead of reading.
    Needed,
    /// Alias for `All` restricted to what is available right now.
    Available,
    /// An explicit set of types.
    Types(CalibrationType),
}

impl CalibrationRequest {
    /// Expand to concrete bits for the current mode.
    ///
    /// Explicit types are clipped to what is available. `Needed` leaves the
    /// deferrable types to the next reading, which runs them with the sensor
    /// placed on the target.
    pub fn expand(self, needed: CalibrationType, available: CalibrationType) -> CalibrationType {
        match self {
            CalibrationRequest::All | CalibrationRequest::Available => available,
            CalibrationRequest::Needed => needed.non_deferrable() & available,
            CalibrationRequest::Types(types) => types & available,
        }
    }
}

/// What the human or host environment must arrange before a step can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationCondition {
    /// No physical action; the driver can proceed.
    None,
    /// Block all light from the sensor (cap on, face down).
    CoverSensor,
    /// Place the sensor on its white reference tile.
    PlaceOnWhiteReference,
    /// Place the sensor on the gloss reference.
    PlaceOnGlossReference,
    /// Place the sensor on the wavelength reference.
    PlaceOnWavelengthReference,
    /// Place the sensor on the display, facing a white patch.
    PlaceOnDisplay,
}

impl CalibrationCondition {
    /// Prompt text for a host UI.
    pub fn prompt(self) -> &'static str {
        match self {
            CalibrationCondition::None => "no action required",
            CalibrationCondition::CoverSensor => "cover the sensor so no light reaches it",
            CalibrationCondition::PlaceOnWhiteReference => {
                "place the sensor on the white reference tile"
            }
            CalibrationCondition::PlaceOnGlossReference => "place the sensor on the gloss reference",
            CalibrationCondition::PlaceOnWavelengthReference => {
                "place the sensor on the wavelength reference"
            }
            CalibrationCondition::PlaceOnDisplay => "place the sensor on the display",
        }
    }
}

/// A request emitted by a driver during negotiation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationRequirement {
    /// Calibration types this step will complete.
    pub kind: CalibrationType,
    /// Physical condition the host must arrange.
    pub condition: CalibrationCondition,
    /// Whether the host may skip this step.
    pub optional: bool,
    /// Human-readable identifier, e.g. the white tile serial number.
    pub identifier: Option<String>,
}

impl CalibrationRequirement {
    /// Non-optional requirement without an identifier.
    pub fn new(kind: CalibrationType, condition: CalibrationCondition) -> Self {
        Self {
            kind,
            condition,
            optional: false,
            identifier: None,
        }
    }

    /// Mark the requirement as skippable.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Attach an identifier.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }
}

impl fmt::Display for CalibrationRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} calibration: {}", self.kind.label(), self.condition.prompt())?;
        if let Some(id) = &self.identifier {
            write!(f, " ({id})")?;
        }
        if self.optional {
            f.write_str(" [optional]")?;
        }
        Ok(())
    }
}

/// Calibration types a driver offers and requires in one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationPolicy {
    /// Types that can be performed in this mode.
    pub available: CalibrationType,
    /// Types that must be valid before readings in this mode.
    pub required: CalibrationType,
}

/// Result of one `calibrate` round.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStep {
    /// Some outstanding types were completed.
    Completed {
        /// Types cleared by this round.
        cleared: CalibrationType,
        /// Data produced by the step.
        update: CalibrationUpdate,
    },
    /// The host must arrange a condition before the driver can continue.
    NeedsSetup(CalibrationRequirement),
}

/// Data produced by a calibration step, merged into [`CalibrationData`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationUpdate {
    /// New black level points.
    pub black: Option<BlackLevel>,
    /// Raw white reference counts.
    pub white: Option<WhiteReference>,
    /// Device temperature at calibration time.
    pub temperature: Option<f64>,
    /// Selected integration time in seconds.
    pub integration_time: Option<f64>,
    /// Measured display refresh rate in Hz.
    pub refresh_hz: Option<f64>,
}

/// Host response to a surfaced requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostResponse {
    /// The condition has been arranged.
    Confirmed,
    /// Skip this step (honoured only for optional requirements).
    Skip,
    /// Abort calibration.
    Abort,
}

/// Host environment that can satisfy calibration conditions.
#[async_trait]
pub trait CalibrationHost: Send + Sync {
    /// Ask the human or host to arrange `requirement.condition`.
    async fn request_setup(&self, requirement: &CalibrationRequirement) -> HostResponse;
}

/// One black level measurement at a given integration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackPoint {
    /// Integration time in seconds.
    pub integration_time: f64,
    /// Dark counts per channel.
    pub offsets: Vec<f64>,
}

/// Black level offsets, possibly measured at two integration times.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlackLevel {
    points: Vec<BlackPoint>,
}

impl BlackLevel {
    /// Single point, used by fixed-integration devices.
    pub fn single(integration_time: f64, offsets: Vec<f64>) -> Self {
        Self {
            points: vec![BlackPoint {
                integration_time,
                offsets,
            }],
        }
    }

    /// Two points for devices whose integration time varies continuously.
    pub fn pair(short: BlackPoint, long: BlackPoint) -> Self {
        let mut points = vec![short, long];
        points.sort_by(|a, b| a.integration_time.total_cmp(&b.integration_time));
        Self { points }
    }

    /// Stored points, shortest integration time first.
    pub fn points(&self) -> &[BlackPoint] {
        &self.points
    }

    /// Offsets at `integration_time`.
    ///
    /// With two points the offsets are linearly interpolated (and extrapolated
    /// along the same line outside the measured span). Returns `None` when no
    /// point is stored or channel counts disagree.
    pub fn offsets_at(&self, integration_time: f64) -> Option<Vec<f64>> {
        match self.points.as_slice() {
            [] => None,
            [only] => Some(only.offsets.clone()),
            [lo, hi, ..] => {
                if lo.offsets.len() != hi.offsets.len() {
                    return None;
                }
                let span = hi.integration_time - lo.integration_time;
                if span.abs() < f64::EPSILON {
                    return Some(lo.offsets.clone());
                }
                let t = (integration_time - lo.integration_time) / span;
                Some(
                    lo.offsets
                        .iter()
                        .zip(&hi.offsets)
                        .map(|(a, b)| a + (b - a) * t)
                        .collect(),
                )
            }
        }
    }
}

/// Raw counts measured on the white reference tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteReference {
    /// Integration time in seconds.
    pub integration_time: f64,
    /// Counts per channel, black not subtracted.
    pub counts: Vec<f64>,
}

/// Session calibration state: everything measured by calibration steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationData {
    /// Black level offsets.
    pub black: Option<BlackLevel>,
    /// Raw white reference counts.
    pub white: Option<WhiteReference>,
    /// Device temperature when the black level was taken.
    pub calibration_temperature: Option<f64>,
    /// Integration time chosen by the last integration-time step.
    pub integration_time: Option<f64>,
    /// Measured display refresh rate.
    pub refresh_hz: Option<f64>,
}

impl CalibrationData {
    /// Merge the non-empty fields of `update`.
    pub fn apply(&mut self, update: CalibrationUpdate) {
        if let Some(black) = update.black {
            self.black = Some(black);
        }
        if let Some(white) = update.white {
            self.white = Some(white);
        }
        if let Some(t) = update.temperature {
            self.calibration_temperature = Some(t);
        }
        if let Some(it) = update.integration_time {
            self.integration_time = Some(it);
        }
        if let Some(hz) = update.refresh_hz {
            self.refresh_hz = Some(hz);
        }
    }
}
