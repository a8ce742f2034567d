//! Samples, readings and device descriptions.

use crate::capabilities::MeasurementType;
use crate::error::ColorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instrument families known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    /// Serial ASCII colorimeter with temperature sensor.
    KiSensor,
    /// Serial STX/ETX colorimeter with trigger button and white tile.
    SmCube,
    /// USB binary-protocol colorimeter.
    SpyderX,
    /// In-process simulated instrument.
    Simulated,
}

impl InstrumentType {
    /// Every family.
    pub const ALL: [InstrumentType; 4] = [
        InstrumentType::KiSensor,
        InstrumentType::SmCube,
        InstrumentType::SpyderX,
        InstrumentType::Simulated,
    ];

    /// Stable name used in configuration and cache file names.
    pub fn name(self) -> &'static str {
        match self {
            InstrumentType::KiSensor => "ki_sensor",
            InstrumentType::SmCube => "sm_cube",
            InstrumentType::SpyderX => "spyder_x",
            InstrumentType::Simulated => "simulated",
        }
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InstrumentType {
    type Err = ColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.replace('-', "_").to_ascii_lowercase();
        InstrumentType::ALL
            .iter()
            .copied()
            .find(|t| t.name() == wanted || t.name().replace('_', "") == wanted)
            .ok_or_else(|| ColorError::Configuration(format!("unknown instrument type '{s}'")))
    }
}

/// Model, firmware and serial number read at open.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Model string.
    pub model: String,
    /// Firmware version string.
    pub firmware: String,
    /// Serial number, the key of the calibration cache.
    pub serial: String,
}

/// CIE 1931 tristimulus values.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Xyz {
    /// X.
    pub x: f64,
    /// Y (luminance).
    pub y: f64,
    /// Z.
    pub z: f64,
}

impl Xyz {
    /// Construct from components.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Component-wise mean of two values.
    pub fn mean(a: Xyz, b: Xyz) -> Xyz {
        Xyz::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0, (a.z + b.z) / 2.0)
    }

    /// Apply a 3×3 matrix.
    pub fn transform(self, m: &[[f64; 3]; 3]) -> Xyz {
        let v = [self.x, self.y, self.z];
        let row = |r: &[f64; 3]| r[0] * v[0] + r[1] * v[1] + r[2] * v[2];
        Xyz::new(row(&m[0]), row(&m[1]), row(&m[2]))
    }

    /// Whether every component is finite.
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Xyz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X={:.4} Y={:.4} Z={:.4}", self.x, self.y, self.z)
    }
}

/// Spectral curve on a regular wavelength grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// First wavelength in nm.
    pub start_nm: f64,
    /// Spacing in nm.
    pub step_nm: f64,
    /// Values per band.
    pub values: Vec<f64>,
}

/// Device-native channel values from a single read.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Counts per sensor channel.
    pub channels: Vec<f64>,
    /// Integration time in seconds.
    pub integration_time: f64,
    /// Gain/range code the sample was taken at.
    pub range: u8,
    /// Device temperature in °C, when the device reports one.
    pub temperature: Option<f64>,
    /// Spectral curve, when the device reports one.
    pub spectrum: Option<Spectrum>,
    /// Host capture time.
    pub captured_at: DateTime<Utc>,
}

impl RawSample {
    /// Sample captured now with no temperature or spectrum.
    pub fn new(channels: Vec<f64>, integration_time: f64, range: u8) -> Self {
        Self {
            channels,
            integration_time,
            range,
            temperature: None,
            spectrum: None,
            captured_at: Utc::now(),
        }
    }

    /// Attach a temperature reading.
    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature = Some(celsius);
        self
    }
}

/// Direction of an overload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDirection {
    /// Signal too strong for the current gain; a lower gain is needed.
    TooBright,
    /// Signal too weak for the current gain; a higher gain is needed.
    TooDark,
}

/// Overload report from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeOverflow {
    /// Which way the signal is out of range.
    pub direction: RangeDirection,
    /// The device is already at the extreme range in that direction.
    pub at_extreme: bool,
}

impl fmt::Display for RangeOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.direction {
            RangeDirection::TooBright => "too bright for current range",
            RangeDirection::TooDark => "too dark for current range",
        };
        f.write_str(what)?;
        if self.at_extreme {
            f.write_str(" (already at extreme range)")?;
        }
        Ok(())
    }
}

/// Result of one raw read.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
    /// Valid counts.
    Sample(RawSample),
    /// The device reported overload or underload.
    OutOfRange(RangeOverflow),
}

/// How a reading was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// A convergence rule accepted the value.
    Converged,
    /// The retry budget ran out and the last value was accepted anyway.
    Degraded,
}

/// Externally visible measurement result. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedReading {
    xyz: Xyz,
    measurement_type: MeasurementType,
    valid: bool,
    confidence: Confidence,
    spectrum: Option<Spectrum>,
    samples: u32,
    captured_at: DateTime<Utc>,
}

impl CalibratedReading {
    /// Build a reading. Validity follows from the values being finite.
    pub fn new(
        xyz: Xyz,
        measurement_type: MeasurementType,
        confidence: Confidence,
        spectrum: Option<Spectrum>,
        samples: u32,
    ) -> Self {
        Self {
            valid: xyz.is_finite(),
            xyz,
            measurement_type,
            confidence,
            spectrum,
            samples,
            captured_at: Utc::now(),
        }
    }

    /// Tristimulus values.
    pub fn xyz(&self) -> Xyz {
        self.xyz
    }

    /// Reflective, emissive or ambient.
    pub fn measurement_type(&self) -> MeasurementType {
        self.measurement_type
    }

    /// Whether the values are usable.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Converged or degraded.
    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    /// Spectral curve, if the device produced one.
    pub fn spectrum(&self) -> Option<&Spectrum> {
        self.spectrum.as_ref()
    }

    /// Raw samples consumed to produce this reading.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// When the reading was produced.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// Factory conversion data read from a device at open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionProfile {
    /// 3×N matrix from normalised channel rates to XYZ.
    pub matrix: [Vec<f64>; 3],
    /// Multiplier per range code; counts are divided by it.
    pub gains: Vec<f64>,
    /// Per-channel temperature coefficient (fraction per °C).
    pub temperature_coefficients: Vec<f64>,
    /// Base calibration identifier that correction matrices refer to.
    pub base_id: String,
}

impl ConversionProfile {
    /// Identity profile for a three-channel sensor.
    pub fn identity(base_id: impl Into<String>) -> Self {
        Self {
            matrix: [vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
            gains: vec![1.0],
            temperature_coefficients: vec![0.0; 3],
            base_id: base_id.into(),
        }
    }

    /// Number of input channels the matrix expects.
    pub fn channels(&self) -> usize {
        self.matrix[0].len()
    }

    /// Gain for a range code.
    pub fn gain(&self, range: u8) -> Option<f64> {
        self.gains.get(usize::from(range)).copied()
    }
}
