//! In-process instrument driven by a [`SimulationScript`].
//!
//! No link is touched. Channel counts follow the scripted luminance sequence
//! (`[0.95·Y, Y, 1.09·Y]` plus the dark offset), so the whole engine from
//! negotiation to convergence can be exercised without hardware.

use async_trait::async_trait;
use colorcal_core::calibration::{
    BlackLevel, CalibrationCondition, CalibrationPolicy, CalibrationRequirement, CalibrationStep,
    CalibrationType, CalibrationUpdate, WhiteReference,
};
use colorcal_core::capabilities::{verify_operations, CapabilityBits, Mode, Operation};
use colorcal_core::data::{
    ConversionProfile, DeviceIdentity, InstrumentType, RangeOverflow, RawOutcome, RawSample,
    Spectrum,
};
use colorcal_core::driver::{default_requirement, InstrumentDriver};
use colorcal_core::error::{ColorError, ColorResult, TransportError};

/// Supported features.
pub const CAPABILITIES: CapabilityBits = CapabilityBits::EMISSIVE
    .union(CapabilityBits::AMBIENT)
    .union(CapabilityBits::REFLECTIVE)
    .union(CapabilityBits::SPECTRAL)
    .union(CapabilityBits::CALIBRATION)
    .union(CapabilityBits::TEMPERATURE)
    .union(CapabilityBits::SERIAL_NUMBER);

/// Implemented operations.
pub const OPERATIONS: &[Operation] = &[
    Operation::Identify,
    Operation::SetMode,
    Operation::Calibrate,
    Operation::ReadRaw,
    Operation::ReadTemperature,
];

const INTEGRATION_S: f64 = 1.0;
const TEMPERATURE_C: f64 = 25.0;
const SPECTRUM_START_NM: f64 = 380.0;
const SPECTRUM_STEP_NM: f64 = 10.0;
const SPECTRUM_BANDS: usize = 36;

/// Behaviour of a simulated instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationScript {
    /// Reported serial number.
    pub serial: String,
    /// Calibrations required in emissive and ambient mode.
    pub required_emissive: CalibrationType,
    /// Calibrations required in reflective mode.
    pub required_reflective: CalibrationType,
    /// Types whose requirement may be skipped.
    pub optional: CalibrationType,
    /// Types the device never completes, however the host answers.
    pub refuse: CalibrationType,
    /// The device reports its sensor as covered without asking the host.
    pub sensor_covered: bool,
    /// Y value of each successive read; the last one repeats.
    pub luminance: Vec<f64>,
    /// Offset added to every channel.
    pub dark_offset: f64,
    /// Reads that fail with a timeout before the first success.
    pub transport_failures: u32,
    /// Every read reports this overload instead of counts.
    pub overflow: Option<RangeOverflow>,
    /// Identifier of the white tile.
    pub tile_serial: String,
    /// Y of the white tile.
    pub white_luminance: f64,
}

impl Default for SimulationScript {
    fn default() -> Self {
        Self {
            serial: "SIM-0001".to_string(),
            required_emissive: CalibrationType::DARK,
            required_reflective: CalibrationType::DARK | CalibrationType::WHITE_REFERENCE,
            optional: CalibrationType::empty(),
            refuse: CalibrationType::empty(),
            sensor_covered: false,
            luminance: vec![120.0],
            dark_offset: 0.5,
            transport_failures: 0,
            overflow: None,
            tile_serial: "SIM-TILE-001".to_string(),
            white_luminance: 1000.0,
        }
    }
}

fn channels_for(y: f64, offset: f64) -> Vec<f64> {
    vec![0.95 * y + offset, y + offset, 1.09 * y + offset]
}

/// Simulated instrument.
#[derive(Debug)]
pub struct Simulated {
    script: SimulationScript,
    profile: ConversionProfile,
    reads: usize,
    failures_left: u32,
}

impl Simulated {
    /// Build from a script.
    pub fn new(script: SimulationScript) -> ColorResult<Self> {
        verify_operations("simulated", CAPABILITIES, OPERATIONS)?;
        if script.luminance.is_empty() {
            return Err(ColorError::Configuration(
                "simulation script needs at least one luminance value".into(),
            ));
        }
        Ok(Self {
            failures_left: script.transport_failures,
            script,
            profile: ConversionProfile::identity("simulated"),
            reads: 0,
        })
    }

    /// Raw reads served so far, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads
    }

    fn next_luminance(&mut self) -> f64 {
        let values = &self.script.luminance;
        let y = values[self.reads.min(values.len() - 1)];
        self.reads += 1;
        y
    }

    fn spectrum(y: f64) -> Spectrum {
        let last = (SPECTRUM_BANDS - 1) as f64;
        Spectrum {
            start_nm: SPECTRUM_START_NM,
            step_nm: SPECTRUM_STEP_NM,
            values: (0..SPECTRUM_BANDS)
                .map(|i| y / 100.0 * (0.8 + 0.4 * i as f64 / last))
                .collect(),
        }
    }
}

#[async_trait]
impl InstrumentDriver for Simulated {
    fn instrument_type(&self) -> InstrumentType {
        InstrumentType::Simulated
    }

    fn capabilities(&self) -> CapabilityBits {
        CAPABILITIES
    }

    fn implemented_operations(&self) -> &'static [Operation] {
        OPERATIONS
    }

    fn conversion(&self) -> &ConversionProfile {
        &self.profile
    }

    fn calibration_policy(&self, mode: Mode) -> CalibrationPolicy {
        let required = match mode {
            Mode::Reflective => self.script.required_reflective,
            Mode::Emissive | Mode::Ambient => self.script.required_emissive,
            Mode::EmissiveRefresh => CalibrationType::empty(),
        };
        CalibrationPolicy {
            available: required | CalibrationType::DARK,
            required,
        }
    }

    fn requirement_for(&self, kind: CalibrationType) -> CalibrationRequirement {
        let mut requirement = default_requirement(kind);
        if kind.intersects(CalibrationType::WHITE_REFERENCE) {
            requirement = requirement.with_identifier(self.script.tile_serial.clone());
        }
        if self.script.optional.contains(kind) {
            requirement = requirement.optional();
        }
        requirement
    }

    async fn identify(&mut self) -> ColorResult<DeviceIdentity> {
        Ok(DeviceIdentity {
            model: "Simulated".to_string(),
            firmware: env!("CARGO_PKG_VERSION").to_string(),
            serial: self.script.serial.clone(),
        })
    }

    async fn set_mode(&mut self, mode: Mode) -> ColorResult<()> {
        if !CAPABILITIES.supports_mode(mode) {
            return Err(ColorError::unsupported(Operation::SetMode));
        }
        Ok(())
    }

    async fn calibrate(
        &mut self,
        pending: CalibrationType,
        condition: CalibrationCondition,
        _mode: Mode,
    ) -> ColorResult<CalibrationStep> {
        // Dark first so a white reading can be black-corrected.
        let kind = if pending.contains(CalibrationType::DARK) {
            CalibrationType::DARK
        } else {
            pending
                .first()
                .ok_or_else(|| ColorError::Internal("nothing to calibrate".into()))?
        };
        let requirement = self.requirement_for(kind);
        let arranged = requirement.condition == CalibrationCondition::None
            || requirement.condition == condition;
        if !arranged || self.script.refuse.contains(kind) {
            return Ok(CalibrationStep::NeedsSetup(requirement));
        }

        let mut update = CalibrationUpdate::default();
        if kind == CalibrationType::DARK {
            update.black = Some(BlackLevel::single(
                INTEGRATION_S,
                vec![self.script.dark_offset; 3],
            ));
            update.temperature = Some(TEMPERATURE_C);
        } else if kind == CalibrationType::WHITE_REFERENCE {
            update.white = Some(WhiteReference {
                integration_time: INTEGRATION_S,
                counts: channels_for(self.script.white_luminance, self.script.dark_offset),
            });
        }
        tracing::debug!(target: "colorcal::calibration", kind = kind.label(), "Simulated calibration completed");
        Ok(CalibrationStep::Completed {
            cleared: kind,
            update,
        })
    }

    async fn verify_condition(&mut self, condition: CalibrationCondition) -> ColorResult<bool> {
        Ok(self.script.sensor_covered && condition == CalibrationCondition::CoverSensor)
    }

    async fn read_raw(&mut self, _mode: Mode) -> ColorResult<RawOutcome> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            self.reads += 1;
            return Err(TransportError::Timeout { timeout_ms: 200 }.into());
        }
        if let Some(overflow) = self.script.overflow {
            self.reads += 1;
            return Ok(RawOutcome::OutOfRange(overflow));
        }
        let y = self.next_luminance();
        let mut sample = RawSample::new(channels_for(y, self.script.dark_offset), INTEGRATION_S, 0)
            .with_temperature(TEMPERATURE_C);
        sample.spectrum = Some(Self::spectrum(y));
        Ok(RawOutcome::Sample(sample))
    }

    async fn read_temperature(&mut self) -> ColorResult<f64> {
        Ok(TEMPERATURE_C)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_luminance_sequence_repeats_last() {
        let mut sim = Simulated::new(SimulationScript {
            luminance: vec![10.0, 20.0],
            dark_offset: 0.0,
            ..Default::default()
        })
        .unwrap();
        let mut ys = Vec::new();
        for _ in 0..3 {
            let RawOutcome::Sample(s) = sim.read_raw(Mode::Emissive).await.unwrap() else {
                panic!("expected sample");
            };
            ys.push(s.channels[1]);
            assert_eq!(s.spectrum.as_ref().map(|sp| sp.values.len()), Some(36));
        }
        assert_eq!(ys, vec![10.0, 20.0, 20.0]);
    }

    #[tokio::test]
    async fn test_failures_come_first() {
        let mut sim = Simulated::new(SimulationScript {
            transport_failures: 2,
            ..Default::default()
        })
        .unwrap();
        assert!(sim.read_raw(Mode::Emissive).await.unwrap_err().is_transient());
        assert!(sim.read_raw(Mode::Emissive).await.unwrap_err().is_transient());
        assert!(sim.read_raw(Mode::Emissive).await.is_ok());
        assert_eq!(sim.reads(), 3);
    }

    #[tokio::test]
    async fn test_white_requirement_carries_tile() {
        let mut sim = Simulated::new(SimulationScript::default()).unwrap();
        let step = sim
            .calibrate(
                CalibrationType::WHITE_REFERENCE,
                CalibrationCondition::None,
                Mode::Reflective,
            )
            .await
            .unwrap();
        let CalibrationStep::NeedsSetup(req) = step else {
            panic!("expected setup request");
        };
        assert_eq!(req.identifier.as_deref(), Some("SIM-TILE-001"));
        assert!(!req.optional);
    }

    #[test]
    fn test_empty_script_is_rejected() {
        let script = SimulationScript {
            luminance: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            Simulated::new(script),
            Err(ColorError::Configuration(_))
        ));
    }
}
