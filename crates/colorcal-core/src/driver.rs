//! The instrument driver contract.
//!
//! Every device family implements [`InstrumentDriver`]. All I/O operations have
//! default bodies returning [`ColorError::Unsupported`], so a driver overrides
//! only what it implements and can never leave an operation undefined. The
//! driver also lists what it overrides in
//! [`InstrumentDriver::implemented_operations`]; constructors run
//! [`verify_operations`](crate::capabilities::verify_operations) against the
//! capability bits.
//!
//! # Example
//!
//! ```rust,ignore
//! use colorcal_core::driver::InstrumentDriver;
//!
//! #[async_trait]
//! impl InstrumentDriver for Photometer {
//!     fn capabilities(&self) -> CapabilityBits { CapabilityBits::EMISSIVE }
//!     fn implemented_operations(&self) -> &'static [Operation] {
//!         &[Operation::SetMode, Operation::ReadRaw]
//!     }
//!     async fn read_raw(&mut self, mode: Mode) -> ColorResult<RawOutcome> {
//!         // talk to the device...
//!     }
//!     // everything else stays `Unsupported`
//! }
//! ```

use crate::calibration::{
    CalibrationCondition, CalibrationData, CalibrationPolicy, CalibrationRequirement,
    CalibrationStep, CalibrationType,
};
use crate::capabilities::{CapabilityBits, Mode, Operation};
use crate::data::{ConversionProfile, DeviceIdentity, InstrumentType, RawOutcome};
use crate::error::{ColorError, ColorResult};
use crate::measurement::StabilizationConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// State of a physical trigger button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    /// Not pressed since the last poll.
    Idle,
    /// Pressed since the last poll.
    Pressed,
}

/// Lightweight status query used by the background poller.
///
/// Implementations must hold the shared link for at most one bounded exchange
/// and return `Ok(None)` when the link is busy, so a foreground measurement is
/// never starved.
#[async_trait]
pub trait StatusPoll: Send + Sync {
    /// Query idle/trigger status once.
    async fn poll(&self) -> ColorResult<Option<SwitchState>>;
}

/// Contract implemented by every device family.
#[async_trait]
pub trait InstrumentDriver: Send {
    /// Family of this driver.
    fn instrument_type(&self) -> InstrumentType;

    /// Supported modes and features.
    fn capabilities(&self) -> CapabilityBits;

    /// Operations this driver overrides.
    fn implemented_operations(&self) -> &'static [Operation];

    /// Factory conversion data (valid after `identify`).
    fn conversion(&self) -> &ConversionProfile;

    /// Default convergence thresholds for this device.
    fn stabilization(&self) -> StabilizationConfig {
        StabilizationConfig::default()
    }

    /// Calibration types available and required in `mode`.
    fn calibration_policy(&self, _mode: Mode) -> CalibrationPolicy {
        CalibrationPolicy::default()
    }

    /// Requirement describing how `kind` is performed.
    fn requirement_for(&self, kind: CalibrationType) -> CalibrationRequirement {
        default_requirement(kind)
    }

    /// How long a completed calibration of `kind` stays valid.
    fn calibration_timeout(&self, _kind: CalibrationType) -> Option<Duration> {
        None
    }

    /// Idle age after which a persisted calibration is treated as absent.
    fn cache_timeout(&self) -> Option<Duration> {
        None
    }

    /// Status poller for devices with a trigger button.
    fn status_poll(&self) -> Option<Arc<dyn StatusPoll>> {
        None
    }

    /// Re-seed driver state derived from calibration (integration time,
    /// refresh rate) after a persisted calibration is loaded.
    fn restore(&mut self, _data: &CalibrationData) {}

    /// Read model, firmware, serial number and factory conversion data.
    async fn identify(&mut self) -> ColorResult<DeviceIdentity> {
        Err(ColorError::unsupported(Operation::Identify))
    }

    /// Put the device in `mode`.
    async fn set_mode(&mut self, _mode: Mode) -> ColorResult<()> {
        Err(ColorError::unsupported(Operation::SetMode))
    }

    /// Attempt the outstanding calibration types given the arranged condition.
    async fn calibrate(
        &mut self,
        _pending: CalibrationType,
        _condition: CalibrationCondition,
        _mode: Mode,
    ) -> ColorResult<CalibrationStep> {
        Err(ColorError::unsupported(Operation::Calibrate))
    }

    /// Whether the device itself can confirm `condition` is already met.
    ///
    /// Not capability-gated: the default simply cannot tell.
    async fn verify_condition(&mut self, _condition: CalibrationCondition) -> ColorResult<bool> {
        Ok(false)
    }

    /// Acquire one raw sample.
    async fn read_raw(&mut self, _mode: Mode) -> ColorResult<RawOutcome> {
        Err(ColorError::unsupported(Operation::ReadRaw))
    }

    /// Read the internal temperature sensor in °C.
    async fn read_temperature(&mut self) -> ColorResult<f64> {
        Err(ColorError::unsupported(Operation::ReadTemperature))
    }

    /// Select gain range `range`.
    async fn set_range(&mut self, _range: u8) -> ColorResult<()> {
        Err(ColorError::unsupported(Operation::SetRange))
    }

    /// Query the trigger switch once.
    async fn poll_switch(&mut self) -> ColorResult<SwitchState> {
        Err(ColorError::unsupported(Operation::PollSwitch))
    }
}

/// Requirement for `kind` when the driver has nothing more specific to say.
pub fn default_requirement(kind: CalibrationType) -> CalibrationRequirement {
    let condition = if kind.intersects(CalibrationType::WHITE_REFERENCE) {
        CalibrationCondition::PlaceOnWhiteReference
    } else if kind.intersects(CalibrationType::DARK) {
        CalibrationCondition::CoverSensor
    } else if kind.intersects(CalibrationType::GLOSS) {
        CalibrationCondition::PlaceOnGlossReference
    } else if kind.intersects(CalibrationType::WAVELENGTH) {
        CalibrationCondition::PlaceOnWavelengthReference
    } else {
        CalibrationCondition::None
    };
    CalibrationRequirement::new(kind, condition)
}
