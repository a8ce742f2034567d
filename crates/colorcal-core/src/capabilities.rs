//! Capability bitmask, operating modes, and the operation table.
//!
//! Every driver publishes a [`CapabilityBits`] mask and the list of
//! [`Operation`]s it really implements. [`verify_operations`] is run by every
//! driver constructor and rejects a driver whose bits and implementations
//! disagree, so a declared capability can never dispatch into an
//! `Unsupported` default and an implemented operation can never hide behind a
//! missing bit.

use crate::error::{ColorError, ColorResult};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

bitflags! {
    /// Supported modes and optional features of an instrument.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CapabilityBits: u32 {
        /// Display (emissive) measurement.
        const EMISSIVE = 1 << 0;
        /// Emissive measurement synchronised to the display refresh.
        const EMISSIVE_REFRESH = 1 << 1;
        /// Ambient light through a diffuser.
        const AMBIENT = 1 << 2;
        /// Reflective measurement against a white reference.
        const REFLECTIVE = 1 << 3;
        /// Reports a spectral curve with each sample.
        const SPECTRAL = 1 << 4;
        /// Supports device calibration.
        const CALIBRATION = 1 << 5;
        /// Has an internal temperature sensor.
        const TEMPERATURE = 1 << 6;
        /// Has a physical trigger button that can be polled.
        const TRIGGER_SWITCH = 1 << 7;
        /// Host-selectable gain range.
        const RANGE_CONTROL = 1 << 8;
        /// Reports model, firmware and serial number.
        const SERIAL_NUMBER = 1 << 9;
    }
}

impl CapabilityBits {
    /// Bits that denote a measurement mode.
    pub const MEASUREMENT_MODES: CapabilityBits = CapabilityBits::EMISSIVE
        .union(CapabilityBits::EMISSIVE_REFRESH)
        .union(CapabilityBits::AMBIENT)
        .union(CapabilityBits::REFLECTIVE);

    /// Whether `mode` can be selected on this instrument.
    pub fn supports_mode(self, mode: Mode) -> bool {
        self.contains(mode.capability())
    }

    /// Modes this instrument can be put in, in declaration order.
    pub fn modes(self) -> Vec<Mode> {
        Mode::ALL
            .iter()
            .copied()
            .filter(|m| self.supports_mode(*m))
            .collect()
    }
}

/// Kind of light being measured, attached to every reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    /// Light emitted by a display.
    Emissive,
    /// Ambient illumination.
    Ambient,
    /// Light reflected from a surface.
    Reflective,
}

/// Operating mode of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Emissive, free running.
    Emissive,
    /// Emissive, integration synchronised to the display refresh.
    EmissiveRefresh,
    /// Ambient through the diffuser.
    Ambient,
    /// Reflective against the white tile.
    Reflective,
}

impl Mode {
    /// Every mode.
    pub const ALL: [Mode; 4] = [
        Mode::Emissive,
        Mode::EmissiveRefresh,
        Mode::Ambient,
        Mode::Reflective,
    ];

    /// Capability bit that enables this mode.
    pub fn capability(self) -> CapabilityBits {
        match self {
            Mode::Emissive => CapabilityBits::EMISSIVE,
            Mode::EmissiveRefresh => CapabilityBits::EMISSIVE_REFRESH,
            Mode::Ambient => CapabilityBits::AMBIENT,
            Mode::Reflective => CapabilityBits::REFLECTIVE,
        }
    }

    /// Tag attached to readings taken in this mode.
    pub fn measurement_type(self) -> MeasurementType {
        match self {
            Mode::Emissive | Mode::EmissiveRefresh => MeasurementType::Emissive,
            Mode::Ambient => MeasurementType::Ambient,
            Mode::Reflective => MeasurementType::Reflective,
        }
    }

    /// Lowercase name as used in configuration and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Mode::Emissive => "emissive",
            Mode::EmissiveRefresh => "emissive_refresh",
            Mode::Ambient => "ambient",
            Mode::Reflective => "reflective",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = ColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s) || (s == "refresh" && *m == Mode::EmissiveRefresh))
            .ok_or_else(|| ColorError::Configuration(format!("unknown mode '{s}'")))
    }
}

/// Operations a caller can dispatch to a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read model, firmware and serial number.
    Identify,
    /// Switch measurement mode.
    SetMode,
    /// Run a calibration step.
    Calibrate,
    /// Acquire one raw sample.
    ReadRaw,
    /// Read the internal temperature sensor.
    ReadTemperature,
    /// Select a gain range.
    SetRange,
    /// Poll the trigger switch.
    PollSwitch,
}

impl Operation {
    /// Every operation, in table order.
    pub const ALL: [Operation; 7] = [
        Operation::Identify,
        Operation::SetMode,
        Operation::Calibrate,
        Operation::ReadRaw,
        Operation::ReadTemperature,
        Operation::SetRange,
        Operation::PollSwitch,
    ];

    /// Bits of which at least one must be present for this operation.
    pub fn enabling_bits(self) -> CapabilityBits {
        match self {
            Operation::Identify => CapabilityBits::SERIAL_NUMBER,
            Operation::SetMode | Operation::ReadRaw => CapabilityBits::MEASUREMENT_MODES,
            Operation::Calibrate => CapabilityBits::CALIBRATION,
            Operation::ReadTemperature => CapabilityBits::TEMPERATURE,
            Operation::SetRange => CapabilityBits::RANGE_CONTROL,
            Operation::PollSwitch => CapabilityBits::TRIGGER_SWITCH,
        }
    }

    /// Snake-case name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Identify => "identify",
            Operation::SetMode => "set_mode",
            Operation::Calibrate => "calibrate",
            Operation::ReadRaw => "read_raw",
            Operation::ReadTemperature => "read_temperature",
            Operation::SetRange => "set_range",
            Operation::PollSwitch => "poll_switch",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `caps` enables `op`.
pub fn supports(caps: CapabilityBits, op: Operation) -> bool {
    caps.intersects(op.enabling_bits())
}

/// Check that capability bits and implemented operations agree.
///
/// Called from every driver constructor. A mismatch in either direction is an
/// [`ColorError::Internal`].
pub fn verify_operations(
    driver: &str,
    caps: CapabilityBits,
    implemented: &[Operation],
) -> ColorResult<()> {
    for op in Operation::ALL {
        let declared = supports(caps, op);
        let present = implemented.contains(&op);
        if declared && !present {
            return Err(ColorError::Internal(format!(
                "{driver}: capability bits enable '{op}' but the driver does not implement it"
            )));
        }
        if present && !declared {
            return Err(ColorError::Internal(format!(
                "{driver}: implements '{op}' without declaring a capability bit for it"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_follow_bits() {
        let caps = CapabilityBits::EMISSIVE | CapabilityBits::REFLECTIVE;
        assert_eq!(caps.modes(), vec![Mode::Emissive, Mode::Reflective]);
        assert!(!caps.supports_mode(Mode::Ambient));
    }

    #[test]
    fn test_verify_accepts_consistent_table() {
        let caps = CapabilityBits::EMISSIVE | CapabilityBits::CALIBRATION;
        let ops = [
            Operation::SetMode,
            Operation::ReadRaw,
            Operation::Calibrate,
        ];
        assert!(verify_operations("test", caps, &ops).is_ok());
    }

    #[test]
    fn test_verify_rejects_bit_without_implementation() {
        let caps = CapabilityBits::EMISSIVE | CapabilityBits::TEMPERATURE;
        let ops = [Operation::SetMode, Operation::ReadRaw];
        let err = verify_operations("test", caps, &ops).unwrap_err();
        assert!(matches!(err, ColorError::Internal(msg) if msg.contains("read_temperature")));
    }

    #[test]
    fn test_verify_rejects_implementation_without_bit() {
        let caps = CapabilityBits::EMISSIVE;
        let ops = [Operation::SetMode, Operation::ReadRaw, Operation::SetRange];
        assert!(verify_operations("test", caps, &ops).is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Reflective".parse::<Mode>().ok(), Some(Mode::Reflective));
        assert_eq!("refresh".parse::<Mode>().ok(), Some(Mode::EmissiveRefresh));
        assert!("spot".parse::<Mode>().is_err());
    }
}
