//! `colorcal-core`
//!
//! Core trait definitions and types for colorcal instrument abstraction.
//!
//! This crate defines the device-independent contract that every colorimeter
//! and spectrometer driver implements, plus the data and error types that flow
//! between drivers, the measurement engine and callers.
//!
//! ## Key Types
//!
//! - [`driver::InstrumentDriver`]: async trait whose operations default to
//!   `Unsupported`
//! - [`capabilities::CapabilityBits`] and [`capabilities::Operation`]: the
//!   capability table checked by every driver constructor
//! - [`calibration::CalibrationRequirement`]: structured request a driver emits
//!   when the host must arrange a physical condition
//! - [`data::RawSample`] and [`data::CalibratedReading`]: what goes in and out
//!   of the stabilization engine
//! - [`error::ColorError`]: the error taxonomy
//! - [`abort::AbortFlag`]: cooperative cancellation checked at every wait point

pub mod abort;
pub mod calibration;
pub mod capabilities;
pub mod data;
pub mod driver;
pub mod error;
pub mod error_recovery;
pub mod measurement;

pub use abort::AbortFlag;
pub use calibration::{
    BlackLevel, BlackPoint, CalibrationCondition, CalibrationData, CalibrationHost,
    CalibrationPolicy, CalibrationRequest, CalibrationRequirement, CalibrationStep,
    CalibrationType, CalibrationUpdate, HostResponse, WhiteReference,
};
pub use capabilities::{CapabilityBits, MeasurementType, Mode, Operation};
pub use data::{
    CalibratedReading, Confidence, ConversionProfile, DeviceIdentity, InstrumentType,
    RangeDirection, RangeOverflow, RawOutcome, RawSample, Spectrum, Xyz,
};
pub use driver::{InstrumentDriver, StatusPoll, SwitchState};
pub use error::{CacheError, ColorError, ColorResult, ProbeError, TransportError};
pub use error_recovery::RetryPolicy;
pub use measurement::{MeasurementCycle, MeasurementState, StabilizationConfig};
