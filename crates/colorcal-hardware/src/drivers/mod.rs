//! Device families.
//!
//! Each family implements [`InstrumentDriver`] for its own wire protocol. The
//! [`Driver`] enum holds whichever family is attached and delegates every trait
//! method to it, so the session never needs a trait object.
//!
//! # Families
//!
//! | Driver | Link | Protocol |
//! |---|---|---|
//! | [`KiSensor`] | serial | ASCII, CR terminated, `<NN>` error echo |
//! | [`SmCube`] | serial | ASCII, STX/ETX, ack/nak status |
//! | [`SpyderX`] | USB | binary, nonce + length + checksum |
//! | [`Simulated`] | none | scripted readings |

pub mod ki_sensor;
pub mod simulated;
pub mod sm_cube;
pub mod spyder_x;

pub use ki_sensor::KiSensor;
pub use simulated::{SimulationScript, Simulated};
pub use sm_cube::SmCube;
pub use spyder_x::SpyderX;

use crate::config::SessionSettings;
use crate::transport::{AsciiCodec, AsciiResponse, BinaryCodec, BinaryReply, Transport};
use async_trait::async_trait;
use colorcal_core::abort::AbortFlag;
use colorcal_core::calibration::{
    CalibrationCondition, CalibrationData, CalibrationPolicy, CalibrationRequirement,
    CalibrationStep, CalibrationType,
};
use colorcal_core::capabilities::{CapabilityBits, Mode, Operation};
use colorcal_core::data::{ConversionProfile, DeviceIdentity, InstrumentType, RawOutcome};
use colorcal_core::driver::{InstrumentDriver, StatusPoll, SwitchState};
use colorcal_core::error::{ColorError, ColorResult};
use colorcal_core::error_recovery::{retry_transient, RetryPolicy};
use colorcal_core::measurement::StabilizationConfig;
use std::sync::Arc;
use std::time::Duration;

/// Everything a driver needs to talk to its device.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Shared link.
    pub transport: Transport,
    /// Timeout for one exchange.
    pub timeout: Duration,
    /// Retry policy for identification and calibration commands.
    pub retry: RetryPolicy,
    /// Session abort flag.
    pub abort: AbortFlag,
    /// How long the status poller waits for the link.
    pub poll_lock_timeout: Duration,
    /// Exchange timeout for status queries.
    pub status_timeout: Duration,
}

impl DriverContext {
    /// Context from session settings.
    pub fn new(transport: Transport, settings: &SessionSettings, abort: AbortFlag) -> Self {
        Self {
            transport,
            timeout: settings.transport.timeout(),
            retry: settings.transport.retry_policy(),
            abort,
            poll_lock_timeout: settings.poller.lock_timeout(),
            status_timeout: settings.poller.status_timeout(),
        }
    }

    /// One ASCII exchange, no retry.
    pub async fn ascii_once(&self, codec: &AsciiCodec, command: &str) -> ColorResult<AsciiResponse> {
        Ok(self.transport.ascii(codec, command, self.timeout).await?)
    }

    /// ASCII exchange retried on transient failures.
    pub async fn ascii(&self, codec: &AsciiCodec, command: &str) -> ColorResult<AsciiResponse> {
        retry_transient(&self.retry, &self.abort, command, move || {
            self.ascii_once(codec, command)
        })
        .await
    }

    /// One binary exchange, no retry.
    pub async fn binary_once(
        &self,
        codec: &BinaryCodec,
        opcode: u8,
        payload: &[u8],
    ) -> ColorResult<BinaryReply> {
        Ok(self
            .transport
            .binary(codec, opcode, payload, self.timeout)
            .await?)
    }

    /// Binary exchange retried on transient failures.
    pub async fn binary(
        &self,
        codec: &BinaryCodec,
        opcode: u8,
        payload: &[u8],
    ) -> ColorResult<BinaryReply> {
        let label = format!("opcode {opcode:#04x}");
        retry_transient(&self.retry, &self.abort, &label, move || {
            self.binary_once(codec, opcode, payload)
        })
        .await
    }
}

/// Parse whitespace- or comma-separated floats, expecting exactly `count`.
pub(crate) fn parse_floats(body: &str, count: usize, what: &str) -> ColorResult<Vec<f64>> {
    let values = body
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ColorError::Misread(format!("{what}: unparseable reply '{body}'")))?;
    if values.len() != count {
        return Err(ColorError::Misread(format!(
            "{what}: expected {count} values, got {} in '{body}'",
            values.len()
        )));
    }
    Ok(values)
}

/// Split nine row-major values into a 3×3 matrix.
pub(crate) fn matrix_rows(values: &[f64]) -> ColorResult<[Vec<f64>; 3]> {
    if values.len() != 9 {
        return Err(ColorError::Misread(format!(
            "matrix: expected 9 values, got {}",
            values.len()
        )));
    }
    Ok([
        values[0..3].to_vec(),
        values[3..6].to_vec(),
        values[6..9].to_vec(),
    ])
}

/// The attached device family.
#[derive(Debug)]
pub enum Driver {
    /// Serial ASCII colorimeter.
    KiSensor(KiSensor),
    /// Serial STX/ETX colorimeter with reflective head.
    SmCube(SmCube),
    /// USB binary colorimeter.
    SpyderX(SpyderX),
    /// Scripted device without I/O.
    Simulated(Simulated),
}

impl Driver {
    /// Construct the driver for `kind` over an open link.
    ///
    /// The simulated family ignores the link and runs the default script.
    pub fn open(kind: InstrumentType, ctx: DriverContext) -> ColorResult<Self> {
        Ok(match kind {
            InstrumentType::KiSensor => Driver::KiSensor(KiSensor::new(ctx)?),
            InstrumentType::SmCube => Driver::SmCube(SmCube::new(ctx)?),
            InstrumentType::SpyderX => Driver::SpyderX(SpyderX::new(ctx)?),
            InstrumentType::Simulated => {
                Driver::Simulated(Simulated::new(SimulationScript::default())?)
            }
        })
    }
}

macro_rules! dispatch {
    ($self:ident, $driver:ident => $body:expr) => {
        match $self {
            Driver::KiSensor($driver) => $body,
            Driver::SmCube($driver) => $body,
            Driver::SpyderX($driver) => $body,
            Driver::Simulated($driver) => $body,
        }
    };
}

#[async_trait]
impl InstrumentDriver for Driver {
    fn instrument_type(&self) -> InstrumentType {
        dispatch!(self, d => d.instrument_type())
    }

    fn capabilities(&self) -> CapabilityBits {
        dispatch!(self, d => d.capabilities())
    }

    fn implemented_operations(&self) -> &'static [Operation] {
        dispatch!(self, d => d.implemented_operations())
    }

    fn conversion(&self) -> &ConversionProfile {
        dispatch!(self, d => d.conversion())
    }

    fn stabilization(&self) -> StabilizationConfig {
        dispatch!(self, d => d.stabilization())
    }

    fn calibration_policy(&self, mode: Mode) -> CalibrationPolicy {
        dispatch!(self, d => d.calibration_policy(mode))
    }

    fn requirement_for(&self, kind: CalibrationType) -> CalibrationRequirement {
        dispatch!(self, d => d.requirement_for(kind))
    }

    fn calibration_timeout(&self, kind: CalibrationType) -> Option<Duration> {
        dispatch!(self, d => d.calibration_timeout(kind))
    }

    fn cache_timeout(&self) -> Option<Duration> {
        dispatch!(self, d => d.cache_timeout())
    }

    fn status_poll(&self) -> Option<Arc<dyn StatusPoll>> {
        dispatch!(self, d => d.status_poll())
    }

    fn restore(&mut self, data: &CalibrationData) {
        dispatch!(self, d => d.restore(data))
    }

    async fn identify(&mut self) -> ColorResult<DeviceIdentity> {
        dispatch!(self, d => d.identify().await)
    }

    async fn set_mode(&mut self, mode: Mode) -> ColorResult<()> {
        dispatch!(self, d => d.set_mode(mode).await)
    }

    async fn calibrate(
        &mut self,
        pending: CalibrationType,
        condition: CalibrationCondition,
        mode: Mode,
    ) -> ColorResult<CalibrationStep> {
        dispatch!(self, d => d.calibrate(pending, condition, mode).await)
    }

    async fn verify_condition(&mut self, condition: CalibrationCondition) -> ColorResult<bool> {
        dispatch!(self, d => d.verify_condition(condition).await)
    }

    async fn read_raw(&mut self, mode: Mode) -> ColorResult<RawOutcome> {
        dispatch!(self, d => d.read_raw(mode).await)
    }

    async fn read_temperature(&mut self) -> ColorResult<f64> {
        dispatch!(self, d => d.read_temperature().await)
    }

    async fn set_range(&mut self, range: u8) -> ColorResult<()> {
        dispatch!(self, d => d.set_range(range).await)
    }

    async fn poll_switch(&mut self) -> ColorResult<SwitchState> {
        dispatch!(self, d => d.poll_switch().await)
    }
}
