//! SmCube serial colorimeter with a reflective head.
//!
//! Commands and replies are framed `STX … ETX`. Every reply starts with `A`
//! (ack) or `N` plus a two-digit error code (nak).
//!
//! | Command | Reply body | Purpose |
//! |---|---|---|
//! | `ID` | `SMCUBE 1.3` | model and firmware |
//! | `SN` | serial | |
//! | `TS` | tile serial | serial of the white tile in the cradle |
//! | `MX` | nine comma-separated values | factory matrix |
//! | `MDE` / `MDA` / `MDR` | empty | emissive / ambient / reflective |
//! | `ST` | `0` or `1` | trigger switch pressed since last query |
//! | `MS` | `c0,c1,c2,it_us,range` | measure; `N21`/`N22` on overload |
//! | `CD` | `c0,c1,c2,it_us` | dark counts |
//! | `CW` | `c0,c1,c2,it_us` | white tile counts |
//!
//! The device has a trigger button. A background poller queries `ST` and
//! counts presses. A press made after a placement was requested confirms that
//! placement once; earlier presses confirm nothing.

use super::{matrix_rows, parse_floats, DriverContext};
use crate::probe::{ProbeCommand, Signature};
use crate::transport::{AsciiCodec, LinkKind, StatusStyle, Transport};
use async_trait::async_trait;
use colorcal_core::calibration::{
    BlackLevel, CalibrationCondition, CalibrationPolicy, CalibrationRequirement, CalibrationStep,
    CalibrationType, CalibrationUpdate, WhiteReference,
};
use colorcal_core::capabilities::{verify_operations, CapabilityBits, Mode, Operation};
use colorcal_core::data::{
    ConversionProfile, DeviceIdentity, InstrumentType, RangeDirection, RangeOverflow, RawOutcome,
    RawSample,
};
use colorcal_core::driver::{default_requirement, InstrumentDriver, StatusPoll, SwitchState};
use colorcal_core::error::{ColorError, ColorResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wire codec.
pub const CODEC: AsciiCodec = AsciiCodec::stx_etx(StatusStyle::AckNak);

/// Probe fingerprint.
pub const SIGNATURE: Signature = Signature {
    kind: InstrumentType::SmCube,
    link: LinkKind::Serial,
    command: ProbeCommand::Ascii {
        codec: CODEC,
        command: "ID",
    },
    expected_prefix: b"\x02ASMCUBE",
    min_len: 10,
    usb_ids: &[],
};

/// Supported features.
pub const CAPABILITIES: CapabilityBits = CapabilityBits::EMISSIVE
    .union(CapabilityBits::AMBIENT)
    .union(CapabilityBits::REFLECTIVE)
    .union(CapabilityBits::CALIBRATION)
    .union(CapabilityBits::TRIGGER_SWITCH)
    .union(CapabilityBits::SERIAL_NUMBER);

/// Implemented operations.
pub const OPERATIONS: &[Operation] = &[
    Operation::Identify,
    Operation::SetMode,
    Operation::Calibrate,
    Operation::ReadRaw,
    Operation::PollSwitch,
];

const GAINS: [f64; 2] = [1.0, 10.0];
const ERR_TOO_BRIGHT: u16 = 21;
const ERR_TOO_DARK: u16 = 22;
const WHITE_VALIDITY: Duration = Duration::from_secs(8 * 60 * 60);

fn describe_error(code: u16) -> &'static str {
    match code {
        1 => "command not recognised",
        2 => "parameter out of range",
        10 => "lamp failure",
        ERR_TOO_BRIGHT => "overload",
        ERR_TOO_DARK => "underload",
        40 => "not calibrated",
        _ => "unknown error",
    }
}

fn parse_switch(body: &str) -> ColorResult<SwitchState> {
    match body.trim() {
        "0" => Ok(SwitchState::Idle),
        "1" => Ok(SwitchState::Pressed),
        other => Err(ColorError::Misread(format!("switch status '{other}'"))),
    }
}

/// Counts and integration time (µs) from a `CD`/`CW` reply.
fn parse_counts(body: &str, what: &str) -> ColorResult<(Vec<f64>, f64)> {
    let values = parse_floats(body, 4, what)?;
    Ok((values[..3].to_vec(), values[3] / 1e6))
}

/// Driver for the SmCube colorimeter.
#[derive(Debug)]
pub struct SmCube {
    ctx: DriverContext,
    profile: ConversionProfile,
    tile_serial: Option<String>,
    presses: Arc<AtomicU64>,
    /// Condition last requested and the press count when it was requested.
    armed: Option<(CalibrationCondition, u64)>,
}

impl SmCube {
    /// Construct over an open link. No I/O happens until `identify`.
    pub fn new(ctx: DriverContext) -> ColorResult<Self> {
        verify_operations("sm_cube", CAPABILITIES, OPERATIONS)?;
        Ok(Self {
            ctx,
            profile: ConversionProfile::identity("sm_cube"),
            tile_serial: None,
            presses: Arc::new(AtomicU64::new(0)),
            armed: None,
        })
    }

    fn needs_setup(&mut self, kind: CalibrationType) -> CalibrationStep {
        let requirement = self.requirement_for(kind);
        if !matches!(self.armed, Some((armed, _)) if armed == requirement.condition) {
            self.armed = Some((requirement.condition, self.presses.load(Ordering::SeqCst)));
        }
        CalibrationStep::NeedsSetup(requirement)
    }

    async fn query(&self, command: &str) -> ColorResult<String> {
        self.ctx
            .ascii(&CODEC, command)
            .await?
            .into_result(describe_error)
    }
}

#[async_trait]
impl InstrumentDriver for SmCube {
    fn instrument_type(&self) -> InstrumentType {
        InstrumentType::SmCube
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
        match mode {
            Mode::Reflective => CalibrationPolicy {
                available: CalibrationType::DARK | CalibrationType::WHITE_REFERENCE,
                required: CalibrationType::DARK | CalibrationType::WHITE_REFERENCE,
            },
            Mode::Emissive | Mode::Ambient => CalibrationPolicy {
                available: CalibrationType::DARK,
                required: CalibrationType::DARK,
            },
            Mode::EmissiveRefresh => CalibrationPolicy::default(),
        }
    }

    fn requirement_for(&self, kind: CalibrationType) -> CalibrationRequirement {
        let requirement = default_requirement(kind);
        match (&self.tile_serial, kind.contains(CalibrationType::WHITE_REFERENCE)) {
            (Some(tile), true) => requirement.with_identifier(tile.clone()),
            _ => requirement,
        }
    }

    fn calibration_timeout(&self, kind: CalibrationType) -> Option<Duration> {
        kind.intersects(CalibrationType::WHITE_REFERENCE)
            .then_some(WHITE_VALIDITY)
    }

    fn status_poll(&self) -> Option<Arc<dyn StatusPoll>> {
        Some(Arc::new(SmCubeStatus {
            transport: self.ctx.transport.clone(),
            presses: self.presses.clone(),
            lock_timeout: self.ctx.poll_lock_timeout,
            timeout: self.ctx.status_timeout,
        }))
    }

    async fn identify(&mut self) -> ColorResult<DeviceIdentity> {
        let ident = self.query("ID").await?;
        let (model, firmware) = ident
            .split_once(' ')
            .filter(|(m, _)| *m == "SMCUBE")
            .ok_or_else(|| ColorError::UnknownModel {
                reply: ident.clone(),
            })?;
        let (model, firmware) = (model.to_string(), firmware.trim().to_string());
        let serial = self.query("SN").await?;
        let tile = self.query("TS").await?;
        self.tile_serial = (!tile.is_empty()).then_some(tile);

        let matrix = matrix_rows(&parse_floats(&self.query("MX").await?, 9, "matrix")?)?;
        self.profile = ConversionProfile {
            matrix,
            gains: GAINS.to_vec(),
            temperature_coefficients: vec![0.0; 3],
            base_id: format!("{model}-{firmware}"),
        };
        tracing::info!(target: "colorcal::probe", %model, %firmware, %serial, tile = ?self.tile_serial, "SmCube identified");
        Ok(DeviceIdentity {
            model,
            firmware,
            serial,
        })
    }

    async fn set_mode(&mut self, mode: Mode) -> ColorResult<()> {
        let command = match mode {
            Mode::Emissive => "MDE",
            Mode::Ambient => "MDA",
            Mode::Reflective => "MDR",
            Mode::EmissiveRefresh => return Err(ColorError::unsupported(Operation::SetMode)),
        };
        self.query(command).await?;
        Ok(())
    }

    async fn calibrate(
        &mut self,
        pending: CalibrationType,
        condition: CalibrationCondition,
        _mode: Mode,
    ) -> ColorResult<CalibrationStep> {
        if pending.contains(CalibrationType::DARK) {
            if condition != CalibrationCondition::CoverSensor {
                return Ok(self.needs_setup(CalibrationType::DARK));
            }
            let (offsets, integration_time) = parse_counts(&self.query("CD").await?, "dark")?;
            self.armed = None;
            return Ok(CalibrationStep::Completed {
                cleared: CalibrationType::DARK,
                update: CalibrationUpdate {
                    black: Some(BlackLevel::single(integration_time, offsets)),
                    ..Default::default()
                },
            });
        }

        if pending.contains(CalibrationType::WHITE_REFERENCE) {
            if condition != CalibrationCondition::PlaceOnWhiteReference {
                return Ok(self.needs_setup(CalibrationType::WHITE_REFERENCE));
            }
            let (counts, integration_time) = parse_counts(&self.query("CW").await?, "white")?;
            self.armed = None;
            tracing::info!(target: "colorcal::calibration", ?counts, tile = ?self.tile_serial, "SmCube white reference measured");
            return Ok(CalibrationStep::Completed {
                cleared: CalibrationType::WHITE_REFERENCE,
                update: CalibrationUpdate {
                    white: Some(WhiteReference {
                        integration_time,
                        counts,
                    }),
                    ..Default::default()
                },
            });
        }

        Err(ColorError::Internal(format!(
            "sm_cube cannot perform {} calibration",
            pending.label()
        )))
    }

    async fn verify_condition(&mut self, condition: CalibrationCondition) -> ColorResult<bool> {
        let presses = self.presses.load(Ordering::SeqCst);
        match self.armed {
            Some((armed, since)) if armed == condition && presses > since => {
                self.armed = Some((armed, presses));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read_raw(&mut self, _mode: Mode) -> ColorResult<RawOutcome> {
        self.armed = None;
        let reply = self.ctx.ascii_once(&CODEC, "MS").await?;
        // The head auto-ranges, so an overload is always at the extreme.
        match reply.error_code() {
            Some(ERR_TOO_BRIGHT) => {
                return Ok(RawOutcome::OutOfRange(RangeOverflow {
                    direction: RangeDirection::TooBright,
                    at_extreme: true,
                }))
            }
            Some(ERR_TOO_DARK) => {
                return Ok(RawOutcome::OutOfRange(RangeOverflow {
                    direction: RangeDirection::TooDark,
                    at_extreme: true,
                }))
            }
            _ => {}
        }
        let body = reply.into_result(describe_error)?;
        let values = parse_floats(&body, 5, "measurement")?;
        let range = values[4];
        if !(0.0..GAINS.len() as f64).contains(&range) || range.fract() != 0.0 {
            return Err(ColorError::Misread(format!(
                "measurement: bad range code {range}"
            )));
        }
        Ok(RawOutcome::Sample(RawSample::new(
            values[..3].to_vec(),
            values[3] / 1e6,
            range as u8,
        )))
    }

    async fn poll_switch(&mut self) -> ColorResult<SwitchState> {
        let state = parse_switch(&self.query("ST").await?)?;
        if state == SwitchState::Pressed {
            self.presses.fetch_add(1, Ordering::SeqCst);
        }
        Ok(state)
    }
}

/// Background status query for the SmCube trigger switch.
struct SmCubeStatus {
    transport: Transport,
    presses: Arc<AtomicU64>,
    lock_timeout: Duration,
    timeout: Duration,
}

#[async_trait]
impl StatusPoll for SmCubeStatus {
    async fn poll(&self) -> ColorResult<Option<SwitchState>> {
        let Some(mut link) = self.transport.try_lock_for(self.lock_timeout).await else {
            return Ok(None);
        };
        link.drain(crate::transport::DRAIN_WINDOW).await;
        let reply = CODEC.exchange(link.as_mut(), "ST", self.timeout).await?;
        drop(link);
        let state = parse_switch(&reply.into_result(describe_error)?)?;
        if state == SwitchState::Pressed {
            self.presses.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Some(state))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::transport::mock::{MockLink, MockRequest};
    use colorcal_core::abort::AbortFlag;
    use std::sync::atomic::AtomicBool;

    /// Scripted SmCube; `switch` is reported by `ST` and cleared on read.
    pub(crate) fn cube_responder(
        switch: Arc<AtomicBool>,
    ) -> impl FnMut(&MockRequest) -> Option<Vec<u8>> + Send + 'static {
        move |req| {
            let cmd = req.bytes.strip_prefix(b"\x02")?.strip_suffix(b"\x03")?;
            let body = match cmd {
                b"ID" => "ASMCUBE 1.3".to_string(),
                b"SN" => "A10077".to_string(),
                b"TS" => "AWT-5521".to_string(),
                b"MX" => "A1,0,0,0,1,0,0,0,1".to_string(),
                b"MDE" | b"MDA" | b"MDR" => "A".to_string(),
                b"ST" => format!("A{}", u8::from(switch.swap(false, Ordering::SeqCst))),
                b"MS" => "A500,400,300,100000,0".to_string(),
                b"CD" => "A5,5,5,100000".to_string(),
                b"CW" => "A1005,805,605,100000".to_string(),
                _ => "N01".to_string(),
            };
            Some(format!("\x02{body}\x03").into_bytes())
        }
    }

    fn driver(switch: Arc<AtomicBool>) -> SmCube {
        let transport = Transport::new(Box::new(MockLink::new(cube_responder(switch))));
        let ctx = DriverContext::new(transport, &SessionSettings::ephemeral(), AbortFlag::new());
        SmCube::new(ctx).unwrap()
    }

    #[tokio::test]
    async fn test_white_requirement_names_tile() {
        let mut cube = driver(Arc::new(AtomicBool::new(false)));
        let id = cube.identify().await.unwrap();
        assert_eq!(id.model, "SMCUBE");
        assert_eq!(id.firmware, "1.3");

        let step = cube
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
        assert_eq!(req.condition, CalibrationCondition::PlaceOnWhiteReference);
        assert_eq!(req.identifier.as_deref(), Some("WT-5521"));
    }

    #[tokio::test]
    async fn test_dark_before_white() {
        let mut cube = driver(Arc::new(AtomicBool::new(false)));
        let both = CalibrationType::DARK | CalibrationType::WHITE_REFERENCE;
        let step = cube
            .calibrate(both, CalibrationCondition::PlaceOnWhiteReference, Mode::Reflective)
            .await
            .unwrap();
        let CalibrationStep::NeedsSetup(req) = step else {
            panic!("expected setup request");
        };
        assert_eq!(req.condition, CalibrationCondition::CoverSensor);

        let step = cube
            .calibrate(both, CalibrationCondition::CoverSensor, Mode::Reflective)
            .await
            .unwrap();
        let CalibrationStep::Completed { cleared, update } = step else {
            panic!("expected completion");
        };
        assert_eq!(cleared, CalibrationType::DARK);
        assert_eq!(update.black.unwrap().offsets_at(0.1).unwrap(), vec![5.0; 3]);
    }

    #[tokio::test]
    async fn test_press_confirms_requested_placement_once() {
        let switch = Arc::new(AtomicBool::new(false));
        let mut cube = driver(switch.clone());
        let status = cube.status_poll().unwrap();
        let step = cube
            .calibrate(
                CalibrationType::WHITE_REFERENCE,
                CalibrationCondition::None,
                Mode::Reflective,
            )
            .await
            .unwrap();
        assert!(matches!(step, CalibrationStep::NeedsSetup(_)));

        switch.store(true, Ordering::SeqCst);
        assert_eq!(status.poll().await.unwrap(), Some(SwitchState::Pressed));
        assert_eq!(status.poll().await.unwrap(), Some(SwitchState::Idle));

        assert!(!cube
            .verify_condition(CalibrationCondition::CoverSensor)
            .await
            .unwrap());
        assert!(cube
            .verify_condition(CalibrationCondition::PlaceOnWhiteReference)
            .await
            .unwrap());
        assert!(!cube
            .verify_condition(CalibrationCondition::PlaceOnWhiteReference)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_press_before_request_confirms_nothing() {
        let switch = Arc::new(AtomicBool::new(true));
        let mut cube = driver(switch.clone());
        let status = cube.status_poll().unwrap();
        assert_eq!(status.poll().await.unwrap(), Some(SwitchState::Pressed));

        let step = cube
            .calibrate(CalibrationType::DARK, CalibrationCondition::None, Mode::Emissive)
            .await
            .unwrap();
        assert!(matches!(step, CalibrationStep::NeedsSetup(ref r) if r.condition == CalibrationCondition::CoverSensor));
        assert!(!cube
            .verify_condition(CalibrationCondition::CoverSensor)
            .await
            .unwrap());

        // Asking again keeps the original request point.
        cube.calibrate(CalibrationType::DARK, CalibrationCondition::None, Mode::Emissive)
            .await
            .unwrap();
        switch.store(true, Ordering::SeqCst);
        assert_eq!(cube.poll_switch().await.unwrap(), SwitchState::Pressed);
        assert!(cube
            .verify_condition(CalibrationCondition::CoverSensor)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_status_poll_skips_busy_link() {
        let cube = driver(Arc::new(AtomicBool::new(true)));
        let status = cube.status_poll().unwrap();
        let _held = cube.ctx.transport.lock().await.unwrap();
        assert_eq!(status.poll().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_raw_converts_microseconds() {
        let mut cube = driver(Arc::new(AtomicBool::new(false)));
        let RawOutcome::Sample(sample) = cube.read_raw(Mode::Emissive).await.unwrap() else {
            panic!("expected sample");
        };
        assert_eq!(sample.channels, vec![500.0, 400.0, 300.0]);
        assert!((sample.integration_time - 0.1).abs() < 1e-12);
        assert_eq!(sample.range, 0);
    }
}
