//! KiSensor serial colorimeter.
//!
//! Protocol overview:
//! - Format: ASCII commands, CR terminated both ways
//! - Baud: 9600 to 921600, 8N1
//! - Errors: the reply starts with `<NN>`, a decimal error code
//! - Readings: `R<ms>` returns `c0 c1 c2 range temperature`
//!
//! | Command | Reply | Purpose |
//! |---|---|---|
//! | `V` | `KS-3 V2.04` | model and firmware |
//! | `S` | serial number | |
//! | `M` | nine floats | factory matrix, row major |
//! | `K` | three floats | temperature coefficients |
//! | `T` | float | sensor temperature in °C |
//! | `A<n>` | empty | select gain range 0..=3 |
//! | `ME` / `MA` | empty | emissive / ambient head |
//! | `R<ms>` | five values | integrate for `ms` and report counts |
//! | `D<ms>` | three floats | dark counts with the shutter closed |
//!
//! Overload is reported as `<21>` (too bright) and `<22>` (too dark).
//!
//! The black level drifts with integration time, so dark calibration measures
//! two points (0.1 s and 1.0 s) and the engine interpolates between them.
//! Integration time is chosen against the target, so it refuses to run while
//! the sensor is still covered from the dark step.

use super::{matrix_rows, parse_floats, DriverContext};
use crate::probe::{ProbeCommand, Signature};
use crate::transport::{AsciiCodec, LinkKind, StatusStyle};
use async_trait::async_trait;
use colorcal_core::calibration::{
    BlackLevel, BlackPoint, CalibrationCondition, CalibrationData, CalibrationPolicy,
    CalibrationRequirement, CalibrationStep, CalibrationType, CalibrationUpdate,
};
use colorcal_core::capabilities::{verify_operations, CapabilityBits, Mode, Operation};
use colorcal_core::data::{
    ConversionProfile, DeviceIdentity, InstrumentType, RangeDirection, RangeOverflow, RawOutcome,
    RawSample,
};
use colorcal_core::driver::{default_requirement, InstrumentDriver};
use colorcal_core::error::{ColorError, ColorResult};
use std::time::Duration;

/// Wire codec.
pub const CODEC: AsciiCodec = AsciiCodec::carriage_return(StatusStyle::AngleCode);

/// Probe fingerprint.
pub const SIGNATURE: Signature = Signature {
    kind: InstrumentType::KiSensor,
    link: LinkKind::Serial,
    command: ProbeCommand::Ascii {
        codec: CODEC,
        command: "V",
    },
    expected_prefix: b"KS-",
    min_len: 6,
    usb_ids: &[],
};

/// Supported features.
pub const CAPABILITIES: CapabilityBits = CapabilityBits::EMISSIVE
    .union(CapabilityBits::AMBIENT)
    .union(CapabilityBits::CALIBRATION)
    .union(CapabilityBits::TEMPERATURE)
    .union(CapabilityBits::RANGE_CONTROL)
    .union(CapabilityBits::SERIAL_NUMBER);

/// Implemented operations.
pub const OPERATIONS: &[Operation] = &[
    Operation::Identify,
    Operation::SetMode,
    Operation::Calibrate,
    Operation::ReadRaw,
    Operation::ReadTemperature,
    Operation::SetRange,
];

const GAINS: [f64; 4] = [1.0, 4.0, 16.0, 64.0];
const ERR_TOO_BRIGHT: u16 = 21;
const ERR_TOO_DARK: u16 = 22;
const DARK_SHORT_S: f64 = 0.1;
const DARK_LONG_S: f64 = 1.0;
const DEFAULT_INTEGRATION_S: f64 = 0.4;
const MIN_INTEGRATION_S: f64 = 0.05;
const MAX_INTEGRATION_S: f64 = 2.0;
const TARGET_COUNTS: f64 = 30_000.0;
const COVERED_COUNTS: f64 = 50.0;
const BLACK_VALIDITY: Duration = Duration::from_secs(30 * 60);

fn describe_error(code: u16) -> &'static str {
    match code {
        1 => "unknown command",
        2 => "bad parameter",
        3 => "EEPROM checksum error",
        ERR_TOO_BRIGHT => "overload",
        ERR_TOO_DARK => "underload",
        30 => "sensor not calibrated",
        _ => "unknown error",
    }
}

fn millis(seconds: f64) -> u32 {
    // Integration times are clamped to [0.05, 2.0] s before they get here.
    (seconds * 1000.0).round().clamp(1.0, 60_000.0) as u32
}

/// Driver for the KiSensor colorimeter.
#[derive(Debug)]
pub struct KiSensor {
    ctx: DriverContext,
    profile: ConversionProfile,
    range: u8,
    integration_time: f64,
}

impl KiSensor {
    /// Construct over an open link. No I/O happens until `identify`.
    pub fn new(ctx: DriverContext) -> ColorResult<Self> {
        verify_operations("ki_sensor", CAPABILITIES, OPERATIONS)?;
        Ok(Self {
            ctx,
            profile: ConversionProfile::identity("ki_sensor"),
            range: 1,
            integration_time: DEFAULT_INTEGRATION_S,
        })
    }

    async fn query(&self, command: &str) -> ColorResult<String> {
        self.ctx
            .ascii(&CODEC, command)
            .await?
            .into_result(describe_error)
    }

    fn overflow(&self, code: u16) -> Option<RangeOverflow> {
        let max_range = (GAINS.len() - 1) as u8;
        match code {
            ERR_TOO_BRIGHT => Some(RangeOverflow {
                direction: RangeDirection::TooBright,
                at_extreme: self.range == 0,
            }),
            ERR_TOO_DARK => Some(RangeOverflow {
                direction: RangeDirection::TooDark,
                at_extreme: self.range >= max_range,
            }),
            _ => None,
        }
    }

    /// One integration, single exchange.
    async fn integrate(&self, seconds: f64) -> ColorResult<RawOutcome> {
        let reply = self
            .ctx
            .ascii_once(&CODEC, &format!("R{}", millis(seconds)))
            .await?;
        if let Some(overflow) = reply.error_code().and_then(|code| self.overflow(code)) {
            return Ok(RawOutcome::OutOfRange(overflow));
        }
        let body = reply.into_result(describe_error)?;
        let values = parse_floats(&body, 5, "reading")?;
        let range = values[3];
        if !(0.0..GAINS.len() as f64).contains(&range) || range.fract() != 0.0 {
            return Err(ColorError::Misread(format!("reading: bad range code {range}")));
        }
        Ok(RawOutcome::Sample(
            RawSample::new(values[..3].to_vec(), seconds, range as u8).with_temperature(values[4]),
        ))
    }

    async fn dark_point(&self, seconds: f64) -> ColorResult<BlackPoint> {
        let body = self.query(&format!("D{}", millis(seconds))).await?;
        Ok(BlackPoint {
            integration_time: seconds,
            offsets: parse_floats(&body, 3, "dark")?,
        })
    }
}

#[async_trait]
impl InstrumentDriver for KiSensor {
    fn instrument_type(&self) -> InstrumentType {
        InstrumentType::KiSensor
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
            Mode::Emissive | Mode::Ambient => CalibrationPolicy {
                available: CalibrationType::DARK | CalibrationType::INTEGRATION_TIME,
                required: CalibrationType::DARK | CalibrationType::INTEGRATION_TIME,
            },
            _ => CalibrationPolicy::default(),
        }
    }

    fn requirement_for(&self, kind: CalibrationType) -> CalibrationRequirement {
        if kind == CalibrationType::INTEGRATION_TIME {
            CalibrationRequirement::new(kind, CalibrationCondition::PlaceOnDisplay)
        } else {
            default_requirement(kind)
        }
    }

    fn calibration_timeout(&self, kind: CalibrationType) -> Option<Duration> {
        kind.intersects(CalibrationType::DARK).then_some(BLACK_VALIDITY)
    }

    fn restore(&mut self, data: &CalibrationData) {
        if let Some(seconds) = data.integration_time.filter(|s| s.is_finite() && *s > 0.0) {
            self.integration_time = seconds.clamp(MIN_INTEGRATION_S, MAX_INTEGRATION_S);
        }
    }

    fn cache_timeout(&self) -> Option<Duration> {
        Some(BLACK_VALIDITY)
    }

    async fn identify(&mut self) -> ColorResult<DeviceIdentity> {
        let version = self.query("V").await?;
        let mut parts = version.split_whitespace();
        let model = parts
            .next()
            .filter(|m| m.starts_with("KS-"))
            .ok_or_else(|| ColorError::UnknownModel {
                reply: version.clone(),
            })?
            .to_string();
        let firmware = parts
            .next()
            .map(|f| f.trim_start_matches(['V', 'v']).to_string())
            .unwrap_or_default();
        let serial = self.query("S").await?;

        let matrix = matrix_rows(&parse_floats(&self.query("M").await?, 9, "matrix")?)?;
        let coefficients = parse_floats(&self.query("K").await?, 3, "coefficients")?;
        self.profile = ConversionProfile {
            matrix,
            gains: GAINS.to_vec(),
            temperature_coefficients: coefficients,
            base_id: model.clone(),
        };

        tracing::info!(target: "colorcal::probe", %model, %firmware, %serial, "KiSensor identified");
        Ok(DeviceIdentity {
            model,
            firmware,
            serial,
        })
    }

    async fn set_mode(&mut self, mode: Mode) -> ColorResult<()> {
        let command = match mode {
            Mode::Emissive => "ME",
            Mode::Ambient => "MA",
            _ => return Err(ColorError::unsupported(Operation::SetMode)),
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
                return Ok(CalibrationStep::NeedsSetup(
                    self.requirement_for(CalibrationType::DARK),
                ));
            }
            let short = self.dark_point(DARK_SHORT_S).await?;
            let long = self.dark_point(DARK_LONG_S).await?;
            let temperature = self.read_temperature().await?;
            tracing::info!(
                target: "colorcal::calibration",
                short = ?short.offsets,
                long = ?long.offsets,
                temperature,
                "KiSensor black level measured"
            );
            return Ok(CalibrationStep::Completed {
                cleared: CalibrationType::DARK,
                update: CalibrationUpdate {
                    black: Some(BlackLevel::pair(short, long)),
                    temperature: Some(temperature),
                    ..Default::default()
                },
            });
        }

        if pending.contains(CalibrationType::INTEGRATION_TIME) {
            if condition == CalibrationCondition::CoverSensor {
                return Ok(CalibrationStep::NeedsSetup(
                    self.requirement_for(CalibrationType::INTEGRATION_TIME),
                ));
            }
            let probe_time = DARK_SHORT_S;
            let chosen = match self.integrate(probe_time).await? {
                RawOutcome::OutOfRange(RangeOverflow {
                    direction: RangeDirection::TooBright,
                    ..
                }) => MIN_INTEGRATION_S,
                RawOutcome::OutOfRange(_) => MAX_INTEGRATION_S,
                RawOutcome::Sample(sample) => {
                    let peak = sample.channels.iter().copied().fold(0.0_f64, f64::max);
                    if peak <= 0.0 {
                        MAX_INTEGRATION_S
                    } else {
                        (probe_time * TARGET_COUNTS / peak).clamp(MIN_INTEGRATION_S, MAX_INTEGRATION_S)
                    }
                }
            };
            self.integration_time = chosen;
            tracing::debug!(target: "colorcal::calibration", integration_time = chosen, "KiSensor integration time selected");
            return Ok(CalibrationStep::Completed {
                cleared: CalibrationType::INTEGRATION_TIME,
                update: CalibrationUpdate {
                    integration_time: Some(chosen),
                    ..Default::default()
                },
            });
        }

        Err(ColorError::Internal(format!(
            "ki_sensor cannot perform {} calibration",
            pending.label()
        )))
    }

    async fn verify_condition(&mut self, condition: CalibrationCondition) -> ColorResult<bool> {
        let wants_dark = match condition {
            CalibrationCondition::CoverSensor => true,
            CalibrationCondition::PlaceOnDisplay => false,
            _ => return Ok(false),
        };
        let dark = match self.integrate(DARK_SHORT_S).await {
            Ok(RawOutcome::OutOfRange(overflow)) => {
                overflow.direction == RangeDirection::TooDark
            }
            Ok(RawOutcome::Sample(sample)) => {
                sample.channels.iter().all(|c| *c < COVERED_COUNTS)
            }
            Err(err) if err.is_transient() => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(dark == wants_dark)
    }

    async fn read_raw(&mut self, _mode: Mode) -> ColorResult<RawOutcome> {
        self.integrate(self.integration_time).await
    }

    async fn read_temperature(&mut self) -> ColorResult<f64> {
        let body = self.query("T").await?;
        Ok(parse_floats(&body, 1, "temperature")?[0])
    }

    async fn set_range(&mut self, range: u8) -> ColorResult<()> {
        if usize::from(range) >= GAINS.len() {
            return Err(ColorError::Configuration(format!(
                "ki_sensor range must be 0..={}, got {range}",
                GAINS.len() - 1
            )));
        }
        self.query(&format!("A{range}")).await?;
        self.range = range;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::transport::mock::{MockLink, MockRequest};
    use crate::transport::Transport;
    use colorcal_core::abort::AbortFlag;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Scripted KiSensor. `covered` switches the dark replies.
    pub(crate) fn ki_responder(
        covered: Arc<AtomicBool>,
    ) -> impl FnMut(&MockRequest) -> Option<Vec<u8>> + Send + 'static {
        move |req| {
            let cmd = std::str::from_utf8(&req.bytes).ok()?.trim_end_matches('\r');
            let reply = match cmd {
                "V" => "KS-3 V2.04".to_string(),
                "S" => "KS0042".to_string(),
                "M" => "1 0 0 0 1 0 0 0 1".to_string(),
                "K" => "0.001 0.002 0.003".to_string(),
                "T" => "25.5".to_string(),
                "ME" | "MA" | "A0" | "A1" | "A2" | "A3" => String::new(),
                "D100" => "10 11 12".to_string(),
                "D1000" => "19 20 21".to_string(),
                c if c.starts_with('R') => {
                    if covered.load(Ordering::SeqCst) {
                        "<22>".to_string()
                    } else {
                        "3000 2000 1000 1 25.5".to_string()
                    }
                }
                _ => "<01>".to_string(),
            };
            Some(format!("{reply}\r").into_bytes())
        }
    }

    fn driver(covered: Arc<AtomicBool>) -> KiSensor {
        let transport = Transport::new(Box::new(MockLink::new(ki_responder(covered))));
        let ctx = DriverContext::new(transport, &SessionSettings::ephemeral(), AbortFlag::new());
        KiSensor::new(ctx).unwrap()
    }

    #[tokio::test]
    async fn test_identify_reads_factory_data() {
        let mut ks = driver(Arc::new(AtomicBool::new(false)));
        let id = ks.identify().await.unwrap();
        assert_eq!(id.model, "KS-3");
        assert_eq!(id.firmware, "2.04");
        assert_eq!(id.serial, "KS0042");
        assert_eq!(ks.conversion().temperature_coefficients, vec![0.001, 0.002, 0.003]);
        assert_eq!(ks.conversion().gains.len(), 4);
    }

    #[tokio::test]
    async fn test_dark_needs_cover_then_measures_two_points() {
        let covered = Arc::new(AtomicBool::new(false));
        let mut ks = driver(covered.clone());
        let step = ks
            .calibrate(CalibrationType::DARK, CalibrationCondition::None, Mode::Emissive)
            .await
            .unwrap();
        match step {
            CalibrationStep::NeedsSetup(req) => {
                assert_eq!(req.condition, CalibrationCondition::CoverSensor)
            }
            other => panic!("unexpected {other:?}"),
        }

        covered.store(true, Ordering::SeqCst);
        assert!(ks
            .verify_condition(CalibrationCondition::CoverSensor)
            .await
            .unwrap());
        let step = ks
            .calibrate(
                CalibrationType::DARK,
                CalibrationCondition::CoverSensor,
                Mode::Emissive,
            )
            .await
            .unwrap();
        let CalibrationStep::Completed { cleared, update } = step else {
            panic!("expected completion");
        };
        assert_eq!(cleared, CalibrationType::DARK);
        let black = update.black.unwrap();
        assert_eq!(black.points().len(), 2);
        let mid = black.offsets_at(0.55).unwrap();
        for (got, want) in mid.iter().zip([14.5, 15.5, 16.5]) {
            assert!((got - want).abs() < 1e-9, "{got} != {want}");
        }
        assert_eq!(update.temperature, Some(25.5));
    }

    #[tokio::test]
    async fn test_integration_time_targets_counts() {
        let mut ks = driver(Arc::new(AtomicBool::new(false)));
        let step = ks
            .calibrate(
                CalibrationType::INTEGRATION_TIME,
                CalibrationCondition::None,
                Mode::Emissive,
            )
            .await
            .unwrap();
        let CalibrationStep::Completed { update, .. } = step else {
            panic!("expected completion");
        };
        // Peak 3000 counts in 0.1 s scales to 1.0 s for 30000 counts.
        assert!((update.integration_time.unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_integration_time_waits_for_uncovered_sensor() {
        let covered = Arc::new(AtomicBool::new(true));
        let mut ks = driver(covered.clone());
        let step = ks
            .calibrate(
                CalibrationType::INTEGRATION_TIME,
                CalibrationCondition::CoverSensor,
                Mode::Emissive,
            )
            .await
            .unwrap();
        match step {
            CalibrationStep::NeedsSetup(req) => {
                assert_eq!(req.kind, CalibrationType::INTEGRATION_TIME);
                assert_eq!(req.condition, CalibrationCondition::PlaceOnDisplay);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!ks
            .verify_condition(CalibrationCondition::PlaceOnDisplay)
            .await
            .unwrap());

        covered.store(false, Ordering::SeqCst);
        assert!(ks
            .verify_condition(CalibrationCondition::PlaceOnDisplay)
            .await
            .unwrap());
        assert!(!ks
            .verify_condition(CalibrationCondition::CoverSensor)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_restore_reseeds_integration_time() {
        let mut ks = driver(Arc::new(AtomicBool::new(false)));
        ks.restore(&CalibrationData {
            integration_time: Some(1.0),
            ..Default::default()
        });
        let RawOutcome::Sample(sample) = ks.read_raw(Mode::Emissive).await.unwrap() else {
            panic!("expected a sample");
        };
        assert!((sample.integration_time - 1.0).abs() < 1e-9);

        ks.restore(&CalibrationData {
            integration_time: Some(30.0),
            ..Default::default()
        });
        assert!((ks.integration_time - MAX_INTEGRATION_S).abs() < 1e-9);
        ks.restore(&CalibrationData::default());
        assert!((ks.integration_time - MAX_INTEGRATION_S).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_underload_is_out_of_range_at_extreme() {
        let mut ks = driver(Arc::new(AtomicBool::new(true)));
        ks.set_range(3).await.unwrap();
        let outcome = ks.read_raw(Mode::Emissive).await.unwrap();
        assert_eq!(
            outcome,
            RawOutcome::OutOfRange(RangeOverflow {
                direction: RangeDirection::TooDark,
                at_extreme: true
            })
        );
    }

    #[tokio::test]
    async fn test_rejects_unsupported_mode_and_range() {
        let mut ks = driver(Arc::new(AtomicBool::new(false)));
        let err = ks.set_mode(Mode::Reflective).await.unwrap_err();
        assert!(matches!(err, ColorError::Unsupported { .. }));
        let err = ks.set_range(9).await.unwrap_err();
        assert!(matches!(err, ColorError::Configuration(_)));
    }
}
