//! SpyderX USB colorimeter.
//!
//! Binary protocol over bulk endpoints, see [`crate::transport::binary`].
//! All multi-byte fields are big endian.
//!
//! | Opcode | Request payload | Reply payload |
//! |---|---|---|
//! | `0xC2` | none | 8 byte ASCII serial |
//! | `0xCB` | none | nine `f32` matrix entries, `u32` base calibration id |
//! | `0xD2` | `range:u8, it_ms:u16` | three `u16` counts, flags (bit 0 over, bit 1 under) |
//! | `0xD3` | `range:u8, it_ms:u16` | three `u16` dark counts |
//! | `0xD8` | none | display refresh rate in centihertz |
//!
//! Firmware version comes from vendor control request `0x02`.

use super::DriverContext;
use crate::probe::{ProbeCommand, Signature};
use crate::transport::{BinaryCodec, ControlRequest, LinkKind};
use async_trait::async_trait;
use colorcal_core::calibration::{
    BlackLevel, CalibrationCondition, CalibrationData, CalibrationPolicy, CalibrationStep,
    CalibrationType, CalibrationUpdate,
};
use colorcal_core::capabilities::{verify_operations, CapabilityBits, Mode, Operation};
use colorcal_core::data::{
    ConversionProfile, DeviceIdentity, InstrumentType, RangeDirection, RangeOverflow, RawOutcome,
    RawSample,
};
use colorcal_core::driver::InstrumentDriver;
use colorcal_core::error::{ColorError, ColorResult};
use std::time::Duration;

/// USB vendor id.
pub const VENDOR_ID: u16 = 0x085C;
/// USB product id.
pub const PRODUCT_ID: u16 = 0x0A00;

const OP_SERIAL: u8 = 0xC2;
const OP_FACTORY: u8 = 0xCB;
const OP_MEASURE: u8 = 0xD2;
const OP_DARK: u8 = 0xD3;
const OP_REFRESH: u8 = 0xD8;
const REQ_FIRMWARE: u8 = 0x02;

/// Wire codec.
pub const CODEC: BinaryCodec = BinaryCodec {
    reply_sizes: &[
        (OP_SERIAL, 8),
        (OP_FACTORY, 40),
        (OP_MEASURE, 7),
        (OP_DARK, 6),
        (OP_REFRESH, 2),
    ],
    checksum: true,
};

/// Probe fingerprint.
pub const SIGNATURE: Signature = Signature {
    kind: InstrumentType::SpyderX,
    link: LinkKind::Usb,
    command: ProbeCommand::Binary {
        codec: CODEC,
        opcode: OP_SERIAL,
    },
    expected_prefix: b"",
    min_len: 8,
    usb_ids: &[(VENDOR_ID, PRODUCT_ID)],
};

/// Supported features.
pub const CAPABILITIES: CapabilityBits = CapabilityBits::EMISSIVE
    .union(CapabilityBits::EMISSIVE_REFRESH)
    .union(CapabilityBits::AMBIENT)
    .union(CapabilityBits::CALIBRATION)
    .union(CapabilityBits::SERIAL_NUMBER);

/// Implemented operations.
pub const OPERATIONS: &[Operation] = &[
    Operation::Identify,
    Operation::SetMode,
    Operation::Calibrate,
    Operation::ReadRaw,
];

const GAINS: [f64; 4] = [1.0, 3.7, 16.0, 64.0];
const DEFAULT_RANGE: u8 = 1;
const INTEGRATION_S: f64 = 0.4;
const FLAG_OVER: u8 = 0x01;
const FLAG_UNDER: u8 = 0x02;
const BLACK_VALIDITY: Duration = Duration::from_secs(30 * 60);

fn describe_error(code: u16) -> &'static str {
    match code {
        0x01 => "bad opcode",
        0x02 => "bad payload",
        0x10 => "sensor not ready",
        0x20 => "EEPROM read failed",
        _ => "unknown error",
    }
}

fn be_u16(bytes: &[u8], at: usize) -> f64 {
    f64::from(u16::from_be_bytes([bytes[at], bytes[at + 1]]))
}

fn counts(payload: &[u8]) -> Vec<f64> {
    (0..3).map(|i| be_u16(payload, i * 2)).collect()
}

/// Integration time rounded to whole refresh periods.
fn synced_integration(refresh_hz: Option<f64>) -> f64 {
    match refresh_hz {
        Some(hz) if hz > 0.0 => {
            let periods = (INTEGRATION_S * hz).round().max(1.0);
            periods / hz
        }
        _ => INTEGRATION_S,
    }
}

/// Driver for the SpyderX dongle.
#[derive(Debug)]
pub struct SpyderX {
    ctx: DriverContext,
    profile: ConversionProfile,
    mode: Mode,
    refresh_hz: Option<f64>,
}

impl SpyderX {
    /// Construct over an open link. No I/O happens until `identify`.
    pub fn new(ctx: DriverContext) -> ColorResult<Self> {
        verify_operations("spyder_x", CAPABILITIES, OPERATIONS)?;
        Ok(Self {
            ctx,
            profile: ConversionProfile::identity("spyder_x"),
            mode: Mode::Emissive,
            refresh_hz: None,
        })
    }

    async fn command(&self, opcode: u8, payload: &[u8]) -> ColorResult<Vec<u8>> {
        self.ctx
            .binary(&CODEC, opcode, payload)
            .await?
            .into_result(describe_error)
    }

    fn integration_time(&self) -> f64 {
        if self.mode == Mode::EmissiveRefresh {
            synced_integration(self.refresh_hz)
        } else {
            INTEGRATION_S
        }
    }

    fn timing_payload(&self, integration_time: f64) -> [u8; 3] {
        // At most a few seconds, well inside u16 milliseconds.
        let ms = (integration_time * 1000.0).round().clamp(1.0, f64::from(u16::MAX)) as u16;
        let [hi, lo] = ms.to_be_bytes();
        [DEFAULT_RANGE, hi, lo]
    }

    async fn firmware(&self) -> ColorResult<String> {
        if self.ctx.transport.kind() != LinkKind::Usb {
            return Ok("unknown".to_string());
        }
        let raw = self
            .ctx
            .transport
            .control_in(ControlRequest {
                request: REQ_FIRMWARE,
                value: 0,
                index: 0,
                length: 4,
            })
            .await?;
        match raw.as_slice() {
            [major, minor, build_hi, build_lo] => Ok(format!(
                "{major}.{minor}.{}",
                u16::from_be_bytes([*build_hi, *build_lo])
            )),
            other => Err(ColorError::Misread(format!(
                "firmware version: expected 4 bytes, got {}",
                other.len()
            ))),
        }
    }
}

#[async_trait]
impl InstrumentDriver for SpyderX {
    fn instrument_type(&self) -> InstrumentType {
        InstrumentType::SpyderX
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
            Mode::EmissiveRefresh => CalibrationPolicy {
                available: CalibrationType::DARK | CalibrationType::DISPLAY_REFRESH,
                required: CalibrationType::DARK | CalibrationType::DISPLAY_REFRESH,
            },
            Mode::Emissive | Mode::Ambient => CalibrationPolicy {
                available: CalibrationType::DARK,
                required: CalibrationType::DARK,
            },
            Mode::Reflective => CalibrationPolicy::default(),
        }
    }

    fn calibration_timeout(&self, kind: CalibrationType) -> Option<Duration> {
        kind.intersects(CalibrationType::DARK).then_some(BLACK_VALIDITY)
    }

    fn cache_timeout(&self) -> Option<Duration> {
        Some(BLACK_VALIDITY)
    }

    fn restore(&mut self, data: &CalibrationData) {
        if let Some(hz) = data.refresh_hz.filter(|hz| hz.is_finite() && *hz > 0.0) {
            self.refresh_hz = Some(hz);
        }
    }

    async fn identify(&mut self) -> ColorResult<DeviceIdentity> {
        let raw_serial = self.command(OP_SERIAL, &[]).await?;
        let serial = String::from_utf8_lossy(&raw_serial)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        let firmware = self.firmware().await?;

        let factory = self.command(OP_FACTORY, &[]).await?;
        let values: Vec<f64> = factory[..36]
            .chunks_exact(4)
            .map(|c| f64::from(f32::from_be_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ColorError::Misread("factory matrix holds non-finite values".into()));
        }
        let base = u32::from_be_bytes([factory[36], factory[37], factory[38], factory[39]]);
        self.profile = ConversionProfile {
            matrix: super::matrix_rows(&values)?,
            gains: GAINS.to_vec(),
            temperature_coefficients: vec![0.0; 3],
            base_id: format!("spyderx-{base:08x}"),
        };
        tracing::info!(target: "colorcal::probe", %serial, %firmware, base_id = %self.profile.base_id, "SpyderX identified");
        Ok(DeviceIdentity {
            model: "SpyderX".to_string(),
            firmware,
            serial,
        })
    }

    async fn set_mode(&mut self, mode: Mode) -> ColorResult<()> {
        if !CAPABILITIES.supports_mode(mode) {
            return Err(ColorError::unsupported(Operation::SetMode));
        }
        self.mode = mode;
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
            let it = self.integration_time();
            let payload = self.command(OP_DARK, &self.timing_payload(it)).await?;
            let offsets = counts(&payload);
            tracing::info!(target: "colorcal::calibration", ?offsets, integration_time = it, "SpyderX black level measured");
            return Ok(CalibrationStep::Completed {
                cleared: CalibrationType::DARK,
                update: CalibrationUpdate {
                    black: Some(BlackLevel::single(it, offsets)),
                    ..Default::default()
                },
            });
        }

        if pending.contains(CalibrationType::DISPLAY_REFRESH) {
            let payload = self.command(OP_REFRESH, &[]).await?;
            let hz = be_u16(&payload, 0) / 100.0;
            if hz <= 0.0 {
                return Err(ColorError::Misread("display refresh rate is zero".into()));
            }
            self.refresh_hz = Some(hz);
            tracing::debug!(target: "colorcal::calibration", refresh_hz = hz, "SpyderX refresh rate measured");
            return Ok(CalibrationStep::Completed {
                cleared: CalibrationType::DISPLAY_REFRESH,
                update: CalibrationUpdate {
                    refresh_hz: Some(hz),
                    integration_time: Some(synced_integration(Some(hz))),
                    ..Default::default()
                },
            });
        }

        Err(ColorError::Internal(format!(
            "spyder_x cannot perform {} calibration",
            pending.label()
        )))
    }

    async fn read_raw(&mut self, _mode: Mode) -> ColorResult<RawOutcome> {
        let it = self.integration_time();
        let reply = self
            .ctx
            .binary_once(&CODEC, OP_MEASURE, &self.timing_payload(it))
            .await?;
        let payload = reply.into_result(describe_error)?;
        let flags = payload[6];
        let max_range = (GAINS.len() - 1) as u8;
        if flags & FLAG_OVER != 0 {
            return Ok(RawOutcome::OutOfRange(RangeOverflow {
                direction: RangeDirection::TooBright,
                at_extreme: DEFAULT_RANGE == 0,
            }));
        }
        if flags & FLAG_UNDER != 0 {
            return Ok(RawOutcome::OutOfRange(RangeOverflow {
                direction: RangeDirection::TooDark,
                at_extreme: DEFAULT_RANGE >= max_range,
            }));
        }
        Ok(RawOutcome::Sample(RawSample::new(
            counts(&payload),
            it,
            DEFAULT_RANGE,
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::transport::binary::{decode_request, encode_reply};
    use crate::transport::mock::{MockLink, MockRequest};
    use crate::transport::Transport;
    use colorcal_core::abort::AbortFlag;

    /// Scripted SpyderX answering every opcode with fixed data.
    pub(crate) fn spyder_responder() -> impl FnMut(&MockRequest) -> Option<Vec<u8>> + Send + 'static
    {
        |req| {
            let (opcode, nonce, _payload) = decode_request(&req.bytes)?;
            let payload: Vec<u8> = match opcode {
                OP_SERIAL => b"SX123456".to_vec(),
                OP_FACTORY => {
                    let mut p = Vec::new();
                    for v in [2.0f32, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0] {
                        p.extend_from_slice(&v.to_be_bytes());
                    }
                    p.extend_from_slice(&0x00C0_FFEEu32.to_be_bytes());
                    p
                }
                OP_MEASURE => vec![0x03, 0xE8, 0x01, 0xF4, 0x00, 0xC8, 0x00],
                OP_DARK => vec![0x00, 0x0A, 0x00, 0x0B, 0x00, 0x0C],
                OP_REFRESH => 6000u16.to_be_bytes().to_vec(),
                _ => return Some(encode_reply(nonce, 0x01, &[], true)),
            };
            Some(encode_reply(nonce, 0, &payload, true))
        }
    }

    fn driver() -> SpyderX {
        let link = MockLink::new(spyder_responder())
            .usb(VENDOR_ID, PRODUCT_ID)
            .with_control(|req| (req.request == REQ_FIRMWARE).then(|| vec![1, 4, 0x01, 0x02]));
        let transport = Transport::new(Box::new(link));
        let ctx = DriverContext::new(transport, &SessionSettings::ephemeral(), AbortFlag::new());
        SpyderX::new(ctx).unwrap()
    }

    #[tokio::test]
    async fn test_identify_reads_factory_matrix() {
        let mut sx = driver();
        let id = sx.identify().await.unwrap();
        assert_eq!(id.serial, "SX123456");
        assert_eq!(id.firmware, "1.4.258");
        assert_eq!(sx.conversion().matrix[1], vec![0.0, 2.0, 0.0]);
        assert_eq!(sx.conversion().base_id, "spyderx-00c0ffee");
    }

    #[tokio::test]
    async fn test_read_raw_decodes_counts() {
        let mut sx = driver();
        let RawOutcome::Sample(sample) = sx.read_raw(Mode::Emissive).await.unwrap() else {
            panic!("expected sample");
        };
        assert_eq!(sample.channels, vec![1000.0, 500.0, 200.0]);
        assert_eq!(sample.range, DEFAULT_RANGE);
    }

    #[tokio::test]
    async fn test_refresh_syncs_integration_time() {
        let mut sx = driver();
        sx.set_mode(Mode::EmissiveRefresh).await.unwrap();
        let step = sx
            .calibrate(
                CalibrationType::DISPLAY_REFRESH,
                CalibrationCondition::None,
                Mode::EmissiveRefresh,
            )
            .await
            .unwrap();
        let CalibrationStep::Completed { update, .. } = step else {
            panic!("expected completion");
        };
        assert_eq!(update.refresh_hz, Some(60.0));
        // 0.4 s at 60 Hz is exactly 24 periods.
        assert!((sx.integration_time() - 0.4).abs() < 1e-9);
        assert!((synced_integration(Some(50.5)) - 20.0 / 50.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_restored_refresh_rate_syncs_integration_time() {
        let mut sx = driver();
        sx.restore(&CalibrationData {
            refresh_hz: Some(50.5),
            ..Default::default()
        });
        sx.set_mode(Mode::EmissiveRefresh).await.unwrap();
        assert!((sx.integration_time() - 20.0 / 50.5).abs() < 1e-9);

        sx.restore(&CalibrationData::default());
        assert_eq!(sx.refresh_hz, Some(50.5));
    }

    #[tokio::test]
    async fn test_dark_requires_cover() {
        let mut sx = driver();
        let step = sx
            .calibrate(CalibrationType::DARK, CalibrationCondition::None, Mode::Emissive)
            .await
            .unwrap();
        assert!(matches!(step, CalibrationStep::NeedsSetup(ref r) if r.condition == CalibrationCondition::CoverSensor));
        assert!(sx.set_mode(Mode::Reflective).await.is_err());
    }
}
