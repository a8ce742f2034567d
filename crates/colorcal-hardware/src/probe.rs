//! Auto-probe: find out which instrument family sits on a link.
//!
//! Serial links are scanned baud by baud. At each rate every serial family's
//! harmless identification command is sent with a short timeout and the raw
//! reply is matched against every known [`Signature`]. The first reply that
//! matches exactly one family wins. USB links skip the baud scan: the
//! vendor/product id narrows the candidates and the family's binary ID
//! command confirms.
//!
//! Silent families are tolerated. The abort flag is checked between attempts
//! and the whole scan is bounded by the probe budget.
//!
//! # Example
//!
//! ```rust,ignore
//! let abort = AbortFlag::new();
//! let kind = probe("/dev/ttyUSB0", &settings, &abort).await?;
//! println!("found {kind}");
//! ```

use crate::config::{ProbeSettings, SessionSettings};
use crate::drivers::{ki_sensor, sm_cube, spyder_x};
use crate::port_resolver::{resolve_port, DevicePath};
use crate::transport::{AsciiCodec, BinaryCodec, Link, LinkKind, DRAIN_WINDOW};
use async_trait::async_trait;
use colorcal_core::abort::AbortFlag;
use colorcal_core::data::InstrumentType;
use colorcal_core::error::{ProbeError, TransportError};
use std::time::Duration;
use tokio::time::Instant;

/// Identification command of one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeCommand {
    /// ASCII command; the raw reply bytes, framing included, are matched.
    Ascii {
        /// Family codec.
        codec: AsciiCodec,
        /// Command text.
        command: &'static str,
    },
    /// Binary opcode without payload; the verified reply payload is matched.
    Binary {
        /// Family codec.
        codec: BinaryCodec,
        /// Opcode.
        opcode: u8,
    },
}

/// How a family answers its identification command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// Family this signature identifies.
    pub kind: InstrumentType,
    /// Link the family is attached through.
    pub link: LinkKind,
    /// Identification command.
    pub command: ProbeCommand,
    /// Bytes the reply must start with.
    pub expected_prefix: &'static [u8],
    /// Shortest acceptable reply.
    pub min_len: usize,
    /// USB vendor/product ids of the family.
    pub usb_ids: &'static [(u16, u16)],
}

impl Signature {
    /// Whether `reply` identifies this family.
    pub fn matches(&self, reply: &[u8]) -> bool {
        reply.len() >= self.min_len && reply.starts_with(self.expected_prefix)
    }

    /// Whether this family uses the given USB ids.
    pub fn has_usb_ids(&self, ids: (u16, u16)) -> bool {
        self.usb_ids.contains(&ids)
    }
}

/// Every hardware family, in probe order.
pub const SIGNATURES: [Signature; 3] = [
    ki_sensor::SIGNATURE,
    sm_cube::SIGNATURE,
    spyder_x::SIGNATURE,
];

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Send one identification command and return the bytes to match.
async fn attempt(
    link: &mut dyn Link,
    signature: &Signature,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    link.drain(DRAIN_WINDOW).await;
    match signature.command {
        ProbeCommand::Ascii { codec, command } => {
            let deadline = Instant::now() + timeout;
            tokio::time::timeout(timeout, link.write_all(&codec.encode(command)))
                .await
                .map_err(|_| crate::transport::timeout_error(timeout))??;
            codec.read_reply(link, deadline, timeout).await
        }
        ProbeCommand::Binary { codec, opcode } => {
            let reply = codec.exchange(link, opcode, &[], timeout).await?;
            if reply.status != 0 {
                return Err(TransportError::Malformed(format!(
                    "identification refused with status {}",
                    reply.status
                )));
            }
            Ok(reply.payload)
        }
    }
}

/// Families among `candidates` whose signature matches `reply`.
fn matching<'a>(candidates: &'a [&'a Signature], reply: &[u8]) -> Vec<&'a Signature> {
    candidates
        .iter()
        .copied()
        .filter(|s| s.matches(reply))
        .collect()
}

fn printable(reply: &[u8]) -> String {
    String::from_utf8_lossy(reply)
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}

/// Identify the family on an open link.
///
/// A serial link is left at the baud rate the family answered on.
pub async fn probe_link(
    link: &mut dyn Link,
    settings: &ProbeSettings,
    abort: &AbortFlag,
) -> Result<InstrumentType, ProbeError> {
    let started = Instant::now();
    match link.kind() {
        LinkKind::Serial => probe_serial(link, settings, abort, started).await,
        LinkKind::Usb => probe_usb(link, settings, abort, started).await,
        LinkKind::Memory => Err(ProbeError::NoResponse { elapsed_ms: 0 }),
    }
}

/// Remaining time for one attempt, or the budget error.
fn attempt_window(
    settings: &ProbeSettings,
    abort: &AbortFlag,
    started: Instant,
) -> Result<Duration, ProbeError> {
    if abort.is_triggered() {
        return Err(ProbeError::Aborted);
    }
    let remaining = settings.budget().saturating_sub(started.elapsed());
    if remaining.is_zero() {
        return Err(ProbeError::NoResponse {
            elapsed_ms: elapsed_ms(started),
        });
    }
    Ok(settings.attempt_timeout().min(remaining))
}

async fn probe_serial(
    link: &mut dyn Link,
    settings: &ProbeSettings,
    abort: &AbortFlag,
    started: Instant,
) -> Result<InstrumentType, ProbeError> {
    let candidates: Vec<&Signature> = SIGNATURES
        .iter()
        .filter(|s| s.link == LinkKind::Serial)
        .collect();
    let mut unmatched: Option<Vec<u8>> = None;

    for &baud in &settings.baud_rates {
        if abort.is_triggered() {
            return Err(ProbeError::Aborted);
        }
        if let Err(e) = link.set_baud_rate(baud).await {
            tracing::warn!(target: "colorcal::probe", baud, error = %e, "Cannot switch baud rate");
            continue;
        }
        for signature in &candidates {
            let timeout = attempt_window(settings, abort, started)?;
            let reply = match attempt(link, signature, timeout).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::trace!(target: "colorcal::probe", baud, family = %signature.kind, error = %e, "No answer");
                    continue;
                }
            };
            match matching(&candidates, &reply).as_slice() {
                [found] => {
                    tracing::info!(
                        target: "colorcal::probe",
                        baud,
                        family = %found.kind,
                        elapsed_ms = elapsed_ms(started),
                        "Instrument identified"
                    );
                    return Ok(found.kind);
                }
                [] => {
                    tracing::debug!(target: "colorcal::probe", baud, reply = %printable(&reply), "Reply matches no family");
                    unmatched = Some(reply);
                }
                several => {
                    let families: Vec<String> = several.iter().map(|s| s.kind.to_string()).collect();
                    tracing::warn!(target: "colorcal::probe", baud, ?families, "Ambiguous reply, continuing");
                }
            }
        }
    }

    match unmatched {
        Some(reply) => Err(ProbeError::UnknownModel(printable(&reply))),
        None => Err(ProbeError::NoResponse {
            elapsed_ms: elapsed_ms(started),
        }),
    }
}

async fn probe_usb(
    link: &mut dyn Link,
    settings: &ProbeSettings,
    abort: &AbortFlag,
    started: Instant,
) -> Result<InstrumentType, ProbeError> {
    let ids = link.usb_ids();
    let candidates: Vec<&Signature> = SIGNATURES
        .iter()
        .filter(|s| s.link == LinkKind::Usb)
        .filter(|s| ids.map_or(true, |ids| s.has_usb_ids(ids)))
        .collect();
    if candidates.is_empty() {
        let described = ids
            .map(|(vid, pid)| format!("usb {vid:04x}:{pid:04x}"))
            .unwrap_or_else(|| "usb device".to_string());
        return Err(ProbeError::UnknownModel(described));
    }

    let mut unmatched: Option<Vec<u8>> = None;
    for signature in &candidates {
        let timeout = attempt_window(settings, abort, started)?;
        match attempt(link, signature, timeout).await {
            Ok(reply) if signature.matches(&reply) => {
                tracing::info!(target: "colorcal::probe", family = %signature.kind, "USB instrument confirmed");
                return Ok(signature.kind);
            }
            Ok(reply) => unmatched = Some(reply),
            Err(e) => {
                tracing::debug!(target: "colorcal::probe", family = %signature.kind, error = %e, "USB identification failed");
            }
        }
    }
    match unmatched {
        Some(reply) => Err(ProbeError::UnknownModel(printable(&reply))),
        None => Err(ProbeError::NoResponse {
            elapsed_ms: elapsed_ms(started),
        }),
    }
}

/// Opens links for device paths.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Open `path`. Serial links start at the first configured baud rate.
    async fn open(
        &self,
        path: &DevicePath,
        settings: &SessionSettings,
    ) -> Result<Box<dyn Link>, ProbeError>;
}

/// Opens real serial ports and USB devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

fn open_error(path: &DevicePath, reason: impl ToString) -> ProbeError {
    ProbeError::Open {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl LinkOpener for SystemOpener {
    async fn open(
        &self,
        path: &DevicePath,
        settings: &SessionSettings,
    ) -> Result<Box<dyn Link>, ProbeError> {
        match path {
            DevicePath::Serial(port) => {
                let resolved = resolve_port(port).map_err(|e| open_error(path, e))?;
                open_serial(path, &resolved, settings).await
            }
            DevicePath::Usb(ids) => open_usb(path, *ids).await,
        }
    }
}

#[cfg(feature = "serial")]
async fn open_serial(
    path: &DevicePath,
    resolved: &str,
    settings: &SessionSettings,
) -> Result<Box<dyn Link>, ProbeError> {
    let baud = settings
        .probe
        .baud_rates
        .first()
        .copied()
        .unwrap_or(crate::config::SUPPORTED_BAUD_RATES[0]);
    let link = crate::transport::serial::open_serial_link(
        resolved,
        baud,
        settings.transport.flow_control,
    )
    .await
    .map_err(|e| open_error(path, e))?;
    Ok(Box::new(link))
}

#[cfg(not(feature = "serial"))]
async fn open_serial(
    path: &DevicePath,
    _resolved: &str,
    _settings: &SessionSettings,
) -> Result<Box<dyn Link>, ProbeError> {
    Err(open_error(path, "built without the 'serial' feature"))
}

#[cfg(feature = "usb")]
async fn open_usb(path: &DevicePath, ids: Option<(u16, u16)>) -> Result<Box<dyn Link>, ProbeError> {
    use crate::transport::usb::{list_usb_ids, open_usb_link};

    let (vid, pid) = match ids {
        Some(ids) => ids,
        None => list_usb_ids()
            .map_err(|e| open_error(path, e))?
            .into_iter()
            .find(|ids| SIGNATURES.iter().any(|s| s.has_usb_ids(*ids)))
            .ok_or_else(|| open_error(path, "no supported USB instrument attached"))?,
    };
    let link = open_usb_link(vid, pid)
        .await
        .map_err(|e| open_error(path, e))?;
    Ok(Box::new(link))
}

#[cfg(not(feature = "usb"))]
async fn open_usb(path: &DevicePath, _ids: Option<(u16, u16)>) -> Result<Box<dyn Link>, ProbeError> {
    Err(open_error(path, "built without the 'usb' feature"))
}

/// Open `path` with `opener` and identify the family behind it.
pub async fn probe_and_open_link(
    opener: &dyn LinkOpener,
    path: &str,
    settings: &SessionSettings,
    abort: &AbortFlag,
) -> Result<(InstrumentType, Box<dyn Link>), ProbeError> {
    let device = DevicePath::parse(path).map_err(|e| ProbeError::Open {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    let mut link = opener.open(&device, settings).await?;
    tracing::debug!(target: "colorcal::probe", path = %device, link = %link.describe(), "Probing");
    let kind = probe_link(link.as_mut(), &settings.probe, abort).await?;
    Ok((kind, link))
}

/// Identify the instrument at `path`.
pub async fn probe(
    path: &str,
    settings: &SessionSettings,
    abort: &AbortFlag,
) -> Result<InstrumentType, ProbeError> {
    probe_and_open_link(&SystemOpener, path, settings, abort)
        .await
        .map(|(kind, _)| kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockLink;

    fn fast_settings() -> ProbeSettings {
        ProbeSettings::default()
    }

    /// Answers `reply` to any write, only at `baud`.
    fn answering_at(baud: u32, reply: &'static [u8]) -> MockLink {
        MockLink::new(move |req| (req.baud == Some(baud)).then(|| reply.to_vec()))
            .with_baud(921_600)
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_families_found_at_any_baud() {
        let cases: [(&[u8], InstrumentType); 2] = [
            (b"KS-3 V2.04\r", InstrumentType::KiSensor),
            (b"\x02ASMCUBE 1.3\x03", InstrumentType::SmCube),
        ];
        for (reply, expected) in cases {
            for baud in [921_600, 38_400, 9_600] {
                let mut link = answering_at(baud, reply);
                let started = Instant::now();
                let found = probe_link(&mut link, &fast_settings(), &AbortFlag::new())
                    .await
                    .unwrap();
                assert_eq!(found, expected, "baud {baud}");
                assert!(started.elapsed() <= fast_settings().budget());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_misses_never_identify() {
        let near: [&[u8]; 5] = [
            b"KS3 V2.04\r",
            b"ks-3 V2.04\r",
            b"KS-\r",
            b"\x02ASMCUB\x03",
            b"\x02NSMCUBE 1.3\x03",
        ];
        for reply in near {
            let mut link = answering_at(115_200, reply);
            let result = probe_link(&mut link, &fast_settings(), &AbortFlag::new()).await;
            assert!(
                matches!(result, Err(ProbeError::UnknownModel(_))),
                "{reply:?} gave {result:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_runs_out_of_budget() {
        let mut link = MockLink::silent().with_baud(9600);
        let settings = ProbeSettings {
            budget_ms: 1000,
            ..ProbeSettings::default()
        };
        let started = Instant::now();
        let result = probe_link(&mut link, &settings, &AbortFlag::new()).await;
        assert!(matches!(result, Err(ProbeError::NoResponse { .. })));
        assert!(started.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_probe() {
        let abort = AbortFlag::new();
        abort.trigger();
        let mut link = answering_at(9600, b"KS-3 V2.04\r");
        let result = probe_link(&mut link, &fast_settings(), &abort).await;
        assert_eq!(result, Err(ProbeError::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_usb_confirmed_by_binary_id() {
        let mut link = MockLink::new(spyder_x::tests::spyder_responder())
            .usb(spyder_x::VENDOR_ID, spyder_x::PRODUCT_ID);
        let found = probe_link(&mut link, &fast_settings(), &AbortFlag::new())
            .await
            .unwrap();
        assert_eq!(found, InstrumentType::SpyderX);

        let mut foreign = MockLink::silent().usb(0x1234, 0x5678);
        assert!(matches!(
            probe_link(&mut foreign, &fast_settings(), &AbortFlag::new()).await,
            Err(ProbeError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_signatures_do_not_overlap() {
        for a in &SIGNATURES {
            for b in &SIGNATURES {
                if a.kind != b.kind && a.link == b.link && a.link == LinkKind::Serial {
                    assert!(!a.expected_prefix.starts_with(b.expected_prefix));
                }
            }
        }
    }
}
