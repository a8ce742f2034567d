//! Error types shared by every colorcal crate.
//!
//! `ColorError` is the single error surfaced to callers of an `Instrument`. It is
//! built with `thiserror` and consolidates the failure classes an instrument
//! session can produce:
//!
//! - **Session state**: `NoCommunication`, `NotInitialized`.
//! - **Capability**: `Unsupported` when an operation lies outside the driver's
//!   capability bitmask.
//! - **Link**: `TransportFailure` wraps a [`TransportError`] (timeout, nonce,
//!   length or checksum mismatch). These are the only transient errors.
//! - **Device**: `ProtocolError` carries a status code the device reported in an
//!   otherwise well-formed reply. `UnknownModel` means something answered but did
//!   not match any known signature.
//! - **Calibration**: `CalibrationSetupNeeded` is a structured request for the
//!   host environment; it is never retried automatically.
//! - **Measurement**: `OutOfRange`, `Misread`, `Unstable`, `DeviceUnresponsive`.
//! - **Invariant**: `Internal`, e.g. a capability bit without an implementation.
//!
//! `UserAbort` always propagates immediately and unwinds retry and negotiation
//! loops.

use crate::calibration::{CalibrationRequirement, CalibrationType};
use crate::capabilities::Operation;
use crate::data::{CalibratedReading, RangeOverflow};
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type ColorResult<T> = std::result::Result<T, ColorError>;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failure of a single request/response exchange on the wire.
///
/// Every variant is transient: the caller may retry a bounded number of times.
/// I/O errors are flattened into kind + message so the error stays `Clone` and
/// can be attached to `DeviceUnresponsive`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No complete reply arrived within the exchange timeout.
    #[error("timed out after {timeout_ms} ms waiting for reply")]
    Timeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The echoed nonce did not match the request (stale or interleaved reply).
    #[error("nonce mismatch: sent {sent:#06x}, received {received:#06x}")]
    NonceMismatch {
        /// Nonce written in the request.
        sent: u16,
        /// Nonce found in the reply header.
        received: u16,
    },

    /// Reply length disagrees with the size expected for the opcode.
    #[error("reply length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Size expected for the opcode.
        expected: usize,
        /// Size announced or received.
        actual: usize,
    },

    /// Additive checksum over the payload did not verify.
    #[error("checksum mismatch: reply carried {expected:#04x}, computed {computed:#04x}")]
    ChecksumMismatch {
        /// Checksum byte found in the reply.
        expected: u8,
        /// Checksum computed over the received payload.
        computed: u8,
    },

    /// Reply could not be parsed at all.
    #[error("malformed reply: {0}")]
    Malformed(String),

    /// The link was closed before or during the exchange.
    #[error("link closed")]
    Closed,

    /// Underlying I/O failure.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Original `std::io::ErrorKind`.
        kind: std::io::ErrorKind,
        /// Original error message.
        message: String,
    },
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout { timeout_ms: 0 },
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => {
                TransportError::Closed
            }
            kind => TransportError::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}

// =============================================================================
// Probe Errors
// =============================================================================

/// Failure of the auto-probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Nothing answered within the global probe budget.
    #[error("no instrument responded within {elapsed_ms} ms")]
    NoResponse {
        /// Time spent probing.
        elapsed_ms: u64,
    },

    /// Something answered but matched no known signature.
    #[error("device replied {0:?} which matches no known instrument")]
    UnknownModel(String),

    /// The path could not be opened.
    #[error("cannot open {path}: {reason}")]
    Open {
        /// Device path as given.
        path: String,
        /// Reason reported by the OS or USB stack.
        reason: String,
    },

    /// The abort flag was raised between probe attempts.
    #[error("probe aborted")]
    Aborted,
}

// =============================================================================
// Cache Errors
// =============================================================================

/// Reasons a persisted calibration is not trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// No file for this device.
    #[error("no cached calibration")]
    Missing,

    /// File shorter than header plus checksum.
    #[error("cache file truncated ({0} bytes)")]
    Truncated(usize),

    /// Trailing checksum does not cover the preceding bytes.
    #[error("cache checksum does not verify")]
    ChecksumMismatch,

    /// Magic bytes missing.
    #[error("not a calibration cache file")]
    BadMagic,

    /// Written by an incompatible format version.
    #[error("cache version {found} is not supported (expected {expected})")]
    VersionMismatch {
        /// Version in the file.
        found: u16,
        /// Version this build writes.
        expected: u16,
    },

    /// Written by a build with a different record layout.
    #[error("cache layout tag {found} does not match this build ({expected})")]
    LayoutMismatch {
        /// Layout tag in the file.
        found: u32,
        /// Layout tag of this build.
        expected: u32,
    },

    /// Older than the device's calibration timeout.
    #[error("cached calibration is stale ({age_secs} s old, limit {limit_secs} s)")]
    Stale {
        /// Idle age in seconds.
        age_secs: u64,
        /// Device timeout in seconds.
        limit_secs: u64,
    },

    /// Payload did not decode, or the file belongs to another device.
    #[error("cache payload invalid: {0}")]
    Decode(String),

    /// Filesystem failure.
    #[error("cache I/O error: {0}")]
    Io(String),
}

// =============================================================================
// ColorError
// =============================================================================

/// Primary error type for instrument sessions.
#[derive(Error, Debug)]
pub enum ColorError {
    /// The instrument has not been opened, or its link has been closed.
    ///
    /// **Recovery Strategy**: open the instrument again with `probe_and_open`.
    #[error("Instrument is not open")]
    NoCommunication,

    /// The link is open but the device was never identified.
    ///
    /// **Recovery Strategy**: call `probe_and_open` (or `open`) which runs
    /// identification before returning the instrument.
    #[error("Instrument is open but not initialised")]
    NotInitialized,

    /// The requested operation is outside the driver's capability bitmask.
    ///
    /// **Error Type**: Permanent for this device.
    #[error("Operation '{operation}' is not supported by this instrument")]
    Unsupported {
        /// Operation that was requested.
        operation: Operation,
    },

    /// A wire exchange failed (timeout, nonce, length or checksum mismatch).
    ///
    /// **Error Type**: Transient. Callers retry a bounded number of times via
    /// `RetryPolicy` before surfacing it.
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// A device answered the identification command but matched no known model.
    #[error("Unknown instrument model (reply {reply:?})")]
    UnknownModel {
        /// Raw identification reply.
        reply: String,
    },

    /// Well-formed reply carrying a device-reported error status.
    ///
    /// **Error Type**: Permanent for the command that produced it. Never retried
    /// by the transport layer.
    #[error("Device reported error {code}: {message}")]
    ProtocolError {
        /// Status code as reported by the device.
        code: u16,
        /// Human-readable meaning of the code.
        message: String,
    },

    /// The cooperative abort flag was raised.
    #[error("Aborted by user")]
    UserAbort,

    /// The host must arrange a physical condition before calibration can continue.
    ///
    /// **Recovery Strategy**: satisfy the condition, call `confirm_setup`, and
    /// call `calibrate` again. Never retried automatically.
    #[error("Calibration setup needed: {0}")]
    CalibrationSetupNeeded(CalibrationRequirement),

    /// Calibration made no progress for the allowed number of rounds.
    #[error("Calibration of {kind:?} made no progress after {rounds} rounds")]
    CalibrationStalled {
        /// Calibration types still outstanding.
        kind: CalibrationType,
        /// Rounds spent without progress.
        rounds: u32,
    },

    /// The device reported overload or underload for its current range.
    ///
    /// Not retryable by itself; the caller should change range or setup.
    #[error("Reading out of range: {0}")]
    OutOfRange(RangeOverflow),

    /// A raw reply was structurally valid but its values are not usable.
    #[error("Misread: {0}")]
    Misread(String),

    /// Samples never converged within the retry budget.
    ///
    /// The best available value is attached so the caller can accept a degraded
    /// reading instead of losing it.
    #[error("Measurement did not settle after {attempts} samples")]
    Unstable {
        /// Best-effort reading (the last converted sample).
        best: Box<CalibratedReading>,
        /// Samples taken.
        attempts: u32,
    },

    /// Transport retries were exhausted while measuring.
    #[error("Device unresponsive after {attempts} attempts: {last}")]
    DeviceUnresponsive {
        /// Attempts made.
        attempts: u32,
        /// Last transport failure.
        #[source]
        last: TransportError,
    },

    /// Auto-probe failure other than abort or unknown model.
    #[error("Probe failed: {0}")]
    Probe(ProbeError),

    /// Persisted calibration could not be written.
    #[error("Calibration cache error: {0}")]
    Cache(#[from] CacheError),

    /// Semantic configuration error.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Functionality that was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Invariant violation inside the engine or a driver.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ColorError {
    /// Whether a retry of the same exchange may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ColorError::TransportFailure(_))
    }

    /// Shorthand for [`ColorError::Unsupported`].
    pub fn unsupported(operation: Operation) -> Self {
        ColorError::Unsupported { operation }
    }
}

impl From<ProbeError> for ColorError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Aborted => ColorError::UserAbort,
            ProbeError::UnknownModel(reply) => ColorError::UnknownModel { reply },
            other => ColorError::Probe(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationCondition;

    #[test]
    fn test_error_display() {
        let err = ColorError::unsupported(Operation::ReadTemperature);
        assert_eq!(
            err.to_string(),
            "Operation 'read_temperature' is not supported by this instrument"
        );
    }

    #[test]
    fn test_transport_failure_is_transient() {
        let err: ColorError = TransportError::NonceMismatch {
            sent: 0x1234,
            received: 0x4321,
        }
        .into();
        assert!(err.is_transient());
        assert!(err.to_string().contains("0x1234"));
        assert!(!ColorError::UserAbort.is_transient());
        assert!(!ColorError::ProtocolError {
            code: 5,
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn test_probe_abort_maps_to_user_abort() {
        assert!(matches!(
            ColorError::from(ProbeError::Aborted),
            ColorError::UserAbort
        ));
        assert!(matches!(
            ColorError::from(ProbeError::UnknownModel("XX".into())),
            ColorError::UnknownModel { .. }
        ));
    }

    #[test]
    fn test_setup_needed_display_names_condition() {
        let err = ColorError::CalibrationSetupNeeded(CalibrationRequirement::new(
            CalibrationType::WHITE_REFERENCE,
            CalibrationCondition::PlaceOnWhiteReference,
        ));
        assert!(err.to_string().contains("white reference"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "late");
        assert!(matches!(
            TransportError::from(io),
            TransportError::Timeout { .. }
        ));
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            TransportError::from(io),
            TransportError::Io { kind: std::io::ErrorKind::PermissionDenied, .. }
        ));
    }
}
