//! Device path parsing and serial port resolution.
//!
//! A device path is one of:
//!
//! - `usb` : any attached USB instrument known to a driver
//! - `usb:VVVV:PPPP` : a USB device by hex vendor/product id
//! - a serial device path (`/dev/ttyUSB0`, `COM3`)
//! - a `/dev/serial/by-id/` entry, full or short (`usb-FTDI_FT230X_DJ00XXXX-if00-port0`)
//!
//! Linux udev creates stable by-id symlinks with the format
//! `usb-{VENDOR}_{MODEL}_{SERIAL}-if{INTERFACE}-port{PORT}`; they survive
//! reboots and replugging where `/dev/ttyUSBn` does not.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BY_ID_DIR: &str = "/dev/serial/by-id";

/// Errors that can occur during port resolution.
#[derive(Debug, Error)]
pub enum PortResolveError {
    /// The specified port path does not exist.
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// A `usb:` path with malformed ids.
    #[error("Invalid USB device path '{0}': expected usb or usb:VVVV:PPPP")]
    InvalidUsbPath(String),

    /// Empty path.
    #[error("Empty device path")]
    Empty,

    /// IO error during port resolution.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an instrument is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePath {
    /// A serial port, not yet resolved.
    Serial(String),
    /// A USB device, optionally restricted to one vendor/product id pair.
    Usb(Option<(u16, u16)>),
}

impl DevicePath {
    /// Parse a user-supplied path.
    pub fn parse(raw: &str) -> Result<Self, PortResolveError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PortResolveError::Empty);
        }
        if raw.eq_ignore_ascii_case("usb") {
            return Ok(DevicePath::Usb(None));
        }
        if let Some(ids) = raw.strip_prefix("usb:") {
            let (vid, pid) = ids
                .split_once(':')
                .ok_or_else(|| PortResolveError::InvalidUsbPath(raw.to_string()))?;
            let parse = |s: &str| {
                u16::from_str_radix(s, 16)
                    .map_err(|_| PortResolveError::InvalidUsbPath(raw.to_string()))
            };
            return Ok(DevicePath::Usb(Some((parse(vid)?, parse(pid)?))));
        }
        Ok(DevicePath::Serial(raw.to_string()))
    }

    /// Whether this is a USB path.
    pub fn is_usb(&self) -> bool {
        matches!(self, DevicePath::Usb(_))
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePath::Serial(path) => f.write_str(path),
            DevicePath::Usb(None) => f.write_str("usb"),
            DevicePath::Usb(Some((vid, pid))) => write!(f, "usb:{vid:04x}:{pid:04x}"),
        }
    }
}

/// Resolve a serial port path, handling direct paths and by-id names.
///
/// Paths that exist are canonicalised so symlinks resolve to the real device.
/// Paths that do not look like filesystem paths (`COM3`) are returned as-is.
pub fn resolve_port(port: &str) -> Result<String, PortResolveError> {
    if port.starts_with("usb-") {
        let full_path = PathBuf::from(BY_ID_DIR).join(port);
        return canonical(&full_path);
    }
    if port.contains('/') {
        return canonical(Path::new(port));
    }
    Ok(port.to_string())
}

fn canonical(path: &Path) -> Result<String, PortResolveError> {
    if !path.exists() {
        return Err(PortResolveError::PortNotFound(
            path.to_string_lossy().into_owned(),
        ));
    }
    Ok(std::fs::canonicalize(path)?.to_string_lossy().into_owned())
}
