//! ASCII line protocols.
//!
//! Two framings are supported: a command followed by a write terminator with a
//! reply ending in a single sentinel byte (CR for KiSensor), and STX/ETX
//! framing (SmCube). Replies are read byte by byte until the sentinel or the
//! deadline, then the leading bytes are interpreted as a status field.

use super::{read_exact_within, timeout_error, Link};
use colorcal_core::error::{ColorError, ColorResult, TransportError};
use std::time::Duration;
use tokio::time::Instant;

/// Start-of-text byte.
pub const STX: u8 = 0x02;
/// End-of-text byte.
pub const ETX: u8 = 0x03;

/// Longest reply accepted before the frame is declared malformed.
pub const MAX_REPLY_LEN: usize = 256;

/// How a command and its reply are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `command + write`, reply ends with `read`.
    Terminated {
        /// Appended to every command.
        write: &'static [u8],
        /// Last byte of every reply.
        read: u8,
    },
    /// `STX command ETX`, reply `STX body ETX`.
    StxEtx,
}

/// How the leading bytes of a reply encode success or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStyle {
    /// No status field.
    None,
    /// `<NN>` decimal error echo; anything else is success.
    AngleCode,
    /// `A` for ack, `N` plus a two-digit code for nak.
    AckNak,
}

/// Parsed status of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiStatus {
    /// Device accepted the command.
    Ok,
    /// Device rejected the command with this code.
    Error(u16),
}

/// One parsed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiResponse {
    /// Status field.
    pub status: AsciiStatus,
    /// Body with framing and status removed.
    pub body: String,
}

impl AsciiResponse {
    /// Body on success, `ProtocolError` otherwise.
    pub fn into_result(self, describe: fn(u16) -> &'static str) -> ColorResult<String> {
        match self.status {
            AsciiStatus::Ok => Ok(self.body),
            AsciiStatus::Error(code) => Err(ColorError::ProtocolError {
                code,
                message: describe(code).to_string(),
            }),
        }
    }

    /// Error code, if the device rejected the command.
    pub fn error_code(&self) -> Option<u16> {
        match self.status {
            AsciiStatus::Ok => None,
            AsciiStatus::Error(code) => Some(code),
        }
    }
}

/// Codec for one ASCII protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsciiCodec {
    /// Frame delimiters.
    pub framing: Framing,
    /// Status interpretation.
    pub status: StatusStyle,
}

impl AsciiCodec {
    /// CR-terminated commands and replies.
    pub const fn carriage_return(status: StatusStyle) -> Self {
        Self {
            framing: Framing::Terminated {
                write: b"\r",
                read: b'\r',
            },
            status,
        }
    }

    /// STX/ETX framed commands and replies.
    pub const fn stx_etx(status: StatusStyle) -> Self {
        Self {
            framing: Framing::StxEtx,
            status,
        }
    }

    /// Byte that ends every reply.
    pub fn reply_terminator(&self) -> u8 {
        match self.framing {
            Framing::Terminated { read, .. } => read,
            Framing::StxEtx => ETX,
        }
    }

    /// Bytes written for `command`.
    pub fn encode(&self, command: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(command.len() + 2);
        match self.framing {
            Framing::Terminated { write, .. } => {
                out.extend_from_slice(command.as_bytes());
                out.extend_from_slice(write);
            }
            Framing::StxEtx => {
                out.push(STX);
                out.extend_from_slice(command.as_bytes());
                out.push(ETX);
            }
        }
        out
    }

    /// Parse a complete reply, terminator included.
    pub fn parse_reply(&self, raw: &[u8]) -> Result<AsciiResponse, TransportError> {
        let terminator = self.reply_terminator();
        let mut frame = match raw.split_last() {
            Some((&last, rest)) if last == terminator => rest,
            _ => {
                return Err(TransportError::Malformed(
                    "reply missing terminator".to_string(),
                ))
            }
        };
        if self.framing == Framing::StxEtx {
            frame = match frame.split_first() {
                Some((&STX, rest)) => rest,
                _ => return Err(TransportError::Malformed("reply missing STX".to_string())),
            };
        }
        let text = std::str::from_utf8(frame)
            .map_err(|_| TransportError::Malformed("reply is not ASCII".to_string()))?
            .trim_matches(|c: char| c == '\r' || c == '\n' || c == ' ');

        let (status, body) = match self.status {
            StatusStyle::None => (AsciiStatus::Ok, text),
            StatusStyle::AngleCode => parse_angle_code(text)?,
            StatusStyle::AckNak => parse_ack_nak(text)?,
        };
        Ok(AsciiResponse {
            status,
            body: body.trim().to_string(),
        })
    }

    /// Write `command` and read one reply before `timeout` elapses.
    pub async fn exchange(
        &self,
        link: &mut dyn Link,
        command: &str,
        timeout: Duration,
    ) -> Result<AsciiResponse, TransportError> {
        let deadline = Instant::now() + timeout;
        let frame = self.encode(command);
        tokio::time::timeout(timeout, link.write_all(&frame))
            .await
            .map_err(|_| timeout_error(timeout))??;

        let raw = self.read_reply(link, deadline, timeout).await?;
        tracing::trace!(target: "colorcal::transport", command, reply = %String::from_utf8_lossy(&raw), "ASCII exchange");
        self.parse_reply(&raw)
    }

    /// Read bytes up to and including the reply terminator.
    pub async fn read_reply(
        &self,
        link: &mut dyn Link,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let terminator = self.reply_terminator();
        let mut raw = Vec::with_capacity(32);
        let mut byte = [0u8; 1];
        loop {
            read_exact_within(link, &mut byte, deadline, timeout).await?;
            raw.push(byte[0]);
            if byte[0] == terminator {
                return Ok(raw);
            }
            if raw.len() >= MAX_REPLY_LEN {
                return Err(TransportError::Malformed(format!(
                    "reply exceeds {MAX_REPLY_LEN} bytes without terminator"
                )));
            }
        }
    }
}

fn parse_angle_code(text: &str) -> Result<(AsciiStatus, &str), TransportError> {
    let Some(rest) = text.strip_prefix('<') else {
        return Ok((AsciiStatus::Ok, text));
    };
    let Some(end) = rest.find('>') else {
        return Err(TransportError::Malformed(format!(
            "unterminated status echo: {text}"
        )));
    };
    let code = rest[..end]
        .parse::<u16>()
        .map_err(|_| TransportError::Malformed(format!("bad status echo: {text}")))?;
    let body = &rest[end + 1..];
    if code == 0 {
        Ok((AsciiStatus::Ok, body))
    } else {
        Ok((AsciiStatus::Error(code), body))
    }
}

fn parse_ack_nak(text: &str) -> Result<(AsciiStatus, &str), TransportError> {
    if let Some(body) = text.strip_prefix('A') {
        return Ok((AsciiStatus::Ok, body));
    }
    if let Some(rest) = text.strip_prefix('N') {
        let digits = rest.get(..2).ok_or_else(|| {
            TransportError::Malformed(format!("nak without code: {text}"))
        })?;
        let code = digits
            .parse::<u16>()
            .map_err(|_| TransportError::Malformed(format!("bad nak code: {text}")))?;
        return Ok((AsciiStatus::Error(code), &rest[2..]));
    }
    Err(TransportError::Malformed(format!(
        "reply has no ack/nak prefix: {text}"
    )))
}
