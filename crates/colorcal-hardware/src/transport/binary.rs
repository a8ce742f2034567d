//! Fixed-header binary protocol with nonce, length and checksum.
//!
//! Request: `opcode:u8 | nonce:u16 BE | payload_len:u16 BE | payload`.
//!
//! Reply: `nonce:u16 BE | status:u16 BE | reply_len:u16 BE | payload | checksum:u8`.
//!
//! The checksum is the wrapping sum of the payload bytes. Replies are verified
//! in order: echoed nonce, expected length for the opcode, then checksum. A
//! non-zero status with an empty payload is a well-formed error reply.

use super::{read_exact_within, timeout_error, Link};
use colorcal_core::error::{ColorError, ColorResult, TransportError};
use std::time::Duration;
use tokio::time::Instant;

/// Size of the reply header.
pub const REPLY_HEADER_LEN: usize = 6;

/// Upper bound for opcodes missing from the size table.
pub const MAX_REPLY_PAYLOAD: usize = 512;

/// Wrapping sum of `bytes`.
pub fn checksum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build a request frame.
pub fn encode_request(opcode: u8, nonce: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(opcode);
    frame.extend_from_slice(&nonce.to_be_bytes());
    // Payloads are a handful of bytes; the codec never builds larger frames.
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build a reply frame. Device simulators and tests use this.
pub fn encode_reply(nonce: u16, status: u16, payload: &[u8], with_checksum: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REPLY_HEADER_LEN + payload.len() + 1);
    frame.extend_from_slice(&nonce.to_be_bytes());
    frame.extend_from_slice(&status.to_be_bytes());
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    if with_checksum {
        frame.push(checksum8(payload));
    }
    frame
}

/// Split a request frame into `(opcode, nonce, payload)`.
pub fn decode_request(frame: &[u8]) -> Option<(u8, u16, &[u8])> {
    if frame.len() < 5 {
        return None;
    }
    let opcode = frame[0];
    let nonce = u16::from_be_bytes([frame[1], frame[2]]);
    let len = usize::from(u16::from_be_bytes([frame[3], frame[4]]));
    let payload = frame.get(5..5 + len)?;
    Some((opcode, nonce, payload))
}

/// A verified reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryReply {
    /// Device status; zero is success.
    pub status: u16,
    /// Reply payload.
    pub payload: Vec<u8>,
}

impl BinaryReply {
    /// Payload on success, `ProtocolError` otherwise.
    pub fn into_result(self, describe: fn(u16) -> &'static str) -> ColorResult<Vec<u8>> {
        if self.status == 0 {
            Ok(self.payload)
        } else {
            Err(ColorError::ProtocolError {
                code: self.status,
                message: describe(self.status).to_string(),
            })
        }
    }
}

/// Codec for one binary protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryCodec {
    /// Expected reply payload size per opcode.
    pub reply_sizes: &'static [(u8, usize)],
    /// Whether replies carry a trailing checksum byte.
    pub checksum: bool,
}

impl BinaryCodec {
    /// Expected reply payload size for `opcode`.
    pub fn expected_len(&self, opcode: u8) -> Option<usize> {
        self.reply_sizes
            .iter()
            .find(|(op, _)| *op == opcode)
            .map(|(_, len)| *len)
    }

    fn check_header(
        &self,
        opcode: u8,
        nonce: u16,
        header: &[u8; REPLY_HEADER_LEN],
    ) -> Result<(u16, usize), TransportError> {
        let received = u16::from_be_bytes([header[0], header[1]]);
        if received != nonce {
            return Err(TransportError::NonceMismatch {
                sent: nonce,
                received,
            });
        }
        let status = u16::from_be_bytes([header[2], header[3]]);
        let reply_len = usize::from(u16::from_be_bytes([header[4], header[5]]));
        if status != 0 && reply_len == 0 {
            return Ok((status, 0));
        }
        match self.expected_len(opcode) {
            Some(expected) if expected != reply_len => Err(TransportError::LengthMismatch {
                expected,
                actual: reply_len,
            }),
            None if reply_len > MAX_REPLY_PAYLOAD => Err(TransportError::LengthMismatch {
                expected: MAX_REPLY_PAYLOAD,
                actual: reply_len,
            }),
            _ => Ok((status, reply_len)),
        }
    }

    fn check_payload(&self, payload: &[u8], trailer: Option<u8>) -> Result<(), TransportError> {
        if let Some(expected) = trailer {
            let computed = checksum8(payload);
            if computed != expected {
                return Err(TransportError::ChecksumMismatch { expected, computed });
            }
        }
        Ok(())
    }

    /// Verify a complete reply frame for a request with `opcode` and `nonce`.
    pub fn decode_reply(
        &self,
        opcode: u8,
        nonce: u16,
        frame: &[u8],
    ) -> Result<BinaryReply, TransportError> {
        let header: &[u8; REPLY_HEADER_LEN] = frame
            .get(..REPLY_HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| TransportError::Malformed(format!("short reply: {} bytes", frame.len())))?;
        let (status, reply_len) = self.check_header(opcode, nonce, header)?;
        let trailer_len = usize::from(self.checksum);
        let expected_total = REPLY_HEADER_LEN + reply_len + trailer_len;
        if frame.len() != expected_total {
            return Err(TransportError::LengthMismatch {
                expected: expected_total,
                actual: frame.len(),
            });
        }
        let payload = &frame[REPLY_HEADER_LEN..REPLY_HEADER_LEN + reply_len];
        let trailer = self.checksum.then(|| frame[expected_total - 1]);
        self.check_payload(payload, trailer)?;
        Ok(BinaryReply {
            status,
            payload: payload.to_vec(),
        })
    }

    /// Send one request and read its verified reply before `timeout` elapses.
    pub async fn exchange(
        &self,
        link: &mut dyn Link,
        opcode: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<BinaryReply, TransportError> {
        let nonce: u16 = rand::random();
        let deadline = Instant::now() + timeout;
        let request = encode_request(opcode, nonce, payload);
        tokio::time::timeout(timeout, link.write_all(&request))
            .await
            .map_err(|_| timeout_error(timeout))??;

        let mut header = [0u8; REPLY_HEADER_LEN];
        read_exact_within(link, &mut header, deadline, timeout).await?;
        let (status, reply_len) = self.check_header(opcode, nonce, &header)?;

        let mut body = vec![0u8; reply_len + usize::from(self.checksum)];
        read_exact_within(link, &mut body, deadline, timeout).await?;
        let trailer = if self.checksum { body.pop() } else { None };
        self.check_payload(&body, trailer)?;

        tracing::trace!(
            target: "colorcal::transport",
            opcode = format_args!("{opcode:#04x}"),
            nonce,
            status,
            reply_len,
            "Binary exchange"
        );
        Ok(BinaryReply {
            status,
            payload: body,
        })
    }
}
