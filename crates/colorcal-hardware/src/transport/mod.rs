//! Links and the shared transport handle.
//!
//! A [`Link`] is one physical channel to a device: a serial port, a USB
//! interface, or an in-memory script for tests. A [`Transport`] wraps a link in
//! a single `tokio::sync::Mutex` shared by the foreground driver and the
//! background switch poller; each request/response exchange holds the lock for
//! exactly one exchange, so a calibration step and a measurement are never
//! interleaved on the wire.
//!
//! The protocol codecs live in [`ascii`] and [`binary`]. They operate on a
//! locked `&mut dyn Link`, never on the transport itself.

pub mod ascii;
pub mod binary;
pub mod mock;
pub mod stream;

#[cfg(feature = "serial")]
pub mod serial;

#[cfg(feature = "usb")]
pub mod usb;

use async_trait::async_trait;
use colorcal_core::error::{ColorError, ColorResult, TransportError};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

pub use ascii::{AsciiCodec, AsciiResponse, Framing, StatusStyle};
pub use binary::{BinaryCodec, BinaryReply};

/// Physical kind of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// RS-232 / USB-serial bridge.
    Serial,
    /// Native USB with bulk and control endpoints.
    Usb,
    /// In-memory (tests, simulation).
    Memory,
}

/// Vendor control-in request for USB links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// bRequest.
    pub request: u8,
    /// wValue.
    pub value: u16,
    /// wIndex.
    pub index: u16,
    /// Bytes to read.
    pub length: u16,
}

/// One physical channel to a device.
///
/// Reads never block forever on their own; callers bound every read with a
/// deadline via [`read_exact_within`] or the codecs.
#[async_trait]
pub trait Link: Send {
    /// Physical kind of this link.
    fn kind(&self) -> LinkKind;

    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Write every byte.
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read at least one byte into `buf`. `Ok(0)` means the link closed.
    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Change the baud rate. Only serial links support this.
    async fn set_baud_rate(&mut self, _baud: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "link has no baud rate",
        ))
    }

    /// Vendor control-in transfer. Only USB links support this.
    async fn control_in(&mut self, _request: ControlRequest) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "link has no control endpoint",
        ))
    }

    /// USB vendor and product id, when known.
    fn usb_ids(&self) -> Option<(u16, u16)> {
        None
    }

    /// Discard input that arrives within `window`. Returns bytes discarded.
    async fn drain(&mut self, window: Duration) -> usize {
        let mut discard = [0u8; 256];
        let deadline = Instant::now() + window;
        let mut total = 0usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.read_some(&mut discard)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => total += n,
            }
        }
        total
    }
}

/// Fill `buf` completely before `deadline`.
pub async fn read_exact_within(
    link: &mut dyn Link,
    buf: &mut [u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timeout_error(timeout));
        }
        match tokio::time::timeout(remaining, link.read_some(&mut buf[filled..])).await {
            Ok(Ok(0)) => return Err(TransportError::Closed),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(timeout_error(timeout)),
        }
    }
    Ok(())
}

pub(crate) fn timeout_error(timeout: Duration) -> TransportError {
    TransportError::Timeout {
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Window used to discard stale input before each exchange.
pub const DRAIN_WINDOW: Duration = Duration::from_millis(5);

/// Shared, mutex-protected handle on one link.
#[derive(Clone)]
pub struct Transport {
    link: Arc<Mutex<Box<dyn Link>>>,
    open: Arc<AtomicBool>,
    label: Arc<str>,
    kind: LinkKind,
    usb_ids: Option<(u16, u16)>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Transport {
    /// Take ownership of `link`.
    pub fn new(link: Box<dyn Link>) -> Self {
        let label: Arc<str> = Arc::from(link.describe());
        let kind = link.kind();
        let usb_ids = link.usb_ids();
        Self {
            link: Arc::new(Mutex::new(link)),
            open: Arc::new(AtomicBool::new(true)),
            label,
            kind,
            usb_ids,
        }
    }

    /// Description of the underlying link.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Physical kind of the underlying link.
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// USB ids of the underlying link, if any.
    pub fn usb_ids(&self) -> Option<(u16, u16)> {
        self.usb_ids
    }

    /// Whether [`close`](Self::close) has not been called.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Mark the transport closed. Further exchanges fail with `Closed`.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Lock the link for one exchange.
    pub async fn lock(&self) -> ColorResult<MutexGuard<'_, Box<dyn Link>>> {
        if !self.is_open() {
            return Err(ColorError::NoCommunication);
        }
        Ok(self.link.lock().await)
    }

    /// Lock the link if it becomes free within `wait`.
    pub async fn try_lock_for(&self, wait: Duration) -> Option<MutexGuard<'_, Box<dyn Link>>> {
        if !self.is_open() {
            return None;
        }
        tokio::time::timeout(wait, self.link.lock()).await.ok()
    }

    async fn exchange_guard(&self) -> Result<MutexGuard<'_, Box<dyn Link>>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let mut guard = self.link.lock().await;
        let stale = guard.drain(DRAIN_WINDOW).await;
        if stale > 0 {
            tracing::debug!(target: "colorcal::transport", link = %self.label, stale, "Discarded stale bytes");
        }
        Ok(guard)
    }

    /// One ASCII request/response exchange.
    pub async fn ascii(
        &self,
        codec: &AsciiCodec,
        command: &str,
        timeout: Duration,
    ) -> Result<AsciiResponse, TransportError> {
        let mut guard = self.exchange_guard().await?;
        codec.exchange(guard.as_mut(), command, timeout).await
    }

    /// One binary request/response exchange.
    pub async fn binary(
        &self,
        codec: &BinaryCodec,
        opcode: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<BinaryReply, TransportError> {
        let mut guard = self.exchange_guard().await?;
        codec.exchange(guard.as_mut(), opcode, payload, timeout).await
    }

    /// Vendor control-in transfer.
    pub async fn control_in(&self, request: ControlRequest) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.exchange_guard().await?;
        guard.control_in(request).await.map_err(TransportError::from)
    }

    /// Change the baud rate of a serial link.
    pub async fn set_baud_rate(&self, baud: u32) -> io::Result<()> {
        self.link.lock().await.set_baud_rate(baud).await
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockLink;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_read_exact_times_out_on_silent_link() {
        let mut link = MockLink::silent();
        let mut buf = [0u8; 4];
        let timeout = Duration::from_millis(200);
        let err = read_exact_within(&mut link, &mut buf, Instant::now() + timeout, timeout)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout { timeout_ms: 200 });
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_exchanges() {
        let transport = Transport::new(Box::new(MockLink::silent()));
        transport.close();
        assert!(matches!(
            transport.lock().await,
            Err(ColorError::NoCommunication)
        ));
        let codec = AsciiCodec::carriage_return(StatusStyle::None);
        let err = transport
            .ascii(&codec, "V", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn test_try_lock_gives_up_while_held() {
        let transport = Transport::new(Box::new(MockLink::silent()));
        let held = transport.lock().await.unwrap();
        assert!(transport
            .try_lock_for(Duration::from_millis(5))
            .await
            .is_none());
        drop(held);
        assert!(transport
            .try_lock_for(Duration::from_millis(5))
            .await
            .is_some());
    }
}
