//! Scripted in-memory links.
//!
//! [`MockLink`] plays the device side of a conversation: every `write_all` is
//! handed to a responder closure whose reply (if any) is queued for subsequent
//! reads. Reads with nothing queued stay pending, so silence is observed as a
//! timeout exactly as on real hardware.
//!
//! ```rust,ignore
//! let link = MockLink::new(|req| match req.bytes.as_slice() {
//!     b"V\r" => Some(b"KS-3 V2.04\r".to_vec()),
//!     _ => None,
//! })
//! .with_baud(9600);
//! ```
//!
//! [`NullLink`] is the link of the simulated driver: it never carries bytes.

use super::{ControlRequest, Link, LinkKind};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

/// One write observed by a [`MockLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    /// Bytes written.
    pub bytes: Vec<u8>,
    /// Baud rate at the time of the write (serial mocks only).
    pub baud: Option<u32>,
}

type Responder = Box<dyn FnMut(&MockRequest) -> Option<Vec<u8>> + Send>;
type ControlResponder = Box<dyn FnMut(ControlRequest) -> Option<Vec<u8>> + Send>;

/// Shared record of every write, readable after the link has moved into a
/// transport.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    writes: Arc<Mutex<Vec<MockRequest>>>,
}

impl MockLog {
    fn push(&self, request: MockRequest) {
        let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        writes.push(request);
    }

    /// Copy of every write so far.
    pub fn writes(&self) -> Vec<MockRequest> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of writes so far.
    pub fn len(&self) -> usize {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of writes equal to `bytes`.
    pub fn count(&self, bytes: &[u8]) -> usize {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|w| w.bytes == bytes)
            .count()
    }
}

/// Scripted device.
pub struct MockLink {
    responder: Responder,
    control: Option<ControlResponder>,
    pending: VecDeque<u8>,
    baud: Option<u32>,
    kind: LinkKind,
    usb_ids: Option<(u16, u16)>,
    log: MockLog,
    label: String,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("baud", &self.baud)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl MockLink {
    /// A serial-like mock answering through `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&MockRequest) -> Option<Vec<u8>> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            control: None,
            pending: VecDeque::new(),
            baud: None,
            kind: LinkKind::Serial,
            usb_ids: None,
            log: MockLog::default(),
            label: "mock".to_string(),
        }
    }

    /// A mock that never answers.
    pub fn silent() -> Self {
        Self::new(|_| None)
    }

    /// Start at `baud`; the responder sees the current rate on every write.
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    /// Present as a USB device with the given ids.
    pub fn usb(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.kind = LinkKind::Usb;
        self.baud = None;
        self.usb_ids = Some((vendor_id, product_id));
        self
    }

    /// Answer vendor control-in transfers.
    pub fn with_control<F>(mut self, responder: F) -> Self
    where
        F: FnMut(ControlRequest) -> Option<Vec<u8>> + Send + 'static,
    {
        self.control = Some(Box::new(responder));
        self
    }

    /// Queue unsolicited bytes, as if the device sent them earlier.
    pub fn with_pending(mut self, bytes: &[u8]) -> Self {
        self.pending.extend(bytes);
        self
    }

    /// Label reported by [`Link::describe`].
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Handle on the write log.
    pub fn log(&self) -> MockLog {
        self.log.clone()
    }
}

#[async_trait]
impl Link for MockLink {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        self.usb_ids
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let request = MockRequest {
            bytes: bytes.to_vec(),
            baud: self.baud,
        };
        if let Some(reply) = (self.responder)(&request) {
            self.pending.extend(reply);
        }
        self.log.push(request);
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() || buf.is_empty() {
            std::future::pending::<()>().await;
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        if self.kind != LinkKind::Serial {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "link has no baud rate",
            ));
        }
        self.baud = Some(baud);
        self.pending.clear();
        Ok(())
    }

    async fn control_in(&mut self, request: ControlRequest) -> io::Result<Vec<u8>> {
        match self.control.as_mut() {
            Some(respond) => respond(request).ok_or_else(|| {
                io::Error::new(io::ErrorKind::TimedOut, "control transfer stalled")
            }),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "link has no control endpoint",
            )),
        }
    }
}

/// Link that carries nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLink;

#[async_trait]
impl Link for NullLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Memory
    }

    fn describe(&self) -> String {
        "null".to_string()
    }

    async fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "null link"))
    }

    async fn read_some(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "null link"))
    }

    async fn drain(&mut self, _window: std::time::Duration) -> usize {
        0
    }
}
