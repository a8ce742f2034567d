//! Link over any async byte stream.
//!
//! Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can carry a
//! device conversation: `tokio_serial::SerialStream`, a TCP bridge to a remote
//! serial server, or `tokio::io::DuplexStream` in tests.

use super::{Link, LinkKind};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Trait alias for async serial-like I/O.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased byte stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Drain stale data from a stream.
///
/// Reads and discards until nothing arrives within `window`. Returns the number
/// of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

/// [`Link`] over a byte stream.
pub struct StreamLink<T: SerialPortIO> {
    io: T,
    label: String,
}

impl<T: SerialPortIO> StreamLink<T> {
    /// Wrap `io`, labelling it for logs.
    pub fn new(io: T, label: impl Into<String>) -> Self {
        Self {
            io,
            label: label.into(),
        }
    }

    /// Recover the stream.
    pub fn into_inner(self) -> T {
        self.io
    }
}

#[async_trait]
impl<T: SerialPortIO> Link for StreamLink<T> {
    fn kind(&self) -> LinkKind {
        LinkKind::Serial
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read(buf).await
    }

    async fn drain(&mut self, window: Duration) -> usize {
        drain_serial_buffer(&mut self.io, window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AsciiCodec, StatusStyle, Transport};

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut device, Duration::from_millis(50)).await;
        assert_eq!(discarded, 16);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(10), device.read(&mut buf)).await;
        assert!(read.is_err(), "buffer should be empty");
    }

    #[tokio::test]
    async fn test_transport_over_duplex_discards_stale_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        host.write_all(b"garbage\r").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let transport = Transport::new(Box::new(StreamLink::new(device, "duplex")));
        let device_side = tokio::spawn(async move {
            let mut cmd = [0u8; 2];
            host.read_exact(&mut cmd).await.unwrap();
            assert_eq!(&cmd, b"V\r");
            host.write_all(b"KS-3 V2.04\r").await.unwrap();
            host
        });

        let codec = AsciiCodec::carriage_return(StatusStyle::AngleCode);
        let reply = transport
            .ascii(&codec, "V", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply.body, "KS-3 V2.04");
        device_side.await.unwrap();
    }
}
