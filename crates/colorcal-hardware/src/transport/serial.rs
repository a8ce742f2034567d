//! Serial links via `tokio-serial`.

use super::stream::drain_serial_buffer;
use super::{Link, LinkKind};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialStream};

/// An open serial port.
pub struct SerialLink {
    stream: SerialStream,
    path: String,
    baud: u32,
}

impl SerialLink {
    /// Device path this link was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current baud rate.
    pub fn baud(&self) -> u32 {
        self.baud
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, optional RTS/CTS flow control.
pub async fn open_serial_link(path: &str, baud: u32, flow_control: bool) -> io::Result<SerialLink> {
    use tokio_serial::SerialPortBuilderExt;

    let path_owned = path.to_string();
    let stream = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path_owned, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(if flow_control {
                tokio_serial::FlowControl::Hardware
            } else {
                tokio_serial::FlowControl::None
            })
            .open_native_async()
            .map_err(io::Error::from)
    })
    .await
    .map_err(|e| io::Error::other(format!("spawn_blocking for serial open failed: {e}")))??;

    tracing::debug!(target: "colorcal::transport", path, baud, flow_control, "Opened serial port");
    Ok(SerialLink {
        stream,
        path: path.to_string(),
        baud,
    })
}

#[async_trait]
impl Link for SerialLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Serial
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.path, self.baud)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(&mut self.stream, bytes).await?;
        self.stream.flush().await
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        SerialPort::set_baud_rate(&mut self.stream, baud).map_err(io::Error::from)?;
        self.stream
            .clear(tokio_serial::ClearBuffer::All)
            .map_err(io::Error::from)?;
        self.baud = baud;
        Ok(())
    }

    async fn drain(&mut self, window: Duration) -> usize {
        drain_serial_buffer(&mut self.stream, window).await
    }
}
