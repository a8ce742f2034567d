//! Native USB links via `nusb`.
//!
//! Binary exchanges go over a bulk OUT/IN endpoint pair on interface 0; status
//! queries use vendor control-in transfers on the default pipe.

use super::{ControlRequest, Link, LinkKind};
use async_trait::async_trait;
use nusb::transfer::{ControlIn, ControlType, Recipient, RequestBuffer};
use nusb::Interface;
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

/// Bulk OUT endpoint.
pub const ENDPOINT_OUT: u8 = 0x01;
/// Bulk IN endpoint.
pub const ENDPOINT_IN: u8 = 0x81;
/// Size of each bulk IN request.
const BULK_IN_LEN: usize = 64;

/// A claimed USB interface.
pub struct UsbLink {
    interface: Interface,
    vendor_id: u16,
    product_id: u16,
    buffered: VecDeque<u8>,
}

/// Vendor and product ids of every attached USB device.
pub fn list_usb_ids() -> io::Result<Vec<(u16, u16)>> {
    Ok(nusb::list_devices()?
        .map(|d| (d.vendor_id(), d.product_id()))
        .collect())
}

/// Open the first device matching `vendor_id`/`product_id`.
pub async fn open_usb_link(vendor_id: u16, product_id: u16) -> io::Result<UsbLink> {
    let device_info = nusb::list_devices()?
        .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no USB device {vendor_id:04x}:{product_id:04x}"),
            )
        })?;

    tracing::debug!(
        target: "colorcal::transport",
        bus = device_info.bus_number(),
        address = device_info.device_address(),
        "Found USB device {vendor_id:04x}:{product_id:04x}"
    );

    let device = device_info.open()?;
    let interface = device.detach_and_claim_interface(0)?;
    Ok(UsbLink {
        interface,
        vendor_id,
        product_id,
        buffered: VecDeque::new(),
    })
}

#[async_trait]
impl Link for UsbLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Usb
    }

    fn describe(&self) -> String {
        format!("usb:{:04x}:{:04x}", self.vendor_id, self.product_id)
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        Some((self.vendor_id, self.product_id))
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let completion = self.interface.bulk_out(ENDPOINT_OUT, bytes.to_vec()).await;
        let sent = completion
            .into_result()
            .map_err(|e| io::Error::other(e.to_string()))?;
        if sent.actual_length() != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short bulk write: {} of {}", sent.actual_length(), bytes.len()),
            ));
        }
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.buffered.is_empty() {
            let completion = self
                .interface
                .bulk_in(ENDPOINT_IN, RequestBuffer::new(BULK_IN_LEN))
                .await;
            let data = completion
                .into_result()
                .map_err(|e| io::Error::other(e.to_string()))?;
            self.buffered.extend(data);
        }
        let n = buf.len().min(self.buffered.len());
        for (slot, byte) in buf.iter_mut().zip(self.buffered.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn control_in(&mut self, request: ControlRequest) -> io::Result<Vec<u8>> {
        let completion = self
            .interface
            .control_in(ControlIn {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: request.request,
                value: request.value,
                index: request.index,
                length: request.length,
            })
            .await;
        completion
            .into_result()
            .map_err(|e| io::Error::other(e.to_string()))
    }

    async fn drain(&mut self, _window: Duration) -> usize {
        let stale = self.buffered.len();
        self.buffered.clear();
        stale
    }
}
