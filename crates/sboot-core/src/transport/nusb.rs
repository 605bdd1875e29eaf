//! nusb-based USB transport implementation.

use std::io::{Read, Write};
use std::time::Duration;

use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{Transport, TransportError};
use crate::protocol::constants::{
    CDC_DATA_INTERFACE_CLASS, SAMSUNG_VENDOR_ID, UPLOAD_MODE_PRODUCT_ID,
};

/// USB device selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbTarget {
    pub vid: u16,
    pub pid: u16,
}

impl Default for UsbTarget {
    fn default() -> Self {
        Self {
            vid: SAMSUNG_VENDOR_ID,
            pid: UPLOAD_MODE_PRODUCT_ID,
        }
    }
}

struct Pipes {
    reader: EndpointRead<Bulk>,
    writer: EndpointWrite<Bulk>,
    // Held so the claim lasts as long as the pipes.
    _interface: Interface,
}

/// nusb-based USB transport over the CDC data interface's bulk pipes.
pub struct NusbTransport {
    pipes: Option<Pipes>,
    vid: u16,
    pid: u16,
    interface_number: u8,
}

impl NusbTransport {
    /// Open the default upload-mode device.
    pub fn open() -> Result<Self, TransportError> {
        Self::open_target(UsbTarget::default())
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", target.vid), pid = format!("{:04X}", target.pid)))]
    pub fn open_target(target: UsbTarget) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .find(|d| d.vendor_id() == target.vid && d.product_id() == target.pid)
            .ok_or_else(|| {
                TransportError::Unavailable(format!(
                    "no device with VID={:04X} PID={:04X}",
                    target.vid, target.pid
                ))
            })?;

        info!(
            vendor_id = %format!("{:04X}", target.vid),
            product_id = %format!("{:04X}", target.pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        // Find the CDC data interface and its BULK endpoints
        let mut found: Option<(u8, u8, u8)> = None;
        for config in device.configurations() {
            for iface in config.interfaces() {
                for alt in iface.alt_settings() {
                    if alt.class() != CDC_DATA_INTERFACE_CLASS {
                        continue;
                    }
                    let mut in_endpoint: u8 = 0;
                    let mut out_endpoint: u8 = 0;
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                    if in_endpoint != 0 && out_endpoint != 0 {
                        found = Some((iface.interface_number(), in_endpoint, out_endpoint));
                    }
                }
            }
        }

        let (interface_number, in_endpoint, out_endpoint) = found.ok_or_else(|| {
            TransportError::Unavailable("no CDC data interface with bulk IN/OUT endpoints".into())
        })?;

        let interface = device
            .detach_and_claim_interface(interface_number)
            .wait()
            .map_err(|e| {
                TransportError::Unavailable(format!(
                    "failed to claim interface {}: {}",
                    interface_number, e
                ))
            })?;

        let reader = interface
            .endpoint::<Bulk, In>(in_endpoint)
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .reader(crate::protocol::constants::MAX_READ_SIZE);
        let writer = interface
            .endpoint::<Bulk, Out>(out_endpoint)
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .writer(4096);

        info!(
            interface = interface_number,
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            pipes: Some(Pipes {
                reader,
                writer,
                _interface: interface,
            }),
            vid: target.vid,
            pid: target.pid,
            interface_number,
        })
    }

    fn pipes(&mut self) -> Result<&mut Pipes, TransportError> {
        self.pipes
            .as_mut()
            .ok_or_else(|| TransportError::Disconnected("transport closed".into()))
    }
}

impl Transport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let pipes = self.pipes()?;
        pipes.writer.set_write_timeout(timeout);
        pipes
            .writer
            .write_all(data)
            .and_then(|_| pipes.writer.flush())
            .map_err(|e| TransportError::from_io(e, timeout))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(())
    }

    #[instrument(skip(self), fields(max_len))]
    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let pipes = self.pipes()?;
        pipes.reader.set_read_timeout(timeout);

        let mut buf = vec![0u8; max_len];
        let n = pipes
            .reader
            .read(&mut buf)
            .map_err(|e| TransportError::from_io(e, timeout))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn close(&mut self) {
        if self.pipes.take().is_some() {
            info!(interface = self.interface_number, "Released USB interface");
        }
    }

    fn is_connected(&self) -> bool {
        // nusb has no cheap liveness probe; a dead device surfaces as an I/O error.
        self.pipes.is_some()
    }

    fn describe(&self) -> String {
        format!("usb {:04X}:{:04X}", self.vid, self.pid)
    }
}

impl Drop for NusbTransport {
    fn drop(&mut self) {
        self.close();
    }
}
