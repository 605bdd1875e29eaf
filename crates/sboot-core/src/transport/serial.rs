//! Serial-port transport (USB CDC ACM or a native UART).

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, instrument};

use super::traits::{Transport, TransportError};
use crate::protocol::constants::{DEFAULT_BAUD_RATE, DEFAULT_IO_TIMEOUT_MS};

/// Serial link to an upload-mode device.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
}

impl SerialTransport {
    #[instrument(level = "info")]
    pub fn open(path: &str, baud_rate: Option<u32>) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate.unwrap_or(DEFAULT_BAUD_RATE))
            .timeout(Duration::from_millis(DEFAULT_IO_TIMEOUT_MS))
            .open()
            .map_err(|e| TransportError::Unavailable(format!("{}: {}", path, e)))?;

        // Stale bytes from a previous run would desynchronise framing.
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        info!(path = %path, "Serial port opened");
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
        })
    }

    fn port(&mut self, timeout: Duration) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| TransportError::Disconnected("transport closed".into()))?;
        port.set_timeout(timeout)
            .map_err(|e| TransportError::Disconnected(e.to_string()))?;
        Ok(port)
    }
}

impl Transport for SerialTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let port = self.port(timeout)?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| TransportError::from_io(e, timeout))?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(())
    }

    #[instrument(skip(self), fields(max_len))]
    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port(timeout)?;
        let mut buf = vec![0u8; max_len];
        let n = port
            .read(&mut buf)
            .map_err(|e| TransportError::from_io(e, timeout))?;
        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(path = %self.path, "Serial port closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn describe(&self) -> String {
        format!("serial {}", self.path)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
