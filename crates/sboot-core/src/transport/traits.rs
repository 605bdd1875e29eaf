//! Transport layer abstraction.
//!
//! Defines the `Transport` trait for the byte-oriented duplex channel to the
//! device, allowing different implementations (nusb, serial, mock).

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Device not present, or claimed by another process.
    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// I/O failure mid-session. Not retried.
    #[error("Device disconnected: {0}")]
    Disconnected(String),
}

impl TransportError {
    /// Classify an I/O error from a blocking read or write.
    pub fn from_io(err: io::Error, timeout: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
            _ => TransportError::Disconnected(err.to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract duplex channel to an upload-mode device.
///
/// The handle is owned exclusively by one Session. Implementations release
/// the OS-level device on `close()` and on drop.
pub trait Transport: Send {
    /// Write all of `data` within `timeout`.
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read up to `max_len` bytes, waiting at most `timeout` for the first byte.
    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the device handle. Idempotent.
    fn close(&mut self) {}

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        (**self).send(data, timeout)
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).recv(max_len, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let t = Duration::from_millis(250);
        assert_eq!(
            TransportError::from_io(io::ErrorKind::TimedOut.into(), t),
            TransportError::Timeout { timeout_ms: 250 }
        );
        assert!(matches!(
            TransportError::from_io(io::ErrorKind::BrokenPipe.into(), t),
            TransportError::Disconnected(_)
        ));
    }
}
