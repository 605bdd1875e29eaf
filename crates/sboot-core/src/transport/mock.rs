//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{Transport, TransportError};
use crate::protocol::{ChipsetVariant, Opcode};

/// One scripted reaction to a `recv`.
#[derive(Debug, Clone)]
pub enum MockReply {
    Bytes(Vec<u8>),
    Timeout,
    Disconnect,
}

/// Mock transport returning queued replies in order.
///
/// Clones share state, so a test can keep a handle after moving the
/// transport into a Session.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued replies to return on read.
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
    closed: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Queue raw bytes to be returned on next read.
    pub fn queue_bytes(&self, bytes: &[u8]) {
        self.queue(MockReply::Bytes(bytes.to_vec()));
    }

    /// Queue a well-formed frame encoded for `variant`.
    pub fn queue_frame(&self, variant: ChipsetVariant, opcode: Opcode, payload: &[u8]) {
        let codec = variant.codec();
        let frame = codec
            .encode(opcode, payload)
            .expect("mock frame payload within limit");
        self.queue_bytes(&codec.serialize(&frame));
    }

    pub fn queue_timeout(&self) {
        self.queue(MockReply::Timeout);
    }

    pub fn queue(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected("mock unplugged".into()));
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected("mock unplugged".into()));
        }
        let timed_out = TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        };
        let mut replies = self.replies.lock().unwrap();
        match replies.pop_front() {
            Some(MockReply::Bytes(mut bytes)) => {
                if bytes.len() > max_len {
                    let rest = bytes.split_off(max_len);
                    replies.push_front(MockReply::Bytes(rest));
                }
                Ok(bytes)
            }
            Some(MockReply::Timeout) | None => Err(timed_out),
            Some(MockReply::Disconnect) => {
                *self.connected.lock().unwrap() = false;
                Err(TransportError::Disconnected("mock unplugged".into()))
            }
        }
    }

    fn close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_reply_queue() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(b"PoStAmBlE\0");
        mock.queue_timeout();

        assert_eq!(mock.recv(64, T).unwrap(), b"PoStAmBlE\0");
        assert!(mock.recv(64, T).unwrap_err().is_timeout());

        // Queue is empty now
        assert!(mock.recv(64, T).is_err());
    }

    #[test]
    fn test_mock_split_read() {
        let mut mock = MockTransport::new();
        mock.queue_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(mock.recv(2, T).unwrap(), vec![1, 2]);
        assert_eq!(mock.recv(8, T).unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::new();
        let handle = mock.clone();
        mock.send(b"Hello", T).unwrap();
        mock.send(b"World", T).unwrap();

        let writes = handle.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(matches!(
            mock.send(b"test", T),
            Err(TransportError::Disconnected(_))
        ));

        mock.reconnect();
        assert!(mock.send(b"test", T).is_ok());
    }

    #[test]
    fn test_mock_scripted_disconnect_sticks() {
        let mut mock = MockTransport::new();
        mock.queue(MockReply::Disconnect);
        mock.queue_bytes(b"late");

        assert!(matches!(
            mock.recv(64, T),
            Err(TransportError::Disconnected(_))
        ));
        assert!(!mock.is_connected());
        assert!(mock.recv(64, T).is_err());
    }
}
