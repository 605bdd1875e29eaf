//! Simulated upload-mode device.
//!
//! Unlike [`MockTransport`](super::MockTransport), which replays scripted
//! bytes, `MockDevice` decodes each request under its own chipset variant
//! and answers the way a target would: identify, paginated region table,
//! memory reads and postamble. Faults can be injected per request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{Transport, TransportError};
use crate::catalog::{AddressWidth, TableBuilder};
use crate::protocol::constants::{TAG_ACKNOWLEDGMENT, TAG_POSTAMBLE};
use crate::protocol::{ChipsetVariant, Command, FrameCodec, Opcode};

struct DeviceState {
    /// `None` never answers anything.
    variant: Option<ChipsetVariant>,
    table_pages: Vec<Vec<u8>>,
    endless_table: bool,
    read_split: Option<usize>,
    unreadable: Option<u64>,
    outbox: VecDeque<u8>,
    frames_received: usize,
    requests: Vec<Command>,
    corrupt_next: u32,
    drop_next: u32,
    nack_next: u32,
    disconnect_after: Option<u64>,
    bytes_served: u64,
    unplugged: bool,
    closed: bool,
}

/// Cloneable handle to one simulated device. Clones share state, so a test
/// can inject faults after moving the device into a session.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    /// Device speaking `variant` with a two-region table
    /// (`BOOT` 0x1000+0x200, `RAM` 0x2000+0x1000).
    pub fn new(variant: ChipsetVariant) -> Self {
        let width = match variant {
            ChipsetVariant::Sboot32 => AddressWidth::Bits32,
            ChipsetVariant::Sboot64 => AddressWidth::Bits64,
        };
        let table = TableBuilder::new("SM-MOCK", width)
            .region("BOOT", 0x1000, 0x200)
            .region("RAM", 0x2000, 0x1000)
            .build();
        Self::build(Some(variant)).with_table(&table, variant.codec().max_payload())
    }

    /// Device that swallows every request.
    pub fn unresponsive() -> Self {
        Self::build(None)
    }

    fn build(variant: Option<ChipsetVariant>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                variant,
                table_pages: Vec::new(),
                endless_table: false,
                read_split: None,
                unreadable: None,
                outbox: VecDeque::new(),
                frames_received: 0,
                requests: Vec::new(),
                corrupt_next: 0,
                drop_next: 0,
                nack_next: 0,
                disconnect_after: None,
                bytes_served: 0,
                unplugged: false,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serve `table` in pages of `page_size` bytes.
    pub fn with_table(self, table: &[u8], page_size: usize) -> Self {
        {
            let mut state = self.lock();
            state.table_pages = table
                .chunks(page_size.max(1))
                .map(|page| page.to_vec())
                .collect();
            state.endless_table = false;
        }
        self
    }

    /// Region table that never sends its final page.
    pub fn with_endless_table(self) -> Self {
        self.lock().endless_table = true;
        self
    }

    /// Deliver responses at most `n` bytes per read.
    pub fn with_read_split(self, n: usize) -> Self {
        self.lock().read_split = Some(n.max(1));
        self
    }

    /// NACK every read covering `address`.
    pub fn with_unreadable(self, address: u64) -> Self {
        self.lock().unreadable = Some(address);
        self
    }

    /// Flip a trailer bit in the next `n` responses.
    pub fn corrupt_next(&self, n: u32) {
        self.lock().corrupt_next = n;
    }

    /// Ignore the next `n` requests.
    pub fn drop_next(&self, n: u32) {
        self.lock().drop_next = n;
    }

    /// Answer the next `n` memory reads with NACK.
    pub fn nack_next(&self, n: u32) {
        self.lock().nack_next = n;
    }

    /// Go away once `bytes` of memory have been served.
    pub fn disconnect_after(&self, bytes: u64) {
        self.lock().disconnect_after = Some(bytes);
    }

    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    /// Raw frames written to the device, decodable or not.
    pub fn frames_received(&self) -> usize {
        self.lock().frames_received
    }

    /// Requests the device understood, in order.
    pub fn requests(&self) -> Vec<Command> {
        self.lock().requests.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Memory content the device reports for `[start, start + len)`.
    pub fn expected_bytes(start: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| pattern_byte(start.wrapping_add(i)))
            .collect()
    }
}

fn pattern_byte(addr: u64) -> u8 {
    (addr ^ (addr >> 8) ^ (addr >> 16) ^ (addr >> 32)) as u8 ^ 0x5A
}

impl DeviceState {
    fn respond(
        &mut self,
        codec: &'static dyn FrameCodec,
        command: Command,
    ) -> Result<(Opcode, Vec<u8>), TransportError> {
        let reply = match command {
            Command::Identify => (Opcode::Ack, TAG_ACKNOWLEDGMENT.to_vec()),
            Command::Postamble => (Opcode::Ack, TAG_POSTAMBLE.to_vec()),
            Command::GetRegionTable { page } => {
                if self.endless_table {
                    (Opcode::More, Vec::new())
                } else {
                    let page = page as usize;
                    match self.table_pages.get(page) {
                        Some(bytes) if page + 1 == self.table_pages.len() => {
                            (Opcode::Data, bytes.clone())
                        }
                        Some(bytes) => (Opcode::More, bytes.clone()),
                        None => (Opcode::Nack, Vec::new()),
                    }
                }
            }
            Command::ReadMemory { start, last } => {
                if last < start {
                    return Ok((Opcode::Nack, Vec::new()));
                }
                let len = last - start + 1;
                let too_long = len > codec.max_payload() as u64;
                let hole = self
                    .unreadable
                    .is_some_and(|addr| (start..=last).contains(&addr));
                if self.nack_next > 0 || too_long || hole {
                    self.nack_next = self.nack_next.saturating_sub(1);
                    (Opcode::Nack, Vec::new())
                } else {
                    if let Some(limit) = self.disconnect_after
                        && self.bytes_served >= limit
                    {
                        self.unplugged = true;
                        return Err(TransportError::Disconnected("mock device gone".into()));
                    }
                    self.bytes_served += len;
                    (Opcode::Data, MockDevice::expected_bytes(start, len as usize))
                }
            }
        };
        Ok(reply)
    }
}

impl Transport for MockDevice {
    fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(TransportError::Disconnected("mock device gone".into()));
        }
        state.frames_received += 1;
        // Half-duplex: an unread response is discarded by the next request.
        state.outbox.clear();

        let Some(variant) = state.variant else {
            return Ok(());
        };
        let codec = variant.codec();
        let Some(command) = codec
            .decode(data)
            .ok()
            .and_then(|frame| Command::parse(frame.opcode, &frame.payload))
        else {
            return Ok(());
        };
        state.requests.push(command);

        if state.drop_next > 0 {
            state.drop_next -= 1;
            return Ok(());
        }

        let (opcode, payload) = state.respond(codec, command)?;
        let Ok(frame) = codec.encode(opcode, &payload) else {
            return Ok(());
        };
        let mut wire = codec.serialize(&frame);
        if state.corrupt_next > 0 {
            state.corrupt_next -= 1;
            if let Some(last) = wire.last_mut() {
                *last ^= 0x01;
            }
        }
        state.outbox.extend(wire);
        Ok(())
    }

    fn recv(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(TransportError::Disconnected("mock device gone".into()));
        }
        if state.outbox.is_empty() {
            return Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        let n = max_len
            .min(state.read_split.unwrap_or(usize::MAX))
            .min(state.outbox.len());
        Ok(state.outbox.drain(..n).collect())
    }

    fn close(&mut self) {
        self.lock().closed = true;
    }

    fn is_connected(&self) -> bool {
        !self.lock().unplugged
    }

    fn describe(&self) -> String {
        match self.lock().variant {
            Some(variant) => format!("mock device ({})", variant),
            None => "mock device (silent)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(5);

    fn request(device: &mut MockDevice, variant: ChipsetVariant, command: Command) {
        let codec = variant.codec();
        let frame = codec.encode_command(&command).unwrap();
        device.send(&codec.serialize(&frame), T).unwrap();
    }

    #[test]
    fn test_answers_identify_in_own_variant_only() {
        let mut device = MockDevice::new(ChipsetVariant::Sboot32);
        request(&mut device, ChipsetVariant::Sboot64, Command::Identify);
        assert!(device.recv(64, T).unwrap_err().is_timeout());

        request(&mut device, ChipsetVariant::Sboot32, Command::Identify);
        let raw = device.recv(64, T).unwrap();
        let frame = ChipsetVariant::Sboot32.codec().decode(&raw).unwrap();
        assert_eq!(frame.opcode, Opcode::Ack);
        assert_eq!(device.frames_received(), 2);
        assert_eq!(device.requests(), vec![Command::Identify]);
    }

    #[test]
    fn test_memory_read_returns_pattern() {
        let mut device = MockDevice::new(ChipsetVariant::Sboot64);
        request(
            &mut device,
            ChipsetVariant::Sboot64,
            Command::ReadMemory {
                start: 0x2000,
                last: 0x200F,
            },
        );
        let raw = device.recv(4096, T).unwrap();
        let frame = ChipsetVariant::Sboot64.codec().decode(&raw).unwrap();
        assert_eq!(frame.payload, MockDevice::expected_bytes(0x2000, 0x10));
    }

    #[test]
    fn test_disconnect_after_budget() {
        let mut device = MockDevice::new(ChipsetVariant::Sboot32);
        device.disconnect_after(0x10);
        let read = Command::ReadMemory {
            start: 0x2000,
            last: 0x200F,
        };
        request(&mut device, ChipsetVariant::Sboot32, read);
        assert!(device.recv(4096, T).is_ok());

        let codec = ChipsetVariant::Sboot32.codec();
        let wire = codec.serialize(&codec.encode_command(&read).unwrap());
        assert!(matches!(
            device.send(&wire, T),
            Err(TransportError::Disconnected(_))
        ));
        assert!(!device.is_connected());
    }
}
