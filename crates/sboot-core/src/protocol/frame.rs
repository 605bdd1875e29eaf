//! Logical frames and the commands built on top of them.

use std::fmt;

use thiserror::Error;

use super::constants::{TAG_DATA_XFER, TAG_POSTAMBLE, TAG_PREAMBLE, TAG_PROBE};

/// Wire-level decode failures. Always transient: the Session re-issues the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Bad checksum: expected 0x{expected:08X}, got 0x{actual:08X}")]
    BadChecksum { expected: u32, actual: u32 },

    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Bad frame magic: {found:02X?}")]
    BadMagic { found: Vec<u8> },

    #[error("Unknown opcode 0x{0:04X}")]
    UnknownOpcode(u16),

    #[error("Payload of {len} bytes exceeds frame limit of {max}")]
    Oversized { len: usize, max: usize },
}

/// Variant-independent operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Handshake / device identification.
    Identify,
    /// Request one page of the region table.
    GetRegionTable,
    /// Read a span of device memory.
    ReadMemory,
    /// End the upload session.
    Postamble,
    /// Positive acknowledgement.
    Ack,
    /// Request rejected by the device.
    Nack,
    /// Final (or only) data payload.
    Data,
    /// Continuation: more pages follow.
    More,
}

impl Opcode {
    pub const ALL: [Opcode; 8] = [
        Opcode::Identify,
        Opcode::GetRegionTable,
        Opcode::ReadMemory,
        Opcode::Postamble,
        Opcode::Ack,
        Opcode::Nack,
        Opcode::Data,
        Opcode::More,
    ];
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Identify => write!(f, "IDENTIFY"),
            Opcode::GetRegionTable => write!(f, "GET_REGION_TABLE"),
            Opcode::ReadMemory => write!(f, "READ_MEMORY"),
            Opcode::Postamble => write!(f, "POSTAMBLE"),
            Opcode::Ack => write!(f, "ACK"),
            Opcode::Nack => write!(f, "NACK"),
            Opcode::Data => write!(f, "DATA"),
            Opcode::More => write!(f, "MORE"),
        }
    }
}

/// One protocol message.
///
/// `checksum` holds the variant-specific integrity value computed over the
/// wire opcode and the payload. Frames produced by a codec always carry a
/// checksum that matches their content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl Frame {
    pub fn is(&self, opcode: Opcode) -> bool {
        self.opcode == opcode
    }
}

/// Host-to-device request with its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Identify,
    /// Region table page, zero-based.
    GetRegionTable { page: u32 },
    /// Read `[start, last]`; `last` is inclusive, as the device expects.
    ReadMemory { start: u64, last: u64 },
    Postamble,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Identify => Opcode::Identify,
            Command::GetRegionTable { .. } => Opcode::GetRegionTable,
            Command::ReadMemory { .. } => Opcode::ReadMemory,
            Command::Postamble => Opcode::Postamble,
        }
    }

    /// Build the request payload. Addresses are rendered as lower-case hex
    /// with `address_digits` digits, each NUL-terminated.
    pub fn payload(&self, address_digits: usize) -> Vec<u8> {
        match *self {
            Command::Identify => TAG_PREAMBLE.to_vec(),
            Command::GetRegionTable { page } => {
                let mut buf = TAG_PROBE.to_vec();
                buf.extend_from_slice(&page.to_le_bytes());
                buf
            }
            Command::ReadMemory { start, last } => {
                let mut buf = TAG_DATA_XFER.to_vec();
                for addr in [start, last] {
                    buf.extend_from_slice(
                        format!("{:0width$x}", addr, width = address_digits).as_bytes(),
                    );
                    buf.push(0);
                }
                buf
            }
            Command::Postamble => TAG_POSTAMBLE.to_vec(),
        }
    }

    /// Parse a request payload back into a command. Used by the simulated
    /// device; returns `None` for anything that is not a well-formed request.
    pub fn parse(opcode: Opcode, payload: &[u8]) -> Option<Self> {
        match opcode {
            Opcode::Identify if payload.starts_with(TAG_PREAMBLE) => Some(Command::Identify),
            Opcode::GetRegionTable => {
                let rest = payload.strip_prefix(TAG_PROBE)?;
                let page = u32::from_le_bytes(rest.get(..4)?.try_into().ok()?);
                Some(Command::GetRegionTable { page })
            }
            Opcode::ReadMemory => {
                let rest = payload.strip_prefix(TAG_DATA_XFER)?;
                let mut fields = rest.split(|&b| b == 0);
                let mut next = || -> Option<u64> {
                    let text = std::str::from_utf8(fields.next()?).ok()?;
                    u64::from_str_radix(text, 16).ok()
                };
                let start = next()?;
                let last = next()?;
                Some(Command::ReadMemory { start, last })
            }
            Opcode::Postamble if payload.starts_with(TAG_POSTAMBLE) => Some(Command::Postamble),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Identify => write!(f, "IDENTIFY"),
            Command::GetRegionTable { page } => write!(f, "GET_REGION_TABLE[{}]", page),
            Command::ReadMemory { start, last } => {
                write!(f, "READ_MEMORY[0x{:X}..=0x{:X}]", start, last)
            }
            Command::Postamble => write!(f, "POSTAMBLE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_payload_32bit_layout() {
        let cmd = Command::ReadMemory {
            start: 0x2000,
            last: 0x2FFF,
        };
        assert_eq!(cmd.payload(8), b"DaTaXfEr\x0000002000\x0000002fff\x00".to_vec());
    }

    #[test]
    fn test_read_payload_parses_back() {
        let cmd = Command::ReadMemory {
            start: 0x8000_0000_1000,
            last: 0x8000_0000_1FFF,
        };
        let payload = cmd.payload(16);
        assert_eq!(Command::parse(Opcode::ReadMemory, &payload), Some(cmd));
    }

    #[test]
    fn test_table_request_carries_page() {
        let payload = Command::GetRegionTable { page: 3 }.payload(8);
        assert!(payload.starts_with(b"PrObE\0"));
        assert_eq!(
            Command::parse(Opcode::GetRegionTable, &payload),
            Some(Command::GetRegionTable { page: 3 })
        );
    }

    #[test]
    fn test_parse_rejects_wrong_tag() {
        assert_eq!(Command::parse(Opcode::Identify, b"PoStAmBlE\0"), None);
    }
}
