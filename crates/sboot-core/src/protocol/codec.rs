//! Per-chipset frame codecs.
//!
//! Each [`ChipsetVariant`] owns a static [`FrameCodec`] describing its header
//! layout, opcode table, checksum and payload limit. Nothing above this module
//! inspects variant internals.
//!
//! Wire layouts (all little endian):
//!
//! ```text
//! Sboot32: A5 | op:u8  | len:u16 | payload | sum16:u16
//! Sboot64: 'S' 'b' | op:u16 | len:u32 | payload | crc32:u32
//! ```

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use super::checksum::{additive16, crc32};
use super::constants::{SBOOT32_MAX_PAYLOAD, SBOOT64_MAX_PAYLOAD};
use super::frame::{Command, Frame, FramingError, Opcode};

/// Supported chipset protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipsetVariant {
    /// 32-bit addressing, byte opcodes, additive checksum.
    Sboot32,
    /// 64-bit addressing, word opcodes, CRC-32.
    Sboot64,
}

impl ChipsetVariant {
    /// Handshake priority order.
    pub const PRIORITY: [ChipsetVariant; 2] = [ChipsetVariant::Sboot64, ChipsetVariant::Sboot32];

    pub fn codec(&self) -> &'static dyn FrameCodec {
        match self {
            ChipsetVariant::Sboot32 => &Sboot32Codec,
            ChipsetVariant::Sboot64 => &Sboot64Codec,
        }
    }
}

impl fmt::Display for ChipsetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipsetVariant::Sboot32 => write!(f, "sboot32"),
            ChipsetVariant::Sboot64 => write!(f, "sboot64"),
        }
    }
}

/// Variant-specific framing.
///
/// Implementors supply the layout primitives; encoding, serialization and
/// the incremental length probe are shared.
pub trait FrameCodec: Send + Sync {
    fn variant(&self) -> ChipsetVariant;

    /// Largest payload one frame may carry. Larger transfers are chunked by the caller.
    fn max_payload(&self) -> usize;

    /// Hex digits used for addresses in request payloads.
    fn address_digits(&self) -> usize;

    fn header_len(&self) -> usize;

    fn trailer_len(&self) -> usize;

    fn opcode_value(&self, opcode: Opcode) -> u16;

    fn opcode_from(&self, value: u16) -> Option<Opcode>;

    fn checksum(&self, opcode: u16, payload: &[u8]) -> u32;

    fn write_header(&self, buf: &mut Vec<u8>, opcode: u16, len: usize);

    /// Parse `(opcode, payload_len)` from a buffer holding at least `header_len()` bytes.
    fn read_header(&self, header: &[u8]) -> Result<(u16, usize), FramingError>;

    fn write_trailer(&self, buf: &mut Vec<u8>, checksum: u32);

    fn read_trailer(&self, trailer: &[u8]) -> u32;

    /// Build a frame for `opcode` carrying `payload`.
    fn encode(&self, opcode: Opcode, payload: &[u8]) -> Result<Frame, FramingError> {
        if payload.len() > self.max_payload() {
            return Err(FramingError::Oversized {
                len: payload.len(),
                max: self.max_payload(),
            });
        }
        Ok(Frame {
            opcode,
            payload: payload.to_vec(),
            checksum: self.checksum(self.opcode_value(opcode), payload),
        })
    }

    fn encode_command(&self, command: &Command) -> Result<Frame, FramingError> {
        self.encode(command.opcode(), &command.payload(self.address_digits()))
    }

    /// Wire bytes for a frame.
    fn serialize(&self, frame: &Frame) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(self.header_len() + frame.payload.len() + self.trailer_len());
        self.write_header(&mut buf, self.opcode_value(frame.opcode), frame.payload.len());
        buf.extend_from_slice(&frame.payload);
        self.write_trailer(&mut buf, frame.checksum);
        buf
    }

    /// Total frame length once enough of the header has arrived, `None` before that.
    fn frame_len(&self, partial: &[u8]) -> Result<Option<usize>, FramingError> {
        if partial.len() < self.header_len() {
            return Ok(None);
        }
        let (_, len) = self.read_header(partial)?;
        if len > self.max_payload() {
            return Err(FramingError::Oversized {
                len,
                max: self.max_payload(),
            });
        }
        Ok(Some(self.header_len() + len + self.trailer_len()))
    }

    /// Decode one frame from the start of `raw`.
    fn decode(&self, raw: &[u8]) -> Result<Frame, FramingError> {
        let Some(total) = self.frame_len(raw)? else {
            return Err(FramingError::Truncated {
                expected: self.header_len(),
                actual: raw.len(),
            });
        };
        if raw.len() < total {
            return Err(FramingError::Truncated {
                expected: total,
                actual: raw.len(),
            });
        }

        let (op, len) = self.read_header(raw)?;
        let body_start = self.header_len();
        let payload = &raw[body_start..body_start + len];
        let received = self.read_trailer(&raw[body_start + len..total]);
        let expected = self.checksum(op, payload);
        if received != expected {
            return Err(FramingError::BadChecksum {
                expected,
                actual: received,
            });
        }

        let opcode = self.opcode_from(op).ok_or(FramingError::UnknownOpcode(op))?;
        Ok(Frame {
            opcode,
            payload: payload.to_vec(),
            checksum: received,
        })
    }
}

/// 32-bit family codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sboot32Codec;

impl Sboot32Codec {
    pub const SYNC: u8 = 0xA5;

    const OPCODES: [(Opcode, u8); 8] = [
        (Opcode::Identify, 0x01),
        (Opcode::GetRegionTable, 0x02),
        (Opcode::ReadMemory, 0x03),
        (Opcode::Postamble, 0x04),
        (Opcode::Ack, 0x06),
        (Opcode::Data, 0x10),
        (Opcode::More, 0x11),
        (Opcode::Nack, 0x15),
    ];
}

impl FrameCodec for Sboot32Codec {
    fn variant(&self) -> ChipsetVariant {
        ChipsetVariant::Sboot32
    }

    fn max_payload(&self) -> usize {
        SBOOT32_MAX_PAYLOAD
    }

    fn address_digits(&self) -> usize {
        8
    }

    fn header_len(&self) -> usize {
        4
    }

    fn trailer_len(&self) -> usize {
        2
    }

    fn opcode_value(&self, opcode: Opcode) -> u16 {
        Self::OPCODES
            .iter()
            .find(|(op, _)| *op == opcode)
            .map(|&(_, v)| v as u16)
            .unwrap_or_default()
    }

    fn opcode_from(&self, value: u16) -> Option<Opcode> {
        Self::OPCODES
            .iter()
            .find(|&&(_, v)| v as u16 == value)
            .map(|&(op, _)| op)
    }

    fn checksum(&self, opcode: u16, payload: &[u8]) -> u32 {
        additive16([&[opcode as u8][..], payload]) as u32
    }

    fn write_header(&self, buf: &mut Vec<u8>, opcode: u16, len: usize) {
        buf.push(Self::SYNC);
        buf.push(opcode as u8);
        buf.extend_from_slice(&(len as u16).to_le_bytes());
    }

    fn read_header(&self, header: &[u8]) -> Result<(u16, usize), FramingError> {
        if header[0] != Self::SYNC {
            return Err(FramingError::BadMagic {
                found: header[..1].to_vec(),
            });
        }
        let mut cursor = Cursor::new(&header[1..4]);
        let op = cursor.read_u8().map_err(|_| truncated(4, header.len()))?;
        let len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| truncated(4, header.len()))?;
        Ok((op as u16, len as usize))
    }

    fn write_trailer(&self, buf: &mut Vec<u8>, checksum: u32) {
        buf.extend_from_slice(&(checksum as u16).to_le_bytes());
    }

    fn read_trailer(&self, trailer: &[u8]) -> u32 {
        u16::from_le_bytes([trailer[0], trailer[1]]) as u32
    }
}

/// 64-bit family codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sboot64Codec;

impl Sboot64Codec {
    pub const MAGIC: [u8; 2] = *b"Sb";

    const OPCODES: [(Opcode, u16); 8] = [
        (Opcode::Identify, 0x5001),
        (Opcode::GetRegionTable, 0x5002),
        (Opcode::ReadMemory, 0x5003),
        (Opcode::Postamble, 0x5004),
        (Opcode::Ack, 0x5A06),
        (Opcode::Data, 0x5A10),
        (Opcode::More, 0x5A11),
        (Opcode::Nack, 0x5A15),
    ];
}

impl FrameCodec for Sboot64Codec {
    fn variant(&self) -> ChipsetVariant {
        ChipsetVariant::Sboot64
    }

    fn max_payload(&self) -> usize {
        SBOOT64_MAX_PAYLOAD
    }

    fn address_digits(&self) -> usize {
        16
    }

    fn header_len(&self) -> usize {
        8
    }

    fn trailer_len(&self) -> usize {
        4
    }

    fn opcode_value(&self, opcode: Opcode) -> u16 {
        Self::OPCODES
            .iter()
            .find(|(op, _)| *op == opcode)
            .map(|&(_, v)| v)
            .unwrap_or_default()
    }

    fn opcode_from(&self, value: u16) -> Option<Opcode> {
        Self::OPCODES
            .iter()
            .find(|&&(_, v)| v == value)
            .map(|&(op, _)| op)
    }

    fn checksum(&self, opcode: u16, payload: &[u8]) -> u32 {
        crc32([&opcode.to_le_bytes()[..], payload])
    }

    fn write_header(&self, buf: &mut Vec<u8>, opcode: u16, len: usize) {
        buf.extend_from_slice(&Self::MAGIC);
        // Vec<u8> writes are infallible.
        let _ = buf.write_u16::<LittleEndian>(opcode);
        let _ = buf.write_u32::<LittleEndian>(len as u32);
    }

    fn read_header(&self, header: &[u8]) -> Result<(u16, usize), FramingError> {
        if header[..2] != Self::MAGIC {
            return Err(FramingError::BadMagic {
                found: header[..2].to_vec(),
            });
        }
        let mut cursor = Cursor::new(&header[2..8]);
        let op = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| truncated(8, header.len()))?;
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated(8, header.len()))?;
        Ok((op, len as usize))
    }

    fn write_trailer(&self, buf: &mut Vec<u8>, checksum: u32) {
        buf.extend_from_slice(&checksum.to_le_bytes());
    }

    fn read_trailer(&self, trailer: &[u8]) -> u32 {
        u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]])
    }
}

fn truncated(expected: usize, actual: usize) -> FramingError {
    FramingError::Truncated { expected, actual }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VARIANTS: [ChipsetVariant; 2] = [ChipsetVariant::Sboot32, ChipsetVariant::Sboot64];

    fn arb_opcode() -> impl Strategy<Value = Opcode> {
        proptest::sample::select(Opcode::ALL.to_vec())
    }

    fn arb_variant() -> impl Strategy<Value = ChipsetVariant> {
        proptest::sample::select(VARIANTS.to_vec())
    }

    proptest! {
        /// Every variant recovers opcode and payload from its own wire bytes.
        #[test]
        fn decode_recovers_encoded_frame(
            variant in arb_variant(),
            opcode in arb_opcode(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let codec = variant.codec();
            let frame = codec.encode(opcode, &payload).unwrap();
            let decoded = codec.decode(&codec.serialize(&frame)).unwrap();
            prop_assert_eq!(decoded.opcode, opcode);
            prop_assert_eq!(decoded.payload, payload);
        }

        /// A single flipped payload bit is always caught by the checksum.
        #[test]
        fn payload_bit_flip_is_bad_checksum(
            variant in arb_variant(),
            opcode in arb_opcode(),
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            bit in any::<proptest::sample::Index>(),
        ) {
            let codec = variant.codec();
            let mut wire = codec.serialize(&codec.encode(opcode, &payload).unwrap());
            let bit = bit.index(payload.len() * 8);
            wire[codec.header_len() + bit / 8] ^= 1 << (bit % 8);
            let is_bad_checksum = matches!(
                codec.decode(&wire),
                Err(FramingError::BadChecksum { .. })
            );
            prop_assert!(is_bad_checksum);
        }
    }

    #[test]
    fn test_sboot32_wire_layout() {
        let codec = ChipsetVariant::Sboot32.codec();
        let frame = codec.encode(Opcode::Ack, &[0x01, 0x02]).unwrap();
        assert_eq!(codec.serialize(&frame), vec![0xA5, 0x06, 0x02, 0x00, 0x01, 0x02, 0x09, 0x00]);
    }

    #[test]
    fn test_sboot64_wire_layout() {
        let codec = ChipsetVariant::Sboot64.codec();
        let frame = codec.encode(Opcode::Data, b"xy").unwrap();
        let wire = codec.serialize(&frame);
        assert_eq!(&wire[..8], &[b'S', b'b', 0x10, 0x5A, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&wire[8..10], b"xy");
        assert_eq!(wire.len(), 14);
    }

    #[test]
    fn test_truncated_frames() {
        for variant in VARIANTS {
            let codec = variant.codec();
            let wire = codec.serialize(&codec.encode(Opcode::Data, &[7u8; 32]).unwrap());
            for cut in [1, codec.header_len() - 1, codec.header_len() + 5, wire.len() - 1] {
                assert!(
                    matches!(codec.decode(&wire[..cut]), Err(FramingError::Truncated { .. })),
                    "{variant} cut at {cut}"
                );
            }
        }
    }

    #[test]
    fn test_foreign_variant_frame_is_rejected() {
        let a = ChipsetVariant::Sboot32.codec();
        let b = ChipsetVariant::Sboot64.codec();
        let wire = a.serialize(&a.encode_command(&Command::Identify).unwrap());
        assert!(b.decode(&wire).is_err());
        let wire = b.serialize(&b.encode_command(&Command::Identify).unwrap());
        assert!(a.decode(&wire).is_err());
    }

    #[test]
    fn test_oversized_payload() {
        let codec = ChipsetVariant::Sboot32.codec();
        let payload = vec![0u8; codec.max_payload() + 1];
        assert!(matches!(
            codec.encode(Opcode::Data, &payload),
            Err(FramingError::Oversized { .. })
        ));
    }

    #[test]
    fn test_frame_len_from_partial_header() {
        let codec = ChipsetVariant::Sboot64.codec();
        let wire = codec.serialize(&codec.encode(Opcode::More, &[0u8; 100]).unwrap());
        assert_eq!(codec.frame_len(&wire[..4]).unwrap(), None);
        assert_eq!(codec.frame_len(&wire[..8]).unwrap(), Some(wire.len()));
    }

    #[test]
    fn test_unknown_opcode() {
        let codec = ChipsetVariant::Sboot32.codec();
        let mut wire = vec![0xA5, 0x7F, 0x00, 0x00];
        wire.extend_from_slice(&(0x7Fu16).to_le_bytes());
        assert_eq!(codec.decode(&wire), Err(FramingError::UnknownOpcode(0x7F)));
    }
}
