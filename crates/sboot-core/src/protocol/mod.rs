//! Protocol module - upload mode wire definitions.

pub mod checksum;
pub mod codec;
pub mod constants;
pub mod frame;
pub mod tag;

pub use codec::{ChipsetVariant, FrameCodec, Sboot32Codec, Sboot64Codec};
pub use constants::*;
pub use frame::{Command, Frame, FramingError, Opcode};
pub use tag::Tag;
