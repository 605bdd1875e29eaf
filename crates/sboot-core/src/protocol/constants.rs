//! Protocol constants for S-Boot upload mode.
//!
//! Magic tags and wire constants observed on upload-mode boot loaders.

// ============================================================================
// Device Identification
// ============================================================================

/// Samsung Electronics Vendor ID
pub const SAMSUNG_VENDOR_ID: u16 = 0x04E8;

/// Upload mode modem Product ID (CDC ACM)
pub const UPLOAD_MODE_PRODUCT_ID: u16 = 0x685D;

/// USB interface class carrying the bulk pipes (CDC Data)
pub const CDC_DATA_INTERFACE_CLASS: u8 = 0x0A;

/// Default baud rate for serial links
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ============================================================================
// Magic Tags (NUL-terminated on the wire)
// ============================================================================

/// Session open / identify
pub const TAG_PREAMBLE: &[u8] = b"PrEaMbLe\0";

/// Positive acknowledgement
pub const TAG_ACKNOWLEDGMENT: &[u8] = b"AcKnOwLeDgMeNt\0";

/// Region table request
pub const TAG_PROBE: &[u8] = b"PrObE\0";

/// Memory transfer request
pub const TAG_DATA_XFER: &[u8] = b"DaTaXfEr\0";

/// Session end
pub const TAG_POSTAMBLE: &[u8] = b"PoStAmBlE\0";

// ============================================================================
// Size Constants
// ============================================================================

/// Largest payload carried by a single 32-bit variant frame.
pub const SBOOT32_MAX_PAYLOAD: usize = 0x8000;

/// Largest payload carried by a single 64-bit variant frame.
pub const SBOOT64_MAX_PAYLOAD: usize = 0x20000;

/// Largest single transport read.
pub const MAX_READ_SIZE: usize = 0x4000;

/// Offset of the first region entry in a probe table.
pub const TABLE_ENTRIES_OFFSET: usize = 0x10;

/// 32-bit probe table entry size.
pub const TABLE_ENTRY32_SIZE: usize = 0x1C;

/// 64-bit probe table entry size.
pub const TABLE_ENTRY64_SIZE: usize = 0x28;

/// Entries starting below this address are filler and end the table.
pub const TABLE_MIN_START: u64 = 20;

// ============================================================================
// Timing / Retry Defaults
// ============================================================================

/// Default per-read/write deadline.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;

/// Default attempts per request before a command is declared unresponsive.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Default passes over the variant list during handshake.
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 3;

/// Default bound on region table continuation pages.
pub const DEFAULT_MAX_TABLE_PAGES: u32 = 64;
