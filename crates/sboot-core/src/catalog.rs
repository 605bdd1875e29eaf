//! Region catalog - the device's table of dumpable memory areas.
//!
//! The table ("probe table") is fetched page by page and concatenated into
//! one image:
//!
//! ```text
//! 0x00  device name, NUL-terminated ('+' prefix = 64-bit entries)
//! 0x10  entries...
//!
//! 32-bit entry (0x1C): type:u32 name:[16] start:u32 end:u32
//! 64-bit entry (0x28): type:u32 name:[12] info:u64 start:u64 end:u64
//! ```
//!
//! `end` is inclusive. An all-zero entry, or one starting below 20, ends the table.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::events::UploadObserver;
use crate::protocol::constants::{
    TABLE_ENTRIES_OFFSET, TABLE_ENTRY32_SIZE, TABLE_ENTRY64_SIZE, TABLE_MIN_START,
};
use crate::protocol::{Command, Opcode};
use crate::session::{ProtocolError, Session};
use crate::transport::Transport;

/// Entry layout reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
    Bits32,
    Bits64,
}

impl AddressWidth {
    pub fn entry_size(&self) -> usize {
        match self {
            AddressWidth::Bits32 => TABLE_ENTRY32_SIZE,
            AddressWidth::Bits64 => TABLE_ENTRY64_SIZE,
        }
    }

    fn name_len(&self) -> usize {
        match self {
            AddressWidth::Bits32 => 16,
            AddressWidth::Bits64 => 12,
        }
    }
}

impl fmt::Display for AddressWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressWidth::Bits32 => write!(f, "32-Bit"),
            AddressWidth::Bits64 => write!(f, "64-Bit"),
        }
    }
}

/// One dumpable memory area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub index: usize,
    pub name: String,
    pub start_address: u64,
    /// Always greater than zero.
    pub length: u64,
}

impl Region {
    /// Exclusive end address (saturates at the top of the address space).
    pub fn end_address(&self) -> u64 {
        self.start_address.saturating_add(self.length)
    }

    /// Inclusive last address, as the device reports it.
    pub fn last_address(&self) -> u64 {
        self.start_address + (self.length - 1)
    }

    /// Output file name for a per-region dump. Names that already carry an
    /// extension are used as-is.
    pub fn file_name(&self) -> String {
        if self.name.contains('.') {
            self.name.clone()
        } else {
            format!(
                "{}_{:x}_{:x}.lst",
                self.name,
                self.start_address,
                self.last_address()
            )
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" (0x{:x},0x{:x})",
            self.name,
            self.start_address,
            self.last_address()
        )
    }
}

/// Ordered, immutable list of regions as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCatalog {
    device_name: String,
    width: AddressWidth,
    regions: Vec<Region>,
    raw: Vec<u8>,
}

/// A table entry could not be parsed. Carries what was parsed before it.
#[derive(Error, Debug, Clone)]
#[error("entry {entry}: {reason}")]
pub struct TableError {
    pub entry: usize,
    pub reason: String,
    pub partial: RegionCatalog,
}

impl RegionCatalog {
    /// Parse a complete table image.
    pub fn parse(raw: &[u8]) -> Result<Self, TableError> {
        let name_end = raw
            .iter()
            .take(TABLE_ENTRIES_OFFSET)
            .position(|&b| b == 0)
            .unwrap_or(raw.len().min(TABLE_ENTRIES_OFFSET));
        let name = String::from_utf8_lossy(&raw[..name_end]);
        let (width, device_name) = match name.strip_prefix('+') {
            Some(stripped) => (AddressWidth::Bits64, stripped.to_string()),
            None => (AddressWidth::Bits32, name.to_string()),
        };

        let mut catalog = Self {
            device_name,
            width,
            regions: Vec::new(),
            raw: raw.to_vec(),
        };

        let size = width.entry_size();
        let mut offset = TABLE_ENTRIES_OFFSET;
        while offset < raw.len() {
            let index = catalog.regions.len();
            let remaining = &raw[offset..];
            if remaining.len() < size {
                if remaining.iter().all(|&b| b == 0) {
                    break;
                }
                return Err(catalog.malformed(
                    index,
                    format!("truncated entry ({} of {} bytes)", remaining.len(), size),
                ));
            }

            match parse_entry(&remaining[..size], width) {
                Ok(None) => break,
                Ok(Some((name, start, last))) => {
                    if last < start {
                        return Err(catalog.malformed(
                            index,
                            format!("end 0x{:x} precedes start 0x{:x}", last, start),
                        ));
                    }
                    catalog.regions.push(Region {
                        index,
                        name,
                        start_address: start,
                        length: last - start + 1,
                    });
                }
                Err(reason) => return Err(catalog.malformed(index, reason)),
            }
            offset += size;
        }

        Ok(catalog)
    }

    fn malformed(self, entry: usize, reason: String) -> TableError {
        TableError {
            entry,
            reason,
            partial: self,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn width(&self) -> AddressWidth {
        self.width
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn get(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Table image exactly as received, for saving and re-parsing later.
    pub fn raw_table(&self) -> &[u8] {
        &self.raw
    }

    /// `[lowest start, highest end)` across all regions.
    pub fn span(&self) -> Option<(u64, u64)> {
        let start = self.regions.iter().map(|r| r.start_address).min()?;
        let end = self.regions.iter().map(|r| r.end_address()).max()?;
        Some((start, end))
    }
}

impl fmt::Display for RegionCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}, Devicename: \"{}\"", self.width, self.device_name)?;
        for region in &self.regions {
            writeln!(f, "{}: {}", region.index, region)?;
        }
        Ok(())
    }
}

/// Returns `Ok(None)` for a terminating entry.
fn parse_entry(entry: &[u8], width: AddressWidth) -> Result<Option<(String, u64, u64)>, String> {
    let mut cursor = Cursor::new(entry);
    let io = |e: std::io::Error| e.to_string();

    let _kind = cursor.read_u32::<LittleEndian>().map_err(io)?;
    let name_start = cursor.position() as usize;
    let name_bytes = &entry[name_start..name_start + width.name_len()];
    cursor.set_position((name_start + width.name_len()) as u64);

    let (start, last) = match width {
        AddressWidth::Bits32 => (
            cursor.read_u32::<LittleEndian>().map_err(io)? as u64,
            cursor.read_u32::<LittleEndian>().map_err(io)? as u64,
        ),
        AddressWidth::Bits64 => {
            let _info = cursor.read_u64::<LittleEndian>().map_err(io)?;
            (
                cursor.read_u64::<LittleEndian>().map_err(io)?,
                cursor.read_u64::<LittleEndian>().map_err(io)?,
            )
        }
    };

    if (start == 0 && last == 0) || start < TABLE_MIN_START {
        return Ok(None);
    }

    let name_end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(name_bytes.len());
    let name = std::str::from_utf8(&name_bytes[..name_end])
        .map_err(|_| "region name is not valid UTF-8".to_string())?;

    Ok(Some((name.to_string(), start, last)))
}

#[derive(Debug)]
pub(crate) enum FetchError {
    Malformed(TableError),
    Protocol(ProtocolError),
}

impl From<ProtocolError> for FetchError {
    fn from(e: ProtocolError) -> Self {
        FetchError::Protocol(e)
    }
}

/// Read every table page from the device and parse the result.
#[instrument(skip(session))]
pub(crate) fn fetch<T: Transport, O: UploadObserver>(
    session: &mut Session<T, O>,
) -> Result<RegionCatalog, FetchError> {
    let max_pages = session.config().max_table_pages.max(1);
    let mut raw = Vec::new();

    for page in 0..max_pages {
        let frame = session.call(&Command::GetRegionTable { page })?;
        match frame.opcode {
            Opcode::More => {
                debug!(page, bytes = frame.payload.len(), "Table continuation");
                raw.extend_from_slice(&frame.payload);
            }
            Opcode::Data => {
                raw.extend_from_slice(&frame.payload);
                let catalog = RegionCatalog::parse(&raw).map_err(FetchError::Malformed)?;
                info!(
                    device = %catalog.device_name(),
                    width = %catalog.width(),
                    regions = catalog.len(),
                    pages = page + 1,
                    "Region table received"
                );
                return Ok(catalog);
            }
            Opcode::Nack => {
                return Err(ProtocolError::Rejected {
                    command: Opcode::GetRegionTable,
                }
                .into());
            }
            other => {
                return Err(ProtocolError::UnexpectedResponse {
                    expected: Opcode::Data,
                    actual: other,
                }
                .into());
            }
        }
    }

    // Continuation never ended: keep what parses and report it.
    let reason = format!("table continued past {} pages", max_pages);
    let partial = match RegionCatalog::parse(&raw) {
        Ok(catalog) => catalog,
        Err(e) => e.partial,
    };
    Err(FetchError::Malformed(TableError {
        entry: partial.len(),
        reason,
        partial,
    }))
}

/// Builds table images in the device's format.
#[derive(Debug, Clone)]
pub struct TableBuilder {
    device_name: String,
    width: AddressWidth,
    entries: Vec<(String, u64, u64)>,
}

impl TableBuilder {
    pub fn new(device_name: &str, width: AddressWidth) -> Self {
        Self {
            device_name: device_name.to_string(),
            width,
            entries: Vec::new(),
        }
    }

    /// Add a region of `length` bytes (must be > 0).
    pub fn region(mut self, name: &str, start: u64, length: u64) -> Self {
        self.entries.push((name.to_string(), start, start + length - 1));
        self
    }

    /// Add an entry with an explicit inclusive end, valid or not.
    pub fn raw_entry(mut self, name: &str, start: u64, last: u64) -> Self {
        self.entries.push((name.to_string(), start, last));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TABLE_ENTRIES_OFFSET];
        let mut header = String::new();
        if self.width == AddressWidth::Bits64 {
            header.push('+');
        }
        header.push_str(&self.device_name);
        let n = header.len().min(TABLE_ENTRIES_OFFSET - 1);
        buf[..n].copy_from_slice(&header.as_bytes()[..n]);

        for (kind, (name, start, last)) in self.entries.iter().enumerate() {
            let mut name_field = vec![0u8; self.width.name_len()];
            let n = name.len().min(name_field.len() - 1);
            name_field[..n].copy_from_slice(&name.as_bytes()[..n]);

            // Vec<u8> writes are infallible.
            let _ = buf.write_u32::<LittleEndian>(kind as u32);
            buf.extend_from_slice(&name_field);
            match self.width {
                AddressWidth::Bits32 => {
                    let _ = buf.write_u32::<LittleEndian>(*start as u32);
                    let _ = buf.write_u32::<LittleEndian>(*last as u32);
                }
                AddressWidth::Bits64 => {
                    let _ = buf.write_u64::<LittleEndian>(0);
                    let _ = buf.write_u64::<LittleEndian>(*start);
                    let _ = buf.write_u64::<LittleEndian>(*last);
                }
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChipsetVariant;
    use crate::session::SessionConfig;
    use crate::transport::MockDevice;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            io_timeout_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_32bit_table() {
        let raw = TableBuilder::new("SM-G900F", AddressWidth::Bits32)
            .region("BOOT", 0x1000, 0x200)
            .region("RAM", 0x2000, 0x1000)
            .build();
        let catalog = RegionCatalog::parse(&raw).unwrap();

        assert_eq!(catalog.device_name(), "SM-G900F");
        assert_eq!(catalog.width(), AddressWidth::Bits32);
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.get(1),
            Some(&Region {
                index: 1,
                name: "RAM".into(),
                start_address: 0x2000,
                length: 0x1000,
            })
        );
        assert_eq!(catalog.get(0).unwrap().last_address(), 0x11FF);
    }

    #[test]
    fn test_parse_64bit_table() {
        let raw = TableBuilder::new("SM-G998B", AddressWidth::Bits64)
            .region("DRAM", 0x8000_0000, 0x4000_0000)
            .region("SRAM", 0x0200_0000, 0x10_0000)
            .build();
        let catalog = RegionCatalog::parse(&raw).unwrap();
        assert_eq!(catalog.device_name(), "SM-G998B");
        assert_eq!(catalog.width(), AddressWidth::Bits64);
        assert_eq!(catalog.regions()[0].end_address(), 0xC000_0000);
        assert_eq!(catalog.span(), Some((0x0200_0000, 0xC000_0000)));
    }

    #[test]
    fn test_overlapping_regions_kept_in_device_order() {
        let raw = TableBuilder::new("DEV", AddressWidth::Bits32)
            .region("B", 0x3000, 0x1000)
            .region("A", 0x2000, 0x2000)
            .build();
        let catalog = RegionCatalog::parse(&raw).unwrap();
        let names: Vec<_> = catalog.regions().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["B", "A"]);
    }

    #[test]
    fn test_terminator_entries_end_table() {
        let raw = TableBuilder::new("DEV", AddressWidth::Bits32)
            .region("BOOT", 0x1000, 0x200)
            .raw_entry("", 0, 0)
            .region("LOST", 0x4000, 0x10)
            .build();
        assert_eq!(RegionCatalog::parse(&raw).unwrap().len(), 1);

        let raw = TableBuilder::new("DEV", AddressWidth::Bits32)
            .raw_entry("FILL", 4, 0x100)
            .build();
        assert!(RegionCatalog::parse(&raw).unwrap().is_empty());
    }

    #[test]
    fn test_inverted_entry_is_malformed_with_partial() {
        let raw = TableBuilder::new("DEV", AddressWidth::Bits32)
            .region("BOOT", 0x1000, 0x200)
            .raw_entry("BAD", 0x5000, 0x4000)
            .build();
        let err = RegionCatalog::parse(&raw).unwrap_err();
        assert_eq!(err.entry, 1);
        assert_eq!(err.partial.len(), 1);
        assert_eq!(err.partial.regions()[0].name, "BOOT");
    }

    #[test]
    fn test_truncated_entry_is_malformed() {
        let mut raw = TableBuilder::new("DEV", AddressWidth::Bits32)
            .region("BOOT", 0x1000, 0x200)
            .build();
        raw.extend_from_slice(&[1, 2, 3]);
        assert_eq!(RegionCatalog::parse(&raw).unwrap_err().entry, 1);
    }

    #[test]
    fn test_display_lists_regions() {
        let raw = TableBuilder::new("DEV", AddressWidth::Bits32)
            .region("BOOT", 0x1000, 0x200)
            .build();
        let text = RegionCatalog::parse(&raw).unwrap().to_string();
        assert!(text.contains("32-Bit, Devicename: \"DEV\""));
        assert!(text.contains("0: \"BOOT\" (0x1000,0x11ff)"));
    }

    #[test]
    fn test_region_file_name() {
        let mut region = Region {
            index: 0,
            name: "BOOT".into(),
            start_address: 0x1000,
            length: 0x200,
        };
        assert_eq!(region.file_name(), "BOOT_1000_11ff.lst");
        region.name = "tz.bin".into();
        assert_eq!(region.file_name(), "tz.bin");
    }

    #[test]
    fn test_fetch_paginated_table_once() {
        let table = TableBuilder::new("DEV", AddressWidth::Bits64)
            .region("BOOT", 0x1000, 0x200)
            .region("RAM", 0x2000, 0x1000)
            .build();
        let device = MockDevice::new(ChipsetVariant::Sboot64).with_table(&table, 0x20);
        let handle = device.clone();
        let mut session = Session::new(device, fast_config());
        session.connect().unwrap();

        let before = handle.frames_received();
        assert_eq!(session.regions().unwrap().len(), 2);
        let pages = table.len().div_ceil(0x20);
        assert_eq!(handle.frames_received() - before, pages);

        // Cached: no further traffic.
        assert_eq!(session.regions().unwrap().len(), 2);
        assert_eq!(handle.frames_received() - before, pages);
        assert_eq!(session.catalog().unwrap().raw_table(), table.as_slice());
    }

    #[test]
    fn test_fetch_malformed_keeps_partial_catalog() {
        let table = TableBuilder::new("DEV", AddressWidth::Bits32)
            .region("BOOT", 0x1000, 0x200)
            .raw_entry("BAD", 0x9000, 0x10)
            .build();
        let device = MockDevice::new(ChipsetVariant::Sboot32).with_table(&table, 0x100);
        let mut session = Session::new(device, fast_config());
        session.connect().unwrap();

        assert!(matches!(
            session.regions(),
            Err(ProtocolError::MalformedTable { entry: 1, .. })
        ));
        assert_eq!(session.regions().unwrap().len(), 1);
    }

    #[test]
    fn test_fetch_unbounded_continuation_is_cut_off() {
        let device = MockDevice::new(ChipsetVariant::Sboot32).with_endless_table();
        let config = SessionConfig {
            max_table_pages: 4,
            ..fast_config()
        };
        let mut session = Session::new(device, config);
        session.connect().unwrap();
        assert!(matches!(
            session.regions(),
            Err(ProtocolError::MalformedTable { .. })
        ));
    }
}
