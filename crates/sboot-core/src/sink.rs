//! Destinations for dumped memory.
//!
//! The dump engine hands over chunks strictly in ascending address order,
//! each exactly once. Sinks only need to place them.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Receives verified chunks of device memory.
pub trait DumpSink {
    /// Store `data`, which was read from device address `address`.
    fn write_chunk(&mut self, address: u64, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: DumpSink + ?Sized> DumpSink for &mut S {
    fn write_chunk(&mut self, address: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_chunk(address, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

impl<S: DumpSink + ?Sized> DumpSink for Box<S> {
    fn write_chunk(&mut self, address: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_chunk(address, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Image file where the byte at `address` lands at offset `address - base`.
pub struct FileSink {
    file: File,
    path: PathBuf,
    base: u64,
}

impl FileSink {
    /// Create (or truncate) `path`.
    pub fn create<P: AsRef<Path>>(path: P, base: u64) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            base,
        })
    }

    /// Open `path` for writing without truncating, so an interrupted dump
    /// can be continued in place.
    pub fn resume<P: AsRef<Path>>(path: P, base: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            base,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DumpSink for FileSink {
    fn write_chunk(&mut self, address: u64, data: &[u8]) -> io::Result<()> {
        let offset = address.checked_sub(self.base).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address 0x{:x} below image base 0x{:x}", address, self.base),
            )
        })?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        debug!(path = %self.path.display(), "Image flushed");
        Ok(())
    }
}

/// In-memory sink that insists on contiguous delivery.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    base: Option<u64>,
    data: Vec<u8>,
    chunks: Vec<(u64, usize)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the first byte received.
    pub fn base(&self) -> Option<u64> {
        self.base
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// `(address, len)` of every chunk, in delivery order.
    pub fn chunks(&self) -> &[(u64, usize)] {
        &self.chunks
    }
}

impl DumpSink for MemorySink {
    fn write_chunk(&mut self, address: u64, data: &[u8]) -> io::Result<()> {
        let base = *self.base.get_or_insert(address);
        let expected = base + self.data.len() as u64;
        if address != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk at 0x{:x}, expected 0x{:x}", address, expected),
            ));
        }
        self.data.extend_from_slice(data);
        self.chunks.push((address, data.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_rejects_gap() {
        let mut sink = MemorySink::new();
        sink.write_chunk(0x100, &[1, 2]).unwrap();
        sink.write_chunk(0x102, &[3]).unwrap();
        assert!(sink.write_chunk(0x200, &[4]).is_err());
        assert_eq!(sink.base(), Some(0x100));
        assert_eq!(sink.data(), &[1, 2, 3]);
        assert_eq!(sink.chunks(), &[(0x100, 2), (0x102, 1)]);
    }

    #[test]
    fn test_file_sink_places_by_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ram.lst");
        let mut sink = FileSink::create(&path, 0x2000).unwrap();
        sink.write_chunk(0x2000, b"abcd").unwrap();
        sink.write_chunk(0x2004, b"efgh").unwrap();
        sink.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefgh");
        assert!(sink.write_chunk(0x1000, b"x").is_err());
    }

    #[test]
    fn test_file_sink_resume_keeps_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ram.lst");
        std::fs::write(&path, b"abcdXXXX").unwrap();

        let mut sink = FileSink::resume(&path, 0x2000).unwrap();
        sink.write_chunk(0x2004, b"efgh").unwrap();
        sink.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefgh");
    }
}
