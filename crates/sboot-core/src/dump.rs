//! Dump Engine - streams a memory range from the device into a sink.
//!
//! A request is resolved to a concrete `[start, end)` range, split into
//! chunks no larger than the codec allows and read in ascending order.
//! Every terminal failure carries `last_good_offset`: the number of bytes
//! from the range start that were verified and handed to the sink.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::catalog::RegionCatalog;
use crate::events::{UploadEvent, UploadObserver, UploadPhase};
use crate::protocol::{Command, Opcode};
use crate::session::{ProtocolError, Session};
use crate::sink::DumpSink;
use crate::transport::{Transport, TransportError};

/// What to dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRequest {
    /// Literal `[start_address, end_address)`.
    Range { start_address: u64, end_address: u64 },
    /// One catalog region.
    Region { region_index: usize },
    /// Lowest region start up to highest region end.
    Full,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Range start 0x{start:x} is above end 0x{end:x}")]
    InvertedRange { start: u64, end: u64 },

    #[error("No region {index} (catalog has {available})")]
    UnknownRegion { index: usize, available: usize },

    #[error("Region catalog is empty")]
    EmptyCatalog,
}

impl TransferRequest {
    /// Resolve to `[start, end)` against `catalog`.
    pub fn resolve(&self, catalog: Option<&RegionCatalog>) -> Result<(u64, u64), RequestError> {
        match *self {
            TransferRequest::Range {
                start_address,
                end_address,
            } => {
                if start_address > end_address {
                    return Err(RequestError::InvertedRange {
                        start: start_address,
                        end: end_address,
                    });
                }
                Ok((start_address, end_address))
            }
            TransferRequest::Region { region_index } => {
                let region = catalog.and_then(|c| c.get(region_index)).ok_or(
                    RequestError::UnknownRegion {
                        index: region_index,
                        available: catalog.map_or(0, |c| c.len()),
                    },
                )?;
                Ok((region.start_address, region.end_address()))
            }
            TransferRequest::Full => catalog
                .and_then(|c| c.span())
                .ok_or(RequestError::EmptyCatalog),
        }
    }

    fn needs_catalog(&self) -> bool {
        !matches!(self, TransferRequest::Range { .. })
    }
}

/// Terminal outcomes of a transfer.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("Transfer incomplete after 0x{0:x} bytes: device stopped answering")]
    Incomplete(u64),

    #[error("Device lost after 0x{0:x} bytes")]
    DeviceLost(u64),

    #[error("Transfer cancelled after 0x{0:x} bytes")]
    Cancelled(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("Sink write failed after 0x{last_good_offset:x} bytes: {source}")]
    Sink {
        last_good_offset: u64,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl DumpError {
    /// Verified bytes at the point of failure, if the transfer had started.
    pub fn last_good_offset(&self) -> Option<u64> {
        match self {
            DumpError::Incomplete(n) | DumpError::DeviceLost(n) | DumpError::Cancelled(n) => {
                Some(*n)
            }
            DumpError::Sink {
                last_good_offset, ..
            } => Some(*last_good_offset),
            DumpError::InvalidRequest(_) | DumpError::Protocol(_) => None,
        }
    }
}

/// Transfer accounting, as seen by pollers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    /// Verified bytes from the range start.
    pub last_good_offset: u64,
}

impl TransferProgress {
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.bytes_total
    }
}

/// Shared progress snapshot; the engine writes, any thread may read.
#[derive(Debug, Clone, Default)]
pub struct ProgressMonitor(Arc<Mutex<TransferProgress>>);

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TransferProgress {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, progress: TransferProgress) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = progress;
    }
}

/// Cancellation flag, checked by the engine between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One chunk of a planned transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Offset from the range start.
    pub offset: u64,
    pub address: u64,
    pub len: usize,
}

impl Chunk {
    /// Inclusive last address, as sent to the device.
    pub fn last_address(&self) -> u64 {
        self.address + (self.len as u64 - 1)
    }
}

/// Splits `[start, end)` into consecutive chunks of at most `chunk_size`.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    start: u64,
    total: u64,
    chunk_size: u64,
    /// Byte offset of the next chunk.
    byte_offset: u64,
}

impl ChunkPlan {
    pub fn new(start: u64, end: u64, chunk_size: usize) -> Self {
        Self {
            start,
            total: end.saturating_sub(start),
            chunk_size: chunk_size.max(1) as u64,
            byte_offset: 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn total_chunks(&self) -> u64 {
        self.total.div_ceil(self.chunk_size)
    }

    pub fn is_done(&self) -> bool {
        self.byte_offset >= self.total
    }
}

impl Iterator for ChunkPlan {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.is_done() {
            return None;
        }
        let len = self.chunk_size.min(self.total - self.byte_offset);
        let chunk = Chunk {
            offset: self.byte_offset,
            address: self.start + self.byte_offset,
            len: len as usize,
        };
        self.byte_offset += len;
        Some(chunk)
    }
}

/// Drives one transfer at a time over a ready session.
#[derive(Debug, Clone, Default)]
pub struct DumpEngine {
    monitor: ProgressMonitor,
    cancel: CancelToken,
}

impl DumpEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish progress into `monitor` instead of a private one.
    pub fn with_progress(mut self, monitor: ProgressMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn progress(&self) -> ProgressMonitor {
        self.monitor.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Transfer `request` into `sink`, streaming chunk by chunk.
    ///
    /// The cancel token is cleared when the run starts; only a cancel issued
    /// during this transfer stops it.
    #[instrument(skip(self, session, sink))]
    pub fn run<T: Transport, O: UploadObserver, S: DumpSink + ?Sized>(
        &self,
        session: &mut Session<T, O>,
        request: &TransferRequest,
        sink: &mut S,
    ) -> Result<TransferProgress, DumpError> {
        let (start, end) = resolve(session, request)?;
        let codec = session.codec()?;
        let chunk_size = match session.config().chunk_size {
            Some(cap) if cap > 0 => cap.min(codec.max_payload()),
            _ => codec.max_payload(),
        };
        let attempts = session.config().attempts();
        self.cancel.reset();

        let plan = ChunkPlan::new(start, end, chunk_size);
        let mut progress = TransferProgress {
            bytes_total: plan.total_bytes(),
            ..Default::default()
        };
        self.monitor.publish(progress);
        info!(
            start = format_args!("0x{:x}", start),
            end = format_args!("0x{:x}", end),
            chunk_size,
            chunks = plan.total_chunks(),
            "Starting transfer"
        );
        session.set_phase(UploadPhase::Transfer);

        for chunk in plan {
            if self.cancel.is_cancelled() {
                info!(offset = progress.last_good_offset, "Transfer cancelled");
                flush(sink, progress.last_good_offset)?;
                session.set_phase(UploadPhase::Ready);
                return Err(DumpError::Cancelled(progress.last_good_offset));
            }

            let data = match read_chunk(session, &chunk, attempts) {
                Ok(data) => data,
                Err(e) => {
                    session.set_phase(UploadPhase::Error);
                    // Keep whatever was verified so far.
                    if let Err(flush_err) = flush(sink, progress.last_good_offset) {
                        warn!(error = %e, "Sink flush failed after transfer error");
                        return Err(flush_err);
                    }
                    return Err(e);
                }
            };

            sink.write_chunk(chunk.address, &data)
                .map_err(|source| DumpError::Sink {
                    last_good_offset: progress.last_good_offset,
                    source,
                })?;

            progress.bytes_transferred += data.len() as u64;
            progress.last_good_offset = chunk.offset + data.len() as u64;
            self.monitor.publish(progress);
            session.emit(UploadEvent::Progress {
                operation: "dump".to_string(),
                current: progress.bytes_transferred,
                total: progress.bytes_total,
            });
        }

        flush(sink, progress.last_good_offset)?;
        info!(bytes = progress.bytes_transferred, "Transfer complete");
        session.emit(UploadEvent::Complete);
        session.set_phase(UploadPhase::Complete);
        session.set_phase(UploadPhase::Ready);
        Ok(progress)
    }
}

fn flush<S: DumpSink + ?Sized>(sink: &mut S, last_good_offset: u64) -> Result<(), DumpError> {
    sink.flush().map_err(|source| DumpError::Sink {
        last_good_offset,
        source,
    })
}

fn resolve<T: Transport, O: UploadObserver>(
    session: &mut Session<T, O>,
    request: &TransferRequest,
) -> Result<(u64, u64), DumpError> {
    if !request.needs_catalog() {
        return Ok(request.resolve(None)?);
    }
    match session.regions() {
        Ok(_) => {}
        Err(ProtocolError::MalformedTable { entry, reason }) => {
            warn!(entry, reason = %reason, "Resolving against partial region table");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(request.resolve(session.catalog())?)
}

/// Read one chunk, re-issuing it on timeouts, NACKs and short replies.
fn read_chunk<T: Transport, O: UploadObserver>(
    session: &mut Session<T, O>,
    chunk: &Chunk,
    attempts: u32,
) -> Result<Vec<u8>, DumpError> {
    let command = Command::ReadMemory {
        start: chunk.address,
        last: chunk.last_address(),
    };

    for attempt in 1..=attempts {
        let reason = match session.call(&command) {
            Ok(frame) if frame.is(Opcode::Data) && frame.payload.len() == chunk.len => {
                debug!(address = format_args!("0x{:x}", chunk.address), len = chunk.len, "Chunk received");
                return Ok(frame.payload);
            }
            Ok(frame) if frame.is(Opcode::Data) => {
                session.discard_stale_input();
                format!("short read: {} of {} bytes", frame.payload.len(), chunk.len)
            }
            Ok(frame) => {
                session.discard_stale_input();
                format!("device answered {}", frame.opcode)
            }
            Err(ProtocolError::Transport(
                TransportError::Disconnected(_) | TransportError::Unavailable(_),
            )) => {
                warn!(offset = chunk.offset, "Device lost during transfer");
                return Err(DumpError::DeviceLost(chunk.offset));
            }
            Err(
                e @ (ProtocolError::Unresponsive { .. }
                | ProtocolError::Transport(TransportError::Timeout { .. })),
            ) => e.to_string(),
            Err(e) => {
                warn!(offset = chunk.offset, error = %e, "Transfer aborted");
                return Err(DumpError::Incomplete(chunk.offset));
            }
        };

        warn!(
            address = format_args!("0x{:x}", chunk.address),
            attempt, attempts, "Chunk failed: {}", reason
        );
        session.emit(UploadEvent::Retry {
            command: Opcode::ReadMemory,
            attempt,
            reason,
        });
    }

    Err(DumpError::Incomplete(chunk.offset))
}
