//! Upload Session - handshake and request/response engine.
//!
//! A session owns its transport exclusively. The protocol is strictly
//! half-duplex: one request, one response frame, no pipelining.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{self, RegionCatalog};
use crate::events::{
    LogLevel, PacketDirection, TracingObserver, UploadEvent, UploadObserver, UploadPhase,
};
use crate::protocol::constants::{
    DEFAULT_HANDSHAKE_ATTEMPTS, DEFAULT_IO_TIMEOUT_MS, DEFAULT_MAX_TABLE_PAGES,
    DEFAULT_RETRY_BUDGET, MAX_READ_SIZE, TAG_ACKNOWLEDGMENT,
};
use crate::protocol::{ChipsetVariant, Command, Frame, FrameCodec, FramingError, Opcode, Tag};
use crate::transport::{Transport, TransportError};

const STALE_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);
const STALE_DRAIN_READS: usize = 8;

/// Logical protocol failures, surfaced after local retry budgets are spent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unsupported device: no chipset variant answered after {attempts} handshake attempts")]
    UnsupportedDevice { attempts: u32 },

    #[error("Device unresponsive to {command} after {attempts} attempts")]
    Unresponsive { command: Opcode, attempts: u32 },

    #[error("Malformed region table entry {entry}: {reason}")]
    MalformedTable { entry: usize, reason: String },

    #[error("Device rejected {command}")]
    Rejected { command: Opcode },

    #[error("Expected {expected} response, got {actual}")]
    UnexpectedResponse { expected: Opcode, actual: Opcode },

    #[error("Session not ready (state: {0})")]
    NotReady(SessionState),

    #[error("Cannot encode request: {0}")]
    Encode(FramingError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Ready,
    Busy,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Handshaking => write!(f, "HANDSHAKING"),
            SessionState::Ready => write!(f, "READY"),
            SessionState::Busy => write!(f, "BUSY"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Configuration for an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-read/write deadline in milliseconds.
    pub io_timeout_ms: u64,
    /// Attempts per request before it is declared unresponsive.
    pub retry_budget: u32,
    /// Passes over `variants` during handshake.
    pub handshake_attempts: u32,
    /// Handshake priority order.
    pub variants: Vec<ChipsetVariant>,
    /// Optional cap on transfer chunk size, below the codec maximum.
    pub chunk_size: Option<usize>,
    /// Bound on region table continuation pages.
    pub max_table_pages: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            handshake_attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            variants: ChipsetVariant::PRIORITY.to_vec(),
            chunk_size: None,
            max_table_pages: DEFAULT_MAX_TABLE_PAGES,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Attempts per request, never less than one.
    pub fn attempts(&self) -> u32 {
        self.retry_budget.max(1)
    }
}

/// Failure of a single request/response exchange.
#[derive(Debug)]
enum AttemptError {
    Framing(FramingError),
    Transport(TransportError),
}

impl From<FramingError> for AttemptError {
    fn from(e: FramingError) -> Self {
        AttemptError::Framing(e)
    }
}

impl From<TransportError> for AttemptError {
    fn from(e: TransportError) -> Self {
        AttemptError::Transport(e)
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Framing(e) => write!(f, "{}", e),
            AttemptError::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// Upload Session - owns the transport and the negotiated codec.
pub struct Session<T: Transport, O: UploadObserver = TracingObserver> {
    transport: T,
    config: SessionConfig,
    observer: Arc<O>,
    state: SessionState,
    phase: UploadPhase,
    codec: Option<&'static dyn FrameCodec>,
    catalog: Option<RegionCatalog>,
    /// A reply to an earlier attempt may still be in flight.
    stale_input: bool,
}

impl<T: Transport> Session<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: Transport, O: UploadObserver> Session<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: T, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            transport,
            config,
            observer,
            state: SessionState::Disconnected,
            phase: UploadPhase::Connecting,
            codec: None,
            catalog: None,
            stale_input: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Variant negotiated during handshake.
    pub fn variant(&self) -> Option<ChipsetVariant> {
        self.codec.map(|c| c.variant())
    }

    /// Active codec; only available once the handshake succeeded.
    pub fn codec(&self) -> Result<&'static dyn FrameCodec, ProtocolError> {
        self.codec.ok_or(ProtocolError::NotReady(self.state))
    }

    /// Region catalog if it has been fetched (possibly partial).
    pub fn catalog(&self) -> Option<&RegionCatalog> {
        self.catalog.as_ref()
    }

    pub(crate) fn emit(&self, event: UploadEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn set_phase(&mut self, to: UploadPhase) {
        if self.phase != to {
            let from = self.phase;
            self.phase = to;
            self.emit(UploadEvent::PhaseChanged { from, to });
        }
    }

    /// Identify the device, trying each configured variant in priority order.
    #[instrument(skip(self))]
    pub fn connect(&mut self) -> Result<ChipsetVariant, ProtocolError> {
        match self.state {
            SessionState::Ready => {
                if let Some(variant) = self.variant() {
                    return Ok(variant);
                }
            }
            SessionState::Disconnected => {}
            other => return Err(ProtocolError::NotReady(other)),
        }

        self.emit(UploadEvent::DeviceConnected {
            description: self.transport.describe(),
        });
        self.state = SessionState::Handshaking;
        self.set_phase(UploadPhase::Handshake);

        let passes = self.config.handshake_attempts.max(1);
        let variants = self.config.variants.clone();
        for pass in 1..=passes {
            for &variant in &variants {
                let codec = variant.codec();
                let Ok(identify) = codec.encode_command(&Command::Identify) else {
                    continue;
                };
                debug!(variant = %variant, pass, "Sending identify");
                match self.exchange(codec, &identify) {
                    Ok(frame) if is_identify_ack(&frame) => {
                        self.codec = Some(codec);
                        self.state = SessionState::Ready;
                        info!(variant = %variant, "Handshake complete");
                        self.emit(UploadEvent::VariantDetected { variant });
                        self.set_phase(UploadPhase::Ready);
                        return Ok(variant);
                    }
                    Ok(frame) => {
                        debug!(variant = %variant, opcode = %frame.opcode, "Not an identify ack");
                    }
                    Err(AttemptError::Transport(e)) if !e.is_timeout() => {
                        self.state = SessionState::Disconnected;
                        self.set_phase(UploadPhase::Error);
                        self.emit(UploadEvent::DeviceDisconnected);
                        return Err(e.into());
                    }
                    Err(e) => {
                        debug!(variant = %variant, error = %e, "No identify response");
                        self.discard_stale_input();
                    }
                }
            }
        }

        warn!(passes, "No chipset variant answered");
        self.state = SessionState::Disconnected;
        self.set_phase(UploadPhase::Error);
        Err(ProtocolError::UnsupportedDevice { attempts: passes })
    }

    /// Send one request and return its response frame.
    ///
    /// Framing errors and timeouts are retried with the same request up to
    /// the retry budget. Disconnects are returned immediately. Replies carry
    /// no request id, so input left over from a failed attempt is drained
    /// before anything else is sent.
    #[instrument(skip_all, fields(command = %command))]
    pub fn call(&mut self, command: &Command) -> Result<Frame, ProtocolError> {
        if self.state != SessionState::Ready {
            return Err(ProtocolError::NotReady(self.state));
        }
        let codec = self.codec()?;
        let request = codec
            .encode_command(command)
            .map_err(ProtocolError::Encode)?;
        let attempts = self.config.attempts();

        self.state = SessionState::Busy;
        for attempt in 1..=attempts {
            if self.stale_input {
                self.discard_stale_input();
            }
            match self.exchange(codec, &request) {
                Ok(frame) => {
                    // The reply to a retried request may still follow.
                    self.stale_input = attempt > 1;
                    self.state = SessionState::Ready;
                    return Ok(frame);
                }
                Err(AttemptError::Transport(e)) if !e.is_timeout() => {
                    warn!(error = %e, "Transport lost during call");
                    self.state = SessionState::Disconnected;
                    self.emit(UploadEvent::DeviceDisconnected);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Request failed");
                    self.stale_input = true;
                    self.emit(UploadEvent::Retry {
                        command: command.opcode(),
                        attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.state = SessionState::Ready;
        Err(ProtocolError::Unresponsive {
            command: command.opcode(),
            attempts,
        })
    }

    /// Region catalog, fetched from the device on first access.
    ///
    /// A malformed table is reported once; the partial catalog stays cached
    /// and is returned by later calls.
    pub fn regions(&mut self) -> Result<&RegionCatalog, ProtocolError> {
        if self.catalog.is_none() {
            self.set_phase(UploadPhase::RegionTable);
            let fetched = catalog::fetch(self);
            self.set_phase(UploadPhase::Ready);
            match fetched {
                Ok(catalog) => {
                    self.emit(UploadEvent::RegionTable {
                        device_name: catalog.device_name().to_string(),
                        regions: catalog.len(),
                    });
                    self.catalog = Some(catalog);
                }
                Err(catalog::FetchError::Malformed(table_error)) => {
                    self.emit(UploadEvent::Log {
                        level: LogLevel::Warn,
                        message: format!(
                            "Region table malformed ({}), keeping partial catalog",
                            table_error
                        ),
                    });
                    let err = ProtocolError::MalformedTable {
                        entry: table_error.entry,
                        reason: table_error.reason.clone(),
                    };
                    self.emit(UploadEvent::RegionTable {
                        device_name: table_error.partial.device_name().to_string(),
                        regions: table_error.partial.len(),
                    });
                    self.catalog = Some(table_error.partial);
                    return Err(err);
                }
                Err(catalog::FetchError::Protocol(e)) => return Err(e),
            }
        }
        self.catalog.as_ref().ok_or(ProtocolError::NotReady(self.state))
    }

    /// Send the postamble (best effort) and release the transport. Idempotent.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.set_phase(UploadPhase::Closing);
        if let (SessionState::Ready | SessionState::Busy, Some(codec)) = (self.state, self.codec)
            && let Ok(postamble) = codec.encode_command(&Command::Postamble)
        {
            match self.exchange(codec, &postamble) {
                Ok(frame) => debug!(opcode = %frame.opcode, "Postamble acknowledged"),
                Err(e) => debug!(error = %e, "Postamble not acknowledged"),
            }
        }
        self.transport.close();
        self.state = SessionState::Closed;
        info!("Session closed");
    }

    /// One attempt: send the request, read back one frame.
    fn exchange(
        &mut self,
        codec: &'static dyn FrameCodec,
        frame: &Frame,
    ) -> Result<Frame, AttemptError> {
        let wire = codec.serialize(frame);
        let timeout = self.config.io_timeout();

        self.transport.send(&wire, timeout)?;
        self.emit(UploadEvent::Packet {
            direction: PacketDirection::Tx,
            opcode: frame.opcode,
            length: wire.len(),
        });

        let response = self.read_frame(codec, timeout)?;
        self.emit(UploadEvent::Packet {
            direction: PacketDirection::Rx,
            opcode: response.opcode,
            length: response.payload.len(),
        });
        Ok(response)
    }

    /// Accumulate reads until one complete frame has arrived.
    fn read_frame(
        &mut self,
        codec: &'static dyn FrameCodec,
        timeout: Duration,
    ) -> Result<Frame, AttemptError> {
        let mut buf: Vec<u8> = Vec::new();
        let mut empty_reads = 0u32;

        loop {
            let needed = codec.frame_len(&buf)?;
            if let Some(total) = needed
                && buf.len() >= total
            {
                return Ok(codec.decode(&buf[..total])?);
            }

            let want = match needed {
                Some(total) => total - buf.len(),
                None => codec.header_len() - buf.len(),
            }
            .min(MAX_READ_SIZE);

            let chunk = match self.transport.recv(want, timeout) {
                Ok(chunk) => chunk,
                Err(e) if e.is_timeout() && !buf.is_empty() => {
                    return Err(FramingError::Truncated {
                        expected: needed.unwrap_or(codec.header_len()),
                        actual: buf.len(),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            };

            if chunk.is_empty() {
                empty_reads += 1;
                if empty_reads >= 3 {
                    return Err(TransportError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .into());
                }
                continue;
            }
            buf.extend_from_slice(&chunk);
        }
    }

    /// Drop whatever is still in flight so the next frame read belongs to
    /// the next request. Bounded: stops at the first quiet read.
    pub(crate) fn discard_stale_input(&mut self) {
        self.stale_input = false;
        let timeout = self.config.io_timeout().min(STALE_DRAIN_TIMEOUT);
        for _ in 0..STALE_DRAIN_READS {
            match self.transport.recv(MAX_READ_SIZE, timeout) {
                Ok(stale) if !stale.is_empty() => {
                    debug!(bytes = stale.len(), "Discarded stale bytes");
                }
                _ => break,
            }
        }
    }
}

impl<T: Transport, O: UploadObserver> Drop for Session<T, O> {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_identify_ack(frame: &Frame) -> bool {
    frame.is(Opcode::Ack) && Tag::leading(&frame.payload).matches(TAG_ACKNOWLEDGMENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::transport::{MockDevice, MockTransport};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            io_timeout_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_handshake_detects_each_variant() {
        for variant in [ChipsetVariant::Sboot32, ChipsetVariant::Sboot64] {
            let device = MockDevice::new(variant);
            let mut session = Session::new(device, fast_config());
            assert_eq!(session.connect().unwrap(), variant);
            assert_eq!(session.state(), SessionState::Ready);
            assert_eq!(session.variant(), Some(variant));
        }
    }

    #[test]
    fn test_handshake_unknown_device_is_unsupported() {
        let device = MockDevice::unresponsive();
        let handle = device.clone();
        let mut session = Session::new(device, fast_config());

        let err = session.connect().unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedDevice { attempts: 3 });
        assert_ne!(session.state(), SessionState::Ready);
        // Three passes over both variants.
        assert_eq!(handle.frames_received(), 6);
    }

    #[test]
    fn test_handshake_ignores_non_ack_identify_response() {
        let mock = MockTransport::new();
        mock.queue_frame(ChipsetVariant::Sboot64, Opcode::Ack, b"PoStAmBlE\0");
        mock.queue_frame(ChipsetVariant::Sboot32, Opcode::Ack, TAG_ACKNOWLEDGMENT);
        let mut session = Session::new(mock, fast_config());
        assert_eq!(session.connect().unwrap(), ChipsetVariant::Sboot32);
    }

    #[test]
    fn test_call_requires_ready() {
        let mut session = Session::new(MockTransport::new(), fast_config());
        assert_eq!(
            session.call(&Command::Identify).unwrap_err(),
            ProtocolError::NotReady(SessionState::Disconnected)
        );
    }

    #[test]
    fn test_call_retries_corrupted_response() {
        let device = MockDevice::new(ChipsetVariant::Sboot64);
        let handle = device.clone();
        let observer = Arc::new(RecordingObserver::new());
        let mut session = Session::with_observer(device, fast_config(), observer.clone());
        session.connect().unwrap();

        handle.corrupt_next(2);
        let frame = session
            .call(&Command::ReadMemory {
                start: 0x100,
                last: 0x10F,
            })
            .unwrap();
        assert_eq!(frame.opcode, Opcode::Data);
        assert_eq!(frame.payload, MockDevice::expected_bytes(0x100, 0x10));

        let retries = observer
            .events()
            .iter()
            .filter(|e| matches!(e, UploadEvent::Retry { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[test]
    fn test_call_gives_up_after_budget() {
        let device = MockDevice::new(ChipsetVariant::Sboot32);
        let handle = device.clone();
        let mut session = Session::new(device, fast_config());
        session.connect().unwrap();
        let before = handle.frames_received();

        handle.drop_next(10);
        let err = session.call(&Command::GetRegionTable { page: 0 }).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Unresponsive {
                command: Opcode::GetRegionTable,
                attempts: 3
            }
        );
        assert_eq!(handle.frames_received() - before, 3);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_call_surfaces_disconnect_without_retry() {
        let device = MockDevice::new(ChipsetVariant::Sboot32);
        let handle = device.clone();
        let mut session = Session::new(device, fast_config());
        session.connect().unwrap();

        handle.unplug();
        let err = session.call(&Command::Identify).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Transport(TransportError::Disconnected(_))
        ));
    }

    #[test]
    fn test_frame_split_across_reads() {
        let device = MockDevice::new(ChipsetVariant::Sboot64).with_read_split(3);
        let mut session = Session::new(device, fast_config());
        session.connect().unwrap();
        let frame = session
            .call(&Command::ReadMemory {
                start: 0,
                last: 0x3F,
            })
            .unwrap();
        assert_eq!(frame.payload.len(), 0x40);
    }

    #[test]
    fn test_identical_reads_are_idempotent() {
        let mut session = Session::with_observer(
            MockDevice::new(ChipsetVariant::Sboot32),
            fast_config(),
            Arc::new(NullObserver),
        );
        session.connect().unwrap();
        let cmd = Command::ReadMemory {
            start: 0x2000,
            last: 0x20FF,
        };
        let first = session.call(&cmd).unwrap();
        let second = session.call(&cmd).unwrap();
        assert_eq!(first.payload, second.payload);
    }

    #[test]
    fn test_close_sends_postamble_and_is_idempotent() {
        let mock = MockTransport::new();
        let handle = mock.clone();
        mock.queue_frame(ChipsetVariant::Sboot64, Opcode::Ack, TAG_ACKNOWLEDGMENT);
        let mut session = Session::new(mock, fast_config());
        session.connect().unwrap();

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(handle.is_closed());

        let codec = ChipsetVariant::Sboot64.codec();
        let writes = handle.get_writes();
        assert_eq!(writes.len(), 2);
        let postamble = codec.decode(&writes[1]).unwrap();
        assert_eq!(postamble.opcode, Opcode::Postamble);
    }

    #[test]
    fn test_drop_releases_transport() {
        let mock = MockTransport::new();
        let handle = mock.clone();
        {
            let _session = Session::new(mock, fast_config());
        }
        assert!(handle.is_closed());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sboot.toml");
        let config = SessionConfig {
            retry_budget: 5,
            variants: vec![ChipsetVariant::Sboot32],
            chunk_size: Some(0x1000),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_config_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str("retry_budget = 7\n").unwrap();
        assert_eq!(config.retry_budget, 7);
        assert_eq!(config.io_timeout_ms, DEFAULT_IO_TIMEOUT_MS);
        assert_eq!(config.variants, ChipsetVariant::PRIORITY.to_vec());
    }
}
