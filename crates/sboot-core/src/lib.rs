//! Sboot-Core: S-Boot Upload Mode RAM extraction in Rust.
//!
//! Talks to a device sitting in upload mode after a crash, reads its table
//! of dumpable memory regions and streams RAM out to a sink.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: Byte pipe abstraction (nusb, serial port, mocks)
//! - **Protocol**: Frame codecs for the two chipset families, request payloads
//! - **Session**: Handshake and bounded-retry request/response
//! - **Catalog**: Paginated region table fetch and parsing
//! - **Dump**: Chunked streaming transfer with progress and cancellation
//! - **Sink**: Output destinations
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use sboot_core::dump::{DumpEngine, TransferRequest};
//! use sboot_core::session::{Session, SessionConfig};
//! use sboot_core::sink::FileSink;
//! use sboot_core::transport::NusbTransport;
//!
//! # fn main() -> anyhow::Result<()> {
//! let transport = NusbTransport::open()?;
//! let mut session = Session::new(transport, SessionConfig::default());
//! session.connect()?;
//!
//! let region = session.regions()?.get(0).cloned().expect("no regions");
//! let mut sink = FileSink::create(region.file_name(), region.start_address)?;
//! DumpEngine::new().run(
//!     &mut session,
//!     &TransferRequest::Region { region_index: 0 },
//!     &mut sink,
//! )?;
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod dump;
pub mod events;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod transport;

// Re-exports for convenience
pub use catalog::{AddressWidth, Region, RegionCatalog, TableBuilder, TableError};
pub use dump::{
    CancelToken, DumpEngine, DumpError, ProgressMonitor, RequestError, TransferProgress,
    TransferRequest,
};
pub use events::{LogLevel, NullObserver, TracingObserver, UploadEvent, UploadObserver, UploadPhase};
pub use protocol::{ChipsetVariant, Command, Frame, FrameCodec, FramingError, Opcode};
pub use session::{ProtocolError, Session, SessionConfig, SessionState};
pub use sink::{DumpSink, FileSink, MemorySink};
pub use transport::{
    MockDevice, MockTransport, NusbTransport, SerialTransport, Transport, TransportError,
};
