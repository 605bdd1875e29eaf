//! Transport layer module.

pub mod mock;
pub mod mock_device;
pub mod nusb;
pub mod serial;
pub mod traits;

pub use mock::{MockReply, MockTransport};
pub use mock_device::MockDevice;
pub use nusb::{NusbTransport, UsbTarget};
pub use serial::SerialTransport;
pub use traits::{Transport, TransportError};
