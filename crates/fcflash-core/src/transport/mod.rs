//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod sim;
pub mod traits;

pub use mock::{MockDevice, MockProbe, MockTransport};
pub use serial::SerialPortTransport;
pub use traits::{SerialTransport, TransportError};
