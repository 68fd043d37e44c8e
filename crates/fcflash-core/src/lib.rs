//! fcflash-core: serial bootloader flashing for flight controllers and
//! telemetry radios.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Container / Ihex**: `.px4` JSON firmware manifests and Intel-hex images
//! - **Transport**: serial port abstraction (serialport, mock, simulators)
//! - **Protocol**: board and radio bootloader wire protocols
//! - **State**: state machine and per-step retry budgets
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//! - **Ports**: serial port enumeration and board identification
//!
//! # Example
//!
//! ```no_run
//! use fcflash_core::{CancelToken, DeviceKind, Firmware, FlashConfig, FlashSession};
//!
//! let firmware = Firmware::load("px4_fmu-v5_default.px4")?;
//! let session = FlashSession::new(FlashConfig::default());
//! session.run_on_port("/dev/ttyACM0", &firmware, DeviceKind::Board, &CancelToken::new())?;
//! # Ok::<(), fcflash_core::FlashError>(())
//! ```

pub mod config;
pub mod container;
pub mod crc;
pub mod error;
pub mod events;
pub mod ihex;
pub mod ports;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::{BoardConfig, FlashConfig, RadioConfig, RetryPolicy, TimeoutConfig};
pub use container::{ContainerBuilder, ContainerError, FirmwareContainer};
pub use error::{ErrorKind, FlashError};
pub use events::{ChannelObserver, FlashEvent, FlashObserver, LogLevel, NullObserver, TracingObserver};
pub use ihex::{HexError, SparseImage};
pub use ports::{BoardCatalog, BoardType, PortInfo, list_ports};
pub use protocol::{BoardInfo, BootloaderDevice, DeviceKind, ProtocolError};
pub use session::{CancelToken, Firmware, FlashHandle, FlashOutcome, FlashPlan, FlashSession};
pub use state::{FlashState, Step};
pub use transport::{MockTransport, SerialPortTransport, SerialTransport, TransportError};
