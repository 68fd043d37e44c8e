//! Protocol module - bootloader wire protocols.

pub mod board;
pub mod device;
pub mod error;
pub mod opcodes;
pub mod radio;

pub use board::{BoardBootloader, MAX_BLOCK_SIZE};
pub use device::{BoardInfo, BootloaderDevice, DeviceKind};
pub use error::ProtocolError;
pub use opcodes::{OpcodeTable, Reply};
pub use radio::RadioBootloader;
