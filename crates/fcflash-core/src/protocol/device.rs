//! Capability set shared by the board and radio bootloader variants.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::ProtocolError;

/// Kind of device on the serial line; selects the protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Flight-controller board bootloader.
    Board,
    /// SiK telemetry radio modem.
    Radio,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Board => write!(f, "board"),
            DeviceKind::Radio => write!(f, "radio"),
        }
    }
}

/// Identity reported by a bootloader once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    pub bootloader_protocol_revision: u32,
    pub board_id: u32,
    pub board_revision: u32,
    pub flash_size: u32,
}

/// Operations the session drives, independent of the wire protocol.
pub trait BootloaderDevice {
    fn kind(&self) -> DeviceKind;

    /// Bring the device into its bootloader. No-op for boards.
    fn prepare(&mut self) -> Result<(), ProtocolError>;

    fn sync(&mut self) -> Result<(), ProtocolError>;

    fn board_info(&mut self) -> Result<BoardInfo, ProtocolError>;

    fn erase(&mut self) -> Result<(), ProtocolError>;

    fn program(&mut self, address: u32, block: &[u8]) -> Result<(), ProtocolError>;

    fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), ProtocolError>;

    /// Whether the bootloader can compute a CRC over flash.
    fn supports_crc(&self) -> bool;

    /// Compare the device CRC with `expected`; returns the device CRC.
    fn crc_check(&mut self, expected: u32) -> Result<u32, ProtocolError>;

    fn reboot(&mut self) -> Result<(), ProtocolError>;

    /// Discard stale input before a retry.
    fn recover(&mut self) -> Result<(), ProtocolError>;
}
