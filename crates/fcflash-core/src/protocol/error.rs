//! Bootloader protocol errors.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid sync response: 0x{b0:02X} 0x{b1:02X}")]
    InvalidSyncResponse { b0: u8, b1: u8 },

    #[error("Defective hardware: bootloader answered 0x{b0:02X} 0x{b1:02X} (known faulty silicon)")]
    DefectiveHardware { b0: u8, b1: u8 },

    #[error("Unknown response code 0x{0:02X}")]
    UnknownResponseCode(u8),

    #[error("{command} failed with code 0x{code:02X}")]
    CommandFailed { command: &'static str, code: u8 },

    #[error("Unsupported bootloader protocol revision {revision} (supported {min}..={max})")]
    UnsupportedBootloaderVersion { revision: u32, min: u32, max: u32 },

    #[error("Erase failed: {detail}")]
    Erase { detail: String },

    #[error("Set address 0x{address:08X} failed: {detail}")]
    SetAddress { address: u32, detail: String },

    #[error("Block of {len} bytes at 0x{address:08X} outside 1..={max}")]
    BlockLength { len: usize, max: usize, address: u32 },

    #[error("Flash write at 0x{address:08X} failed: {detail}")]
    FlashWrite { detail: String, address: u32 },

    #[error("Verify failed at 0x{address:08X}: expected 0x{expected:02X}, read 0x{actual:02X}")]
    Compare { expected: u8, actual: u8, address: u32 },

    #[error("CRC mismatch: board 0x{board_crc:08X}, file 0x{file_crc:08X}")]
    CrcMismatch { board_crc: u32, file_crc: u32 },

    #[error("Modem did not enter command mode: {0}")]
    ModemUnresponsive(String),

    #[error("No identification response from modem")]
    NoIdentificationResponse,

    #[error("Modem identification carried no board id: {0:?}")]
    NoBoardId(String),

    #[error("Modem did not return from reboot within {timeout_ms}ms")]
    RebootWait { timeout_ms: u64 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// Whether re-issuing the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::DefectiveHardware { .. }
            | ProtocolError::UnsupportedBootloaderVersion { .. }
            | ProtocolError::BlockLength { .. }
            | ProtocolError::Compare { .. }
            | ProtocolError::CrcMismatch { .. }
            | ProtocolError::NoBoardId(_)
            | ProtocolError::RebootWait { .. } => false,
            ProtocolError::InvalidSyncResponse { .. }
            | ProtocolError::UnknownResponseCode(_)
            | ProtocolError::CommandFailed { .. }
            | ProtocolError::Erase { .. }
            | ProtocolError::SetAddress { .. }
            | ProtocolError::FlashWrite { .. }
            | ProtocolError::ModemUnresponsive(_)
            | ProtocolError::NoIdentificationResponse
            | ProtocolError::Transport(_) => true,
        }
    }

    /// Flash address the failure refers to, if any.
    pub fn address(&self) -> Option<u32> {
        match self {
            ProtocolError::SetAddress { address, .. }
            | ProtocolError::BlockLength { address, .. }
            | ProtocolError::FlashWrite { address, .. }
            | ProtocolError::Compare { address, .. } => Some(*address),
            _ => None,
        }
    }
}
