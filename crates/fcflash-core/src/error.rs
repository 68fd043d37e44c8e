//! Session-level error aggregation and the failure taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::ContainerError;
use crate::ihex::HexError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Failure classes reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Port open/read/write/timeout.
    Transport,
    /// Bootloader or modem said something unexpected.
    Protocol,
    /// Bytes on the device or in the file are not what they should be.
    Integrity,
    /// The firmware file is unusable for this target.
    ContainerFormat,
    /// Known-faulty silicon.
    HardwareDefect,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Integrity => write!(f, "integrity"),
            ErrorKind::ContainerFormat => write!(f, "container format"),
            ErrorKind::HardwareDefect => write!(f, "hardware defect"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Hex(#[from] HexError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Board id mismatch: firmware targets board {expected}, device reports {actual}")]
    BoardIdMismatch { expected: u32, actual: u32 },

    #[error("Image of {image_size} bytes does not fit in {flash_size} bytes of flash")]
    ImageTooLarge { image_size: usize, flash_size: u32 },

    #[error("Firmware image is empty")]
    EmptyImage,

    #[error("Unrecognized firmware file: {0}")]
    UnknownFormat(String),
}

impl FlashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::Container(ContainerError::SizeMismatch { .. }) => ErrorKind::Integrity,
            FlashError::Container(_) => ErrorKind::ContainerFormat,
            FlashError::Hex(HexError::Checksum { .. }) => ErrorKind::Integrity,
            FlashError::Hex(_) => ErrorKind::ContainerFormat,
            FlashError::Transport(_) => ErrorKind::Transport,
            FlashError::Protocol(e) => match e {
                ProtocolError::DefectiveHardware { .. } => ErrorKind::HardwareDefect,
                ProtocolError::Compare { .. } | ProtocolError::CrcMismatch { .. } => {
                    ErrorKind::Integrity
                }
                ProtocolError::Transport(_) => ErrorKind::Transport,
                _ => ErrorKind::Protocol,
            },
            FlashError::BoardIdMismatch { .. }
            | FlashError::ImageTooLarge { .. }
            | FlashError::EmptyImage
            | FlashError::UnknownFormat(_) => ErrorKind::ContainerFormat,
        }
    }

    /// Whether the failing step may be retried in place.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlashError::Transport(_) => true,
            FlashError::Protocol(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether a fresh run of the whole session may succeed.
    pub fn allows_session_retry(&self) -> bool {
        if let FlashError::Protocol(ProtocolError::UnsupportedBootloaderVersion { .. }) = self {
            return false;
        }
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Protocol)
    }

    /// Flash address the failure refers to, if any.
    pub fn address(&self) -> Option<u32> {
        match self {
            FlashError::Protocol(e) => e.address(),
            _ => None,
        }
    }
}
