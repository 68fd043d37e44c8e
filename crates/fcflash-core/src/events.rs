//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to follow a flash run without tight coupling
//! to the core logic. Events are immutable snapshots.

use std::fmt;
use std::sync::mpsc;

use crate::error::ErrorKind;
use crate::protocol::{BoardInfo, DeviceKind};
use crate::state::{FlashState, Step};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by a flash session.
#[derive(Debug, Clone, PartialEq)]
pub enum FlashEvent {
    /// Serial port opened.
    PortOpened { port: String },
    /// Bootloader identified itself.
    BoardInfo { kind: DeviceKind, info: BoardInfo },
    /// State changed.
    StateChanged { from: FlashState, to: FlashState },
    /// One block programmed and verified, or another unit of stage work done.
    Progress {
        stage: FlashState,
        bytes_done: u64,
        bytes_total: u64,
        message: Option<String>,
    },
    /// A step failed and is being retried.
    Retry {
        step: Step,
        attempt: u32,
        budget: u32,
        error: String,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Serial frame sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// The port is closed; always precedes the terminal event.
    PortReleased { port: String },
    /// Terminal: image written, verified and the device rebooted.
    Done { bytes: u64, crc: Option<u32> },
    /// Terminal: the run stopped at `stage`.
    Failed {
        stage: FlashState,
        kind: ErrorKind,
        message: String,
        address: Option<u32>,
    },
    /// Terminal: stopped on request; device flash contents are undefined.
    Cancelled { bytes_done: u64, bytes_total: u64 },
}

impl FlashEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlashEvent::Done { .. } | FlashEvent::Failed { .. } | FlashEvent::Cancelled { .. }
        )
    }
}

/// Serial frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::PortOpened { port } => {
                tracing::info!(port = %port, "Port opened");
            }
            FlashEvent::BoardInfo { kind, info } => {
                tracing::info!(
                    kind = %kind,
                    board_id = info.board_id,
                    board_revision = info.board_revision,
                    flash_size = info.flash_size,
                    bootloader = info.bootloader_protocol_revision,
                    "Bootloader found"
                );
            }
            FlashEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            FlashEvent::Progress {
                stage,
                bytes_done,
                bytes_total,
                ..
            } => {
                let pct = if *bytes_total > 0 {
                    (*bytes_done * 100) / *bytes_total
                } else {
                    0
                };
                tracing::debug!(stage = %stage, progress = %format!("{}%", pct), "Progress");
            }
            FlashEvent::Retry {
                step,
                attempt,
                budget,
                error,
            } => {
                tracing::warn!(step = %step, attempt, budget, "Retrying: {}", error);
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "Serial frame");
            }
            FlashEvent::PortReleased { port } => {
                tracing::debug!(port = %port, "Port released");
            }
            FlashEvent::Done { bytes, crc } => match crc {
                Some(crc) => tracing::info!(bytes, crc = %format!("0x{:08X}", crc), "Flash complete"),
                None => tracing::info!(bytes, "Flash complete"),
            },
            FlashEvent::Failed {
                stage,
                kind,
                message,
                address,
            } => match address {
                Some(address) => tracing::error!(
                    stage = %stage,
                    kind = %kind,
                    address = %format!("0x{:08X}", address),
                    "Flash failed: {}",
                    message
                ),
                None => tracing::error!(stage = %stage, kind = %kind, "Flash failed: {}", message),
            },
            FlashEvent::Cancelled {
                bytes_done,
                bytes_total,
            } => {
                tracing::warn!(bytes_done, bytes_total, "Flash cancelled; device contents undefined");
            }
        }
    }
}

/// Observer that forwards every event to a channel.
pub struct ChannelObserver {
    sender: mpsc::Sender<FlashEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::Receiver<FlashEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl FlashObserver for ChannelObserver {
    fn on_event(&self, event: &FlashEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.sender.send(event.clone());
    }
}
