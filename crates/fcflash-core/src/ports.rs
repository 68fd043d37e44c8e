//! Serial port enumeration and board identification.
//!
//! Ports are classified from their USB descriptors: an exact VID/PID table
//! first, then regex fallbacks on the USB description and manufacturer
//! strings. The rules ship as JSON and can be replaced at runtime.

use std::fmt;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use serialport::SerialPortType;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::protocol::DeviceKind;

/// Rules compiled into the binary.
const BUILTIN_RULES: &str = include_str!("../data/usb_board_info.json");
const FILE_TYPE: &str = "USBBoardInfo";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Board rules are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Board rules have file type {0:?}, expected \"USBBoardInfo\"")]
    FileType(String),

    #[error("Unknown board class {0:?}")]
    BoardClass(String),

    #[error("Invalid fallback pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("Failed to read board rules {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(#[from] serialport::Error),
}

/// Board families we know how to recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardType {
    Pixhawk,
    SiKRadio,
    PX4Flow,
    OpenPilot,
    RtkGps,
    Unknown,
}

impl BoardType {
    fn from_class(class: &str) -> Result<Self, CatalogError> {
        match class {
            "Pixhawk" => Ok(BoardType::Pixhawk),
            "SiK Radio" => Ok(BoardType::SiKRadio),
            "PX4 Flow" => Ok(BoardType::PX4Flow),
            "OpenPilot" => Ok(BoardType::OpenPilot),
            "RTK GPS" => Ok(BoardType::RtkGps),
            other => Err(CatalogError::BoardClass(other.to_string())),
        }
    }

    /// Whether this tool can flash the board.
    pub fn can_flash(self) -> bool {
        matches!(
            self,
            BoardType::Pixhawk | BoardType::SiKRadio | BoardType::PX4Flow
        )
    }

    /// Bootloader protocol used to flash this board.
    pub fn device_kind(self) -> Option<DeviceKind> {
        match self {
            BoardType::Pixhawk | BoardType::PX4Flow => Some(DeviceKind::Board),
            BoardType::SiKRadio => Some(DeviceKind::Radio),
            _ => None,
        }
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BoardType::Pixhawk => "Pixhawk",
            BoardType::SiKRadio => "SiK Radio",
            BoardType::PX4Flow => "PX4 Flow",
            BoardType::OpenPilot => "OpenPilot",
            BoardType::RtkGps => "RTK GPS",
            BoardType::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// One serial port as the OS reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    /// USB product string.
    pub description: Option<String>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Ports that belong to the OS, never to an autopilot.
    pub fn is_system_port(&self) -> bool {
        const SYSTEM_NAMES: [&str; 3] = ["Bluetooth-Incoming-Port", "debug-console", "wlan-debug"];
        if SYSTEM_NAMES.iter().any(|n| self.name.contains(n)) {
            return true;
        }
        // Motherboard UARTs carry no USB descriptors.
        self.vid.is_none() && (self.name.starts_with("/dev/ttyS") || self.name.starts_with("COM1"))
    }
}

/// Result of classifying a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub board_type: BoardType,
    pub name: String,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            board_type: BoardType::Unknown,
            name: BoardType::Unknown.to_string(),
        }
    }

    pub fn can_flash(&self) -> bool {
        self.board_type.can_flash()
    }

    pub fn device_kind(&self) -> Option<DeviceKind> {
        self.board_type.device_kind()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RulesFile {
    file_type: String,
    #[serde(default)]
    board_info: Vec<ExactRule>,
    #[serde(default)]
    board_description_fallback: Vec<FallbackRule>,
    #[serde(default)]
    board_manufacturer_fallback: Vec<FallbackRule>,
}

#[derive(Deserialize)]
struct ExactRule {
    #[serde(rename = "vendorID")]
    vendor_id: u16,
    #[serde(rename = "productID")]
    product_id: u16,
    #[serde(rename = "boardClass")]
    board_class: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FallbackRule {
    reg_exp: String,
    board_class: String,
    #[serde(default)]
    android_only: bool,
}

#[derive(Debug, Clone)]
struct BoardEntry {
    vid: u16,
    pid: u16,
    board_type: BoardType,
    name: String,
}

#[derive(Debug, Clone)]
struct Fallback {
    pattern: Regex,
    board_type: BoardType,
}

/// Board identification rules.
#[derive(Debug, Clone)]
pub struct BoardCatalog {
    boards: Vec<BoardEntry>,
    by_description: Vec<Fallback>,
    by_manufacturer: Vec<Fallback>,
}

impl BoardCatalog {
    /// The rules compiled into the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json(BUILTIN_RULES)
    }

    /// Rules from a JSON file in the built-in format.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| CatalogError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: RulesFile = serde_json::from_str(json)?;
        if file.file_type != FILE_TYPE {
            return Err(CatalogError::FileType(file.file_type));
        }

        let boards = file
            .board_info
            .into_iter()
            .map(|r| {
                Ok(BoardEntry {
                    vid: r.vendor_id,
                    pid: r.product_id,
                    board_type: BoardType::from_class(&r.board_class)?,
                    name: r.name,
                })
            })
            .collect::<Result<Vec<_>, CatalogError>>()?;

        let catalog = Self {
            boards,
            by_description: compile(file.board_description_fallback)?,
            by_manufacturer: compile(file.board_manufacturer_fallback)?,
        };
        debug!(
            boards = catalog.boards.len(),
            description_rules = catalog.by_description.len(),
            manufacturer_rules = catalog.by_manufacturer.len(),
            "Board catalog loaded"
        );
        Ok(catalog)
    }

    /// Identify the board behind `port`.
    pub fn classify(&self, port: &PortInfo) -> Classification {
        if let (Some(vid), Some(pid)) = (port.vid, port.pid)
            && let Some(entry) = self.boards.iter().find(|b| b.vid == vid && b.pid == pid)
        {
            return Classification {
                board_type: entry.board_type,
                name: entry.name.clone(),
            };
        }

        let by_text = |rules: &[Fallback], text: Option<&String>| {
            let text = text?;
            rules
                .iter()
                .find(|r| r.pattern.is_match(text))
                .map(|r| r.board_type)
        };
        let fallback = by_text(&self.by_description, port.description.as_ref())
            .or_else(|| by_text(&self.by_manufacturer, port.manufacturer.as_ref()));

        match fallback {
            Some(board_type) => Classification {
                board_type,
                name: board_type.to_string(),
            },
            None => Classification::unknown(),
        }
    }

    /// Whether a Pixhawk-class board is sitting in its bootloader.
    ///
    /// Bootloaders enumerate with "BL" in their USB product string.
    pub fn is_bootloader(&self, port: &PortInfo) -> bool {
        self.classify(port).board_type == BoardType::Pixhawk
            && port.description.as_deref().is_some_and(|d| d.contains("BL"))
    }

    /// Ports that may hold a device we can flash.
    pub fn flashable<'a>(&self, ports: &'a [PortInfo]) -> Vec<(&'a PortInfo, Classification)> {
        ports
            .iter()
            .filter(|p| !p.is_system_port())
            .map(|p| (p, self.classify(p)))
            .filter(|(_, c)| c.can_flash())
            .collect()
    }
}

fn compile(rules: Vec<FallbackRule>) -> Result<Vec<Fallback>, CatalogError> {
    rules
        .into_iter()
        .filter(|r| !r.android_only || cfg!(target_os = "android"))
        .map(|r| {
            let pattern = Regex::new(&r.reg_exp).map_err(|source| CatalogError::Pattern {
                pattern: r.reg_exp.clone(),
                source,
            })?;
            Ok(Fallback {
                pattern,
                board_type: BoardType::from_class(&r.board_class)?,
            })
        })
        .collect()
}

/// Enumerate the serial ports on this machine.
#[instrument(level = "debug")]
pub fn list_ports() -> Result<Vec<PortInfo>, CatalogError> {
    let ports = serialport::available_ports()?
        .into_iter()
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: p.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                description: usb.product,
                manufacturer: usb.manufacturer,
                serial_number: usb.serial_number,
            },
            _ => PortInfo {
                name: p.port_name,
                ..PortInfo::default()
            },
        })
        .collect::<Vec<_>>();
    debug!(count = ports.len(), "Serial ports enumerated");
    Ok(ports)
}
