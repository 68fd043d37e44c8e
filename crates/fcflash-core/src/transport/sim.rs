//! In-memory bootloader emulators for [`MockTransport`](super::MockTransport).
//!
//! `SimulatedBoard` speaks the flight-controller bootloader protocol and
//! `SimulatedRadio` the SiK modem AT/bootloader protocol. Both count the
//! commands they receive and support fault injection.

use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use super::mock::MockDevice;
use crate::crc::{ERASED, firmware_crc};
use crate::protocol::OpcodeTable;

/// Commands seen by a simulator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimStats {
    pub sync: usize,
    pub get_device: usize,
    pub erase: usize,
    pub load_address: usize,
    pub program: usize,
    pub read: usize,
    pub crc: usize,
    /// Bytes covered by the last CRC computation.
    pub crc_span: usize,
    pub reboot: usize,
    pub at_commands: Vec<String>,
}

/// Faults a [`SimulatedBoard`] can inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardFault {
    /// Answer sync with the defective-silicon signature.
    DefectiveSilicon,
    /// Answer sync with this pair.
    SyncReply([u8; 2]),
    /// Stay silent for the first `n` sync requests.
    SilentSyncs(usize),
    /// XOR `mask` into the byte at `address` on readback.
    FlipBit { address: u32, mask: u8 },
    /// Report this CRC regardless of flash contents.
    CrcOverride(u32),
    EraseFails,
    /// Fail the first `n` PROG_MULTI commands.
    ProgramFails(usize),
}

/// Flight-controller bootloader emulator.
pub struct SimulatedBoard {
    opcodes: OpcodeTable,
    board_id: u32,
    board_revision: u32,
    revision: u32,
    base_address: u32,
    flash: Vec<u8>,
    cursor: usize,
    faults: Vec<BoardFault>,
    stats: Arc<Mutex<SimStats>>,
}

impl SimulatedBoard {
    pub fn new(board_id: u32, flash_size: usize) -> Self {
        Self {
            opcodes: OpcodeTable::board(),
            board_id,
            board_revision: 0,
            revision: 5,
            base_address: 0,
            flash: vec![ERASED; flash_size],
            cursor: 0,
            faults: Vec::new(),
            stats: Arc::new(Mutex::new(SimStats::default())),
        }
    }

    pub fn with_fault(mut self, fault: BoardFault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_base_address(mut self, base: u32) -> Self {
        self.base_address = base;
        self
    }

    pub fn with_opcodes(mut self, opcodes: OpcodeTable) -> Self {
        self.opcodes = opcodes;
        self
    }

    /// Shared command counters.
    pub fn stats(&self) -> Arc<Mutex<SimStats>> {
        Arc::clone(&self.stats)
    }

    fn has(&self, fault: &BoardFault) -> bool {
        self.faults.contains(fault)
    }

    fn ok(&self) -> Vec<u8> {
        vec![self.opcodes.insync, self.opcodes.ok]
    }

    fn failed(&self) -> Vec<u8> {
        vec![self.opcodes.insync, self.opcodes.failed]
    }

    fn invalid(&self) -> Vec<u8> {
        vec![self.opcodes.insync, self.opcodes.invalid]
    }

    fn flipped(&self, address: u32, byte: u8) -> u8 {
        self.faults.iter().fold(byte, |b, fault| match fault {
            BoardFault::FlipBit { address: a, mask } if *a == address => b ^ mask,
            _ => b,
        })
    }

    fn with_ok(&self, mut data: Vec<u8>) -> Vec<u8> {
        data.extend(self.ok());
        data
    }

    fn take_countdown(&mut self, matcher: fn(&BoardFault) -> Option<usize>) -> bool {
        for fault in self.faults.iter_mut() {
            if let Some(n) = matcher(fault)
                && n > 0
            {
                match fault {
                    BoardFault::SilentSyncs(c) | BoardFault::ProgramFails(c) => *c -= 1,
                    _ => {}
                }
                return true;
            }
        }
        false
    }
}

impl MockDevice for SimulatedBoard {
    fn on_write(&mut self, frame: &[u8]) -> Vec<u8> {
        let t = self.opcodes.clone();
        if frame.len() < 2 || frame[frame.len() - 1] != t.eoc {
            return self.invalid();
        }
        let op = frame[0];
        let body = &frame[1..frame.len() - 1];
        let handle = Arc::clone(&self.stats);
        let mut stats = handle.lock().unwrap();

        if op == t.get_sync {
            stats.sync += 1;
            drop(stats);
            if self.take_countdown(|f| match f {
                BoardFault::SilentSyncs(n) => Some(*n),
                _ => None,
            }) {
                return Vec::new();
            }
            if self.has(&BoardFault::DefectiveSilicon) {
                return t.defect_signature.to_vec();
            }
            if let Some(pair) = self.faults.iter().find_map(|f| match f {
                BoardFault::SyncReply(p) => Some(*p),
                _ => None,
            }) {
                return pair.to_vec();
            }
            self.ok()
        } else if op == t.get_device {
            stats.get_device += 1;
            let Some(&param) = body.first() else {
                return self.invalid();
            };
            let value = if param == t.info_bl_rev {
                self.revision
            } else if param == t.info_board_id {
                self.board_id
            } else if param == t.info_board_rev {
                self.board_revision
            } else if param == t.info_flash_size {
                self.flash.len() as u32
            } else {
                return self.invalid();
            };
            let mut out = vec![0u8; 4];
            LittleEndian::write_u32(&mut out, value);
            self.with_ok(out)
        } else if op == t.chip_erase {
            stats.erase += 1;
            if self.has(&BoardFault::EraseFails) {
                return self.failed();
            }
            self.flash.fill(ERASED);
            self.cursor = 0;
            self.ok()
        } else if op == t.load_address {
            stats.load_address += 1;
            if body.len() != 4 {
                return self.invalid();
            }
            let address = LittleEndian::read_u32(body);
            let Some(offset) = address.checked_sub(self.base_address) else {
                return self.failed();
            };
            if offset as usize > self.flash.len() {
                return self.failed();
            }
            self.cursor = offset as usize;
            self.ok()
        } else if op == t.prog_multi {
            stats.program += 1;
            drop(stats);
            let Some((&len, data)) = body.split_first() else {
                return self.invalid();
            };
            if data.len() != len as usize || self.cursor + data.len() > self.flash.len() {
                return self.failed();
            }
            if self.take_countdown(|f| match f {
                BoardFault::ProgramFails(n) => Some(*n),
                _ => None,
            }) {
                return self.failed();
            }
            self.flash[self.cursor..self.cursor + data.len()].copy_from_slice(data);
            self.cursor += data.len();
            self.ok()
        } else if op == t.read_multi {
            stats.read += 1;
            let Some(&len) = body.first() else {
                return self.invalid();
            };
            let len = len as usize;
            if self.cursor + len > self.flash.len() {
                return self.failed();
            }
            let out = (0..len)
                .map(|i| {
                    let address = self.base_address + (self.cursor + i) as u32;
                    self.flipped(address, self.flash[self.cursor + i])
                })
                .collect();
            self.cursor += len;
            self.with_ok(out)
        } else if op == t.get_crc {
            stats.crc += 1;
            stats.crc_span = self.flash.len();
            let crc = self
                .faults
                .iter()
                .find_map(|f| match f {
                    BoardFault::CrcOverride(c) => Some(*c),
                    _ => None,
                })
                .unwrap_or_else(|| firmware_crc(&self.flash, self.flash.len() as u32));
            let mut out = vec![0u8; 4];
            LittleEndian::write_u32(&mut out, crc);
            self.with_ok(out)
        } else if op == t.reboot {
            stats.reboot += 1;
            Vec::new()
        } else {
            self.invalid()
        }
    }
}

/// Faults a [`SimulatedRadio`] can inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioFault {
    /// Ignore `+++`.
    Unresponsive,
    /// Answer nothing to `ATI2`.
    SilentIdentify,
    /// Answer `ATI2` with text instead of a number.
    NonNumericIdentify,
    /// Stay silent after the bootloader reboot.
    NeverReturns,
    /// XOR `mask` into the byte at `address` on readback.
    FlipBit { address: u32, mask: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RadioMode {
    Data,
    Command,
    Bootloader,
    Gone,
}

/// SiK radio emulator: data mode, AT command mode and bootloader.
pub struct SimulatedRadio {
    opcodes: OpcodeTable,
    board_id: u8,
    frequency_code: u8,
    bootloader_baud: u32,
    baud: u32,
    mode: RadioMode,
    flash: Vec<u8>,
    cursor: usize,
    faults: Vec<RadioFault>,
    stats: Arc<Mutex<SimStats>>,
}

impl SimulatedRadio {
    pub fn new(board_id: u8, flash_size: usize) -> Self {
        Self {
            opcodes: OpcodeTable::radio(),
            board_id,
            frequency_code: 0x43,
            bootloader_baud: 115_200,
            baud: 57_600,
            mode: RadioMode::Data,
            flash: vec![ERASED; flash_size],
            cursor: 0,
            faults: Vec::new(),
            stats: Arc::new(Mutex::new(SimStats::default())),
        }
    }

    pub fn with_fault(mut self, fault: RadioFault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn stats(&self) -> Arc<Mutex<SimStats>> {
        Arc::clone(&self.stats)
    }

    /// Flash contents, for checking what was programmed.
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    fn has(&self, fault: &RadioFault) -> bool {
        self.faults.contains(fault)
    }

    fn on_data(&mut self, frame: &[u8]) -> Vec<u8> {
        if frame == b"+++" && !self.has(&RadioFault::Unresponsive) {
            self.mode = RadioMode::Command;
            return b"OK\r\n".to_vec();
        }
        Vec::new()
    }

    fn on_command(&mut self, frame: &[u8]) -> Vec<u8> {
        let line = String::from_utf8_lossy(frame).trim().to_string();
        self.stats.lock().unwrap().at_commands.push(line.clone());

        let mut out = format!("{}\r\n", line).into_bytes();
        match line.as_str() {
            "ATI2" => {
                if self.has(&RadioFault::SilentIdentify) {
                    return Vec::new();
                }
                if self.has(&RadioFault::NonNumericIdentify) {
                    out.extend_from_slice(b"SiK radio\r\n");
                } else {
                    out.extend_from_slice(format!("{}\r\n", self.board_id).as_bytes());
                }
            }
            "AT&UPDATE" => self.mode = RadioMode::Bootloader,
            "ATO" => self.mode = RadioMode::Data,
            _ => out.extend_from_slice(b"ERROR\r\n"),
        }
        out
    }

    fn on_bootloader(&mut self, frame: &[u8]) -> Vec<u8> {
        let t = &self.opcodes;
        let ok = vec![t.insync, t.ok];
        let failed = vec![t.insync, t.failed];
        let invalid = vec![t.insync, t.invalid];

        if self.baud != self.bootloader_baud {
            return Vec::new();
        }
        if frame.len() < 2 || frame[frame.len() - 1] != t.eoc {
            return invalid;
        }
        let op = frame[0];
        let body = &frame[1..frame.len() - 1];
        let mut stats = self.stats.lock().unwrap();

        if op == t.get_sync {
            stats.sync += 1;
            ok
        } else if op == t.get_device {
            stats.get_device += 1;
            let mut out = vec![self.board_id, self.frequency_code];
            out.extend(ok);
            out
        } else if op == t.chip_erase {
            stats.erase += 1;
            self.flash.fill(ERASED);
            ok
        } else if op == t.load_address {
            stats.load_address += 1;
            if body.len() != 2 {
                return invalid;
            }
            let address = LittleEndian::read_u16(body) as usize;
            if address > self.flash.len() {
                return failed;
            }
            self.cursor = address;
            ok
        } else if op == t.prog_multi {
            stats.program += 1;
            let Some((&len, data)) = body.split_first() else {
                return invalid;
            };
            if data.len() != len as usize || self.cursor + data.len() > self.flash.len() {
                return failed;
            }
            self.flash[self.cursor..self.cursor + data.len()].copy_from_slice(data);
            self.cursor += data.len();
            ok
        } else if op == t.read_multi {
            stats.read += 1;
            let Some(&len) = body.first() else {
                return invalid;
            };
            let len = len as usize;
            if self.cursor + len > self.flash.len() {
                return failed;
            }
            let mut out: Vec<u8> = (0..len)
                .map(|i| {
                    let address = (self.cursor + i) as u32;
                    self.faults.iter().fold(self.flash[self.cursor + i], |b, f| match f {
                        RadioFault::FlipBit { address: a, mask } if *a == address => b ^ mask,
                        _ => b,
                    })
                })
                .collect();
            self.cursor += len;
            out.extend(ok);
            out
        } else if op == t.reboot {
            stats.reboot += 1;
            self.mode = if self.faults.contains(&RadioFault::NeverReturns) {
                RadioMode::Gone
            } else {
                RadioMode::Data
            };
            Vec::new()
        } else {
            invalid
        }
    }
}

impl MockDevice for SimulatedRadio {
    fn on_write(&mut self, frame: &[u8]) -> Vec<u8> {
        match self.mode {
            RadioMode::Data => self.on_data(frame),
            RadioMode::Command => self.on_command(frame),
            RadioMode::Bootloader => self.on_bootloader(frame),
            RadioMode::Gone => Vec::new(),
        }
    }

    fn on_baud_change(&mut self, baud: u32) {
        self.baud = baud;
    }
}
