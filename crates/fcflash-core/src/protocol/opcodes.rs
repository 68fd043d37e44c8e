//! Bootloader opcode and response tables.
//!
//! Byte values are loaded from configuration; the defaults are the values
//! validated against deployed flight-controller and SiK radio bootloaders.

use serde::{Deserialize, Serialize};

/// Bootloader wire vocabulary for one device family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcodeTable {
    // Replies (device -> host)
    pub insync: u8,
    pub ok: u8,
    pub failed: u8,
    pub invalid: u8,
    /// Reply pair that identifies a known-faulty silicon revision.
    pub defect_signature: [u8; 2],

    // Framing
    pub eoc: u8,

    // Commands (host -> device)
    pub get_sync: u8,
    pub get_device: u8,
    pub chip_erase: u8,
    pub load_address: u8,
    pub prog_multi: u8,
    pub read_multi: u8,
    pub get_crc: u8,
    pub reboot: u8,

    // GET_DEVICE parameters
    pub info_bl_rev: u8,
    pub info_board_id: u8,
    pub info_board_rev: u8,
    pub info_flash_size: u8,
}

impl OpcodeTable {
    /// Flight-controller bootloader table.
    pub fn board() -> Self {
        Self {
            insync: 0x12,
            ok: 0x10,
            failed: 0x11,
            invalid: 0x13,
            defect_signature: [0x12, 0x14],
            eoc: 0x20,
            get_sync: 0x21,
            get_device: 0x22,
            chip_erase: 0x23,
            load_address: 0x24,
            prog_multi: 0x27,
            read_multi: 0x28,
            get_crc: 0x29,
            reboot: 0x30,
            info_bl_rev: 1,
            info_board_id: 2,
            info_board_rev: 3,
            info_flash_size: 4,
        }
    }

    /// SiK telemetry radio bootloader table.
    pub fn radio() -> Self {
        Self {
            // SiK bootloaders have no CRC command and no bad-silicon reply.
            get_crc: 0x00,
            defect_signature: [0x12, 0xFF],
            ..Self::board()
        }
    }

    /// Frame a command: opcode, payload, EOC.
    pub fn frame(&self, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.push(opcode);
        frame.extend_from_slice(payload);
        frame.push(self.eoc);
        frame
    }

    /// Classify a 2-byte reply.
    pub fn classify(&self, b0: u8, b1: u8) -> Reply {
        if [b0, b1] == self.defect_signature {
            return Reply::Defective;
        }
        if b0 != self.insync {
            return Reply::NotInSync;
        }
        if b1 == self.ok {
            Reply::Ok
        } else if b1 == self.failed || b1 == self.invalid {
            Reply::Failed(b1)
        } else {
            Reply::Unknown(b1)
        }
    }
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self::board()
    }
}

/// Classified 2-byte bootloader reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// INSYNC + OK.
    Ok,
    /// INSYNC + FAILED/INVALID.
    Failed(u8),
    /// INSYNC + unrecognized status.
    Unknown(u8),
    /// First byte is not INSYNC.
    NotInSync,
    /// Matches the defective-silicon signature.
    Defective,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_appends_eoc() {
        let t = OpcodeTable::board();
        assert_eq!(t.frame(t.get_sync, &[]), vec![0x21, 0x20]);
        assert_eq!(t.frame(t.get_device, &[t.info_board_id]), vec![0x22, 2, 0x20]);
    }

    #[test]
    fn test_classify() {
        let t = OpcodeTable::board();
        assert_eq!(t.classify(0x12, 0x10), Reply::Ok);
        assert_eq!(t.classify(0x12, 0x11), Reply::Failed(0x11));
        assert_eq!(t.classify(0x12, 0x13), Reply::Failed(0x13));
        assert_eq!(t.classify(0x12, 0x14), Reply::Defective);
        assert_eq!(t.classify(0x12, 0x55), Reply::Unknown(0x55));
        assert_eq!(t.classify(0x00, 0x10), Reply::NotInSync);
    }

    #[test]
    fn test_table_from_partial_toml() {
        let t: OpcodeTable = toml::from_str("get_crc = 0x2A\ndefect_signature = [0x12, 0x15]").unwrap();
        assert_eq!(t.get_crc, 0x2A);
        assert_eq!(t.defect_signature, [0x12, 0x15]);
        assert_eq!(t.get_sync, OpcodeTable::board().get_sync);
    }
}
