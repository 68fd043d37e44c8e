//! Flight-controller board bootloader protocol.
//!
//! Every command is one frame (`opcode [payload] EOC`) answered by optional
//! data followed by a 2-byte `INSYNC`/status pair.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use super::device::{BoardInfo, BootloaderDevice, DeviceKind};
use super::error::ProtocolError;
use super::opcodes::{OpcodeTable, Reply};
use crate::config::{BoardConfig, TimeoutConfig};
use crate::transport::SerialTransport;

/// Largest PROG_MULTI / READ_MULTI payload (length travels in one byte).
pub const MAX_BLOCK_SIZE: usize = 255;

/// Board bootloader client owning its transport for the session.
pub struct BoardBootloader<T: SerialTransport> {
    transport: T,
    opcodes: OpcodeTable,
    timeouts: TimeoutConfig,
    min_revision: u32,
    max_revision: u32,
    info: Option<BoardInfo>,
}

impl<T: SerialTransport> BoardBootloader<T> {
    pub fn new(transport: T, config: &BoardConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            transport,
            opcodes: config.opcodes.clone(),
            timeouts: timeouts.clone(),
            min_revision: config.min_revision,
            max_revision: config.max_revision,
            info: None,
        }
    }

    /// Release the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = self.opcodes.frame(opcode, payload);
        self.transport.write(&frame)?;
        Ok(())
    }

    fn read_reply(
        &mut self,
        command: &'static str,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        read_reply(&mut self.transport, &self.opcodes, command, timeout)
    }

    /// Handshake with the bootloader.
    #[instrument(skip(self))]
    pub fn sync(&mut self) -> Result<(), ProtocolError> {
        self.transport.clear_input()?;
        self.send(self.opcodes.get_sync, &[])?;
        read_sync(&mut self.transport, &self.opcodes, self.timeouts.sync())?;
        debug!("Bootloader in sync");
        Ok(())
    }

    fn get_device(&mut self, param: u8) -> Result<u32, ProtocolError> {
        self.send(self.opcodes.get_device, &[param])?;
        let value = self.transport.read_exact(4, self.timeouts.command())?;
        self.read_reply("GET_DEVICE", self.timeouts.command())?;
        Ok(LittleEndian::read_u32(&value))
    }

    /// Query revision, board id, board revision and flash size.
    ///
    /// The first successful answer is cached; later calls do not touch the wire.
    #[instrument(skip(self))]
    pub fn get_board_info(&mut self) -> Result<BoardInfo, ProtocolError> {
        if let Some(info) = self.info {
            return Ok(info);
        }

        let revision = self.get_device(self.opcodes.info_bl_rev)?;
        if revision < self.min_revision || revision > self.max_revision {
            return Err(ProtocolError::UnsupportedBootloaderVersion {
                revision,
                min: self.min_revision,
                max: self.max_revision,
            });
        }
        let board_id = self.get_device(self.opcodes.info_board_id)?;
        let board_revision = self.get_device(self.opcodes.info_board_rev)?;
        let flash_size = self.get_device(self.opcodes.info_flash_size)?;

        let info = BoardInfo {
            bootloader_protocol_revision: revision,
            board_id,
            board_revision,
            flash_size,
        };
        info!(
            revision,
            board_id,
            board_revision,
            flash_size,
            "Board info"
        );
        self.info = Some(info);
        Ok(info)
    }

    #[instrument(skip(self))]
    pub fn erase(&mut self) -> Result<(), ProtocolError> {
        info!("Erasing flash");
        self.send(self.opcodes.chip_erase, &[])?;
        self.read_reply("CHIP_ERASE", self.timeouts.erase())
            .map_err(|e| reword(e, |detail| ProtocolError::Erase { detail }))
    }

    /// Move the device flash cursor.
    pub fn set_address(&mut self, address: u32) -> Result<(), ProtocolError> {
        let mut payload = [0u8; 4];
        LittleEndian::write_u32(&mut payload, address);
        self.send(self.opcodes.load_address, &payload)?;
        self.read_reply("LOAD_ADDRESS", self.timeouts.command())
            .map_err(|e| reword(e, |detail| ProtocolError::SetAddress { address, detail }))
    }

    pub fn program(&mut self, address: u32, block: &[u8]) -> Result<(), ProtocolError> {
        check_block_len(address, block.len())?;
        self.set_address(address)?;

        let mut payload = Vec::with_capacity(block.len() + 1);
        payload.push(block.len() as u8);
        payload.extend_from_slice(block);
        self.send(self.opcodes.prog_multi, &payload)?;
        self.read_reply("PROG_MULTI", self.timeouts.command())
            .map_err(|e| reword(e, |detail| ProtocolError::FlashWrite { detail, address }))
    }

    /// Read back `expected.len()` bytes and stop at the first difference.
    pub fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), ProtocolError> {
        check_block_len(address, expected.len())?;
        self.set_address(address)?;
        self.send(self.opcodes.read_multi, &[expected.len() as u8])?;
        let actual = self
            .transport
            .read_exact(expected.len(), self.timeouts.command())?;
        self.read_reply("READ_MULTI", self.timeouts.command())?;
        compare(address, expected, &actual)
    }

    /// Ask the device for the CRC over its whole flash.
    #[instrument(skip(self), fields(expected = %format!("0x{:08X}", expected)))]
    pub fn crc_check(&mut self, expected: u32) -> Result<u32, ProtocolError> {
        self.send(self.opcodes.get_crc, &[])?;
        let value = self.transport.read_exact(4, self.timeouts.crc())?;
        self.read_reply("GET_CRC", self.timeouts.command())?;
        let board_crc = LittleEndian::read_u32(&value);
        if board_crc != expected {
            return Err(ProtocolError::CrcMismatch {
                board_crc,
                file_crc: expected,
            });
        }
        info!(crc = %format!("0x{:08X}", board_crc), "CRC matches");
        Ok(board_crc)
    }

    /// Best effort: a silent device has already left the bootloader.
    #[instrument(skip(self))]
    pub fn reboot(&mut self) -> Result<(), ProtocolError> {
        self.send(self.opcodes.reboot, &[])?;
        match self.transport.read_exact(2, self.timeouts.reboot()) {
            Ok(pair) => debug!(b0 = pair[0], b1 = pair[1], "Reboot acknowledged"),
            Err(e) => debug!(error = %e, "No reply to reboot"),
        }
        Ok(())
    }
}

/// Read and check the trailing status pair of a command.
pub(super) fn read_reply<T: SerialTransport>(
    transport: &mut T,
    opcodes: &OpcodeTable,
    command: &'static str,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let pair = transport.read_exact(2, timeout)?;
    let (b0, b1) = (pair[0], pair[1]);
    match opcodes.classify(b0, b1) {
        Reply::Ok => Ok(()),
        Reply::Failed(code) => Err(ProtocolError::CommandFailed { command, code }),
        Reply::Unknown(code) => Err(ProtocolError::UnknownResponseCode(code)),
        Reply::NotInSync => Err(ProtocolError::InvalidSyncResponse { b0, b1 }),
        Reply::Defective => Err(ProtocolError::DefectiveHardware { b0, b1 }),
    }
}

/// Read the answer to GET_SYNC. Anything but INSYNC/OK is an invalid sync,
/// except the defective-silicon signature.
pub(super) fn read_sync<T: SerialTransport>(
    transport: &mut T,
    opcodes: &OpcodeTable,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let pair = transport.read_exact(2, timeout)?;
    let (b0, b1) = (pair[0], pair[1]);
    match opcodes.classify(b0, b1) {
        Reply::Ok => Ok(()),
        Reply::Defective => {
            warn!(b0, b1, "Defective silicon signature");
            Err(ProtocolError::DefectiveHardware { b0, b1 })
        }
        _ => Err(ProtocolError::InvalidSyncResponse { b0, b1 }),
    }
}

/// Wrap a command failure in the operation-specific variant. Transport and
/// hardware-defect errors keep their own identity.
pub(super) fn reword(err: ProtocolError, wrap: impl FnOnce(String) -> ProtocolError) -> ProtocolError {
    match err {
        ProtocolError::Transport(_) | ProtocolError::DefectiveHardware { .. } => err,
        other => wrap(other.to_string()),
    }
}

/// PROG_MULTI and READ_MULTI carry their length in one byte.
fn check_block_len(address: u32, len: usize) -> Result<(), ProtocolError> {
    if len == 0 || len > MAX_BLOCK_SIZE {
        return Err(ProtocolError::BlockLength {
            len,
            max: MAX_BLOCK_SIZE,
            address,
        });
    }
    Ok(())
}

/// First mismatching byte between what was written and what was read.
pub(crate) fn compare(address: u32, expected: &[u8], actual: &[u8]) -> Result<(), ProtocolError> {
    if let Some((i, (&e, &a))) = expected
        .iter()
        .zip(actual.iter())
        .enumerate()
        .find(|(_, (e, a))| e != a)
    {
        return Err(ProtocolError::Compare {
            expected: e,
            actual: a,
            address: address + i as u32,
        });
    }
    Ok(())
}

impl<T: SerialTransport> BootloaderDevice for BoardBootloader<T> {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Board
    }

    fn prepare(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn sync(&mut self) -> Result<(), ProtocolError> {
        BoardBootloader::sync(self)
    }

    fn board_info(&mut self) -> Result<BoardInfo, ProtocolError> {
        self.get_board_info()
    }

    fn erase(&mut self) -> Result<(), ProtocolError> {
        BoardBootloader::erase(self)
    }

    fn program(&mut self, address: u32, block: &[u8]) -> Result<(), ProtocolError> {
        BoardBootloader::program(self, address, block)
    }

    fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), ProtocolError> {
        BoardBootloader::verify(self, address, expected)
    }

    fn supports_crc(&self) -> bool {
        true
    }

    fn crc_check(&mut self, expected: u32) -> Result<u32, ProtocolError> {
        BoardBootloader::crc_check(self, expected)
    }

    fn reboot(&mut self) -> Result<(), ProtocolError> {
        BoardBootloader::reboot(self)
    }

    fn recover(&mut self) -> Result<(), ProtocolError> {
        self.transport.clear_input()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{BoardFault, SimulatedBoard};
    use crate::transport::MockTransport;

    fn bootloader(sim: SimulatedBoard) -> BoardBootloader<MockTransport> {
        BoardBootloader::new(
            MockTransport::with_device(sim),
            &BoardConfig::default(),
            &TimeoutConfig::default(),
        )
    }

    #[test]
    fn test_sync_ok() {
        let mut bl = bootloader(SimulatedBoard::new(9, 1024));
        bl.sync().unwrap();
    }

    #[test]
    fn test_sync_defective_signature() {
        let sim = SimulatedBoard::new(9, 1024).with_fault(BoardFault::DefectiveSilicon);
        let mut bl = bootloader(sim);
        assert!(matches!(
            bl.sync(),
            Err(ProtocolError::DefectiveHardware { b0: 0x12, b1: 0x14 })
        ));
    }

    #[test]
    fn test_sync_garbage_is_invalid() {
        let sim = SimulatedBoard::new(9, 1024).with_fault(BoardFault::SyncReply([0x41, 0x42]));
        let mut bl = bootloader(sim);
        assert!(matches!(
            bl.sync(),
            Err(ProtocolError::InvalidSyncResponse { b0: 0x41, b1: 0x42 })
        ));
    }

    #[test]
    fn test_sync_silence_is_timeout() {
        let mut bl = BoardBootloader::new(
            MockTransport::new(),
            &BoardConfig::default(),
            &TimeoutConfig::default(),
        );
        match bl.sync() {
            Err(ProtocolError::Transport(e)) => assert!(e.is_timeout()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_board_info_is_cached() {
        let mock = MockTransport::with_device(SimulatedBoard::new(9, 0x4_0000));
        let probe = mock.probe();
        let mut bl = BoardBootloader::new(mock, &BoardConfig::default(), &TimeoutConfig::default());

        let info = bl.get_board_info().unwrap();
        assert_eq!(info.board_id, 9);
        assert_eq!(info.flash_size, 0x4_0000);
        assert_eq!(info.bootloader_protocol_revision, 5);

        let writes = probe.get_writes().len();
        assert_eq!(bl.get_board_info().unwrap(), info);
        assert_eq!(probe.get_writes().len(), writes);
    }

    #[test]
    fn test_unsupported_revision() {
        let sim = SimulatedBoard::new(9, 1024).with_revision(7);
        let mut bl = bootloader(sim);
        assert!(matches!(
            bl.get_board_info(),
            Err(ProtocolError::UnsupportedBootloaderVersion { revision: 7, min: 2, max: 5 })
        ));
    }

    #[test]
    fn test_program_then_verify_echo() {
        let mut bl = bootloader(SimulatedBoard::new(9, 1024));
        bl.erase().unwrap();
        for (i, block) in [[0xA5u8; 64], [0x5Au8; 64]].iter().enumerate() {
            let address = (i * 64) as u32;
            bl.program(address, block).unwrap();
            bl.verify(address, block).unwrap();
        }
    }

    #[test]
    fn test_verify_reports_first_flipped_byte() {
        let sim = SimulatedBoard::new(9, 1024)
            .with_fault(BoardFault::FlipBit { address: 0x47, mask: 0x01 })
            .with_fault(BoardFault::FlipBit { address: 0x5A, mask: 0x10 });
        let mut bl = bootloader(sim);
        bl.erase().unwrap();
        let block = [0x00u8; 64];
        bl.program(0x40, &block).unwrap();
        match bl.verify(0x40, &block) {
            Err(ProtocolError::Compare { expected, actual, address }) => {
                assert_eq!(address, 0x47);
                assert_eq!(expected, 0x00);
                assert_eq!(actual, 0x01);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_crc_mismatch_after_clean_verify() {
        let sim = SimulatedBoard::new(9, 64).with_fault(BoardFault::CrcOverride(0xDEAD_BEEF));
        let mut bl = bootloader(sim);
        let block = [0x11u8; 64];
        bl.erase().unwrap();
        bl.program(0, &block).unwrap();
        bl.verify(0, &block).unwrap();

        let file_crc = crate::crc::firmware_crc(&block, 64);
        match bl.crc_check(file_crc) {
            Err(ProtocolError::CrcMismatch { board_crc, file_crc: f }) => {
                assert_eq!(board_crc, 0xDEAD_BEEF);
                assert_eq!(f, file_crc);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_crc_match() {
        let mut bl = bootloader(SimulatedBoard::new(9, 128));
        let block = [0x22u8; 64];
        bl.erase().unwrap();
        bl.program(0, &block).unwrap();
        let expected = crate::crc::firmware_crc(&block, 128);
        assert_eq!(bl.crc_check(expected).unwrap(), expected);
    }

    #[test]
    fn test_erase_failure_is_erase_error() {
        let sim = SimulatedBoard::new(9, 1024).with_fault(BoardFault::EraseFails);
        let mut bl = bootloader(sim);
        assert!(matches!(bl.erase(), Err(ProtocolError::Erase { .. })));
    }

    #[test]
    fn test_oversized_block_rejected() {
        let mut bl = bootloader(SimulatedBoard::new(9, 1024));
        let block = vec![0u8; MAX_BLOCK_SIZE + 1];
        assert!(matches!(
            bl.program(0, &block),
            Err(ProtocolError::BlockLength { len: 256, address: 0, .. })
        ));
    }

    #[test]
    fn test_oversized_verify_rejected_before_read() {
        let sim = SimulatedBoard::new(9, 1024);
        let stats = sim.stats();
        let mut bl = bootloader(sim);
        let expected = vec![0xFFu8; MAX_BLOCK_SIZE + 1];
        assert!(matches!(
            bl.verify(0x10, &expected),
            Err(ProtocolError::BlockLength { len: 256, address: 0x10, .. })
        ));
        assert!(matches!(
            bl.verify(0x10, &[]),
            Err(ProtocolError::BlockLength { len: 0, .. })
        ));
        let stats = stats.lock().unwrap();
        assert_eq!(stats.read, 0);
        assert_eq!(stats.load_address, 0);
    }

    #[test]
    fn test_reboot_silence_is_success() {
        let mut bl = bootloader(SimulatedBoard::new(9, 1024));
        bl.reboot().unwrap();
    }
}
