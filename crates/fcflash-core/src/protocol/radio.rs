//! SiK telemetry radio protocol.
//!
//! The modem normally passes telemetry through transparently (data mode).
//! `+++` framed by silence switches it into an AT command mode, where
//! `ATI2` reports the board id and `AT&UPDATE` starts the resident
//! bootloader. The bootloader speaks the same opcode/INSYNC framing as the
//! board bootloader but with a 16-bit flash cursor, small payloads and no
//! CRC command.

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use super::board::{compare, read_reply, read_sync, reword};
use super::device::{BoardInfo, BootloaderDevice, DeviceKind};
use super::error::ProtocolError;
use super::opcodes::OpcodeTable;
use crate::config::{RadioConfig, TimeoutConfig};
use crate::ihex::SparseImage;
use crate::transport::{SerialTransport, TransportError};

const ESCAPE: &[u8] = b"+++";

/// Where the modem currently is, as far as the host knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Data,
    Command,
    Bootloader,
}

/// Radio modem client owning its transport for the session.
pub struct RadioBootloader<T: SerialTransport> {
    transport: T,
    config: RadioConfig,
    opcodes: OpcodeTable,
    timeouts: TimeoutConfig,
    link: Link,
    board_id: Option<u32>,
    info: Option<BoardInfo>,
}

impl<T: SerialTransport> RadioBootloader<T> {
    pub fn new(transport: T, config: &RadioConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            transport,
            opcodes: config.opcodes.clone(),
            config: config.clone(),
            timeouts: timeouts.clone(),
            link: Link::Data,
            board_id: None,
            info: None,
        }
    }

    /// Release the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Board id reported by `ATI2`, once identified.
    pub fn board_id(&self) -> Option<u32> {
        self.board_id
    }

    /// Escape from data mode into AT command mode.
    #[instrument(skip(self))]
    pub fn enter_command_mode(&mut self) -> Result<(), ProtocolError> {
        self.transport.set_baud_rate(self.config.data_baud)?;
        self.escape().map_err(|e| match e {
            ProtocolError::Transport(t) if t.is_timeout() => {
                ProtocolError::ModemUnresponsive("no OK after +++".to_string())
            }
            other => other,
        })?;
        self.link = Link::Command;
        info!("Modem in command mode");
        Ok(())
    }

    fn escape(&mut self) -> Result<(), ProtocolError> {
        thread::sleep(self.config.guard_time());
        self.transport.clear_input()?;
        self.transport.write(ESCAPE)?;
        thread::sleep(self.config.guard_time());

        let timeout = self.config.response_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    expected: 2,
                    received: 0,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
            let line = self.transport.read_line(remaining)?;
            let line = line.trim();
            if line == "OK" {
                return Ok(());
            }
            if !line.is_empty() {
                debug!(line = %line, "Ignoring line while waiting for OK");
            }
        }
    }

    fn at_command(&mut self, command: &str) -> Result<(), ProtocolError> {
        debug!(command, "AT command");
        self.transport.write(format!("{}\r\n", command).as_bytes())?;
        Ok(())
    }

    /// Ask the modem for its board id (`ATI2`).
    ///
    /// The whole exchange is bounded by one response timeout, so a modem that
    /// keeps printing non-numeric lines still ends in `NoBoardId`.
    #[instrument(skip(self))]
    pub fn identify(&mut self) -> Result<u32, ProtocolError> {
        self.transport.clear_input()?;
        self.at_command("ATI2")?;

        let deadline = Instant::now() + self.config.response_timeout();
        let mut other = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let line = match self.transport.read_line(remaining) {
                Ok(line) => line,
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e.into()),
            };
            let line = line.trim();
            if line.is_empty() || line == "ATI2" {
                continue;
            }
            match line.parse::<u32>() {
                Ok(id) => {
                    info!(board_id = id, "Modem identified");
                    self.board_id = Some(id);
                    return Ok(id);
                }
                Err(_) => other = Some(line.to_string()),
            }
        }

        match other {
            Some(text) => Err(ProtocolError::NoBoardId(text)),
            None => Err(ProtocolError::NoIdentificationResponse),
        }
    }

    /// Start the resident bootloader and switch to its line speed.
    #[instrument(skip(self))]
    pub fn enter_bootloader(&mut self) -> Result<(), ProtocolError> {
        self.at_command("AT&UPDATE")?;
        // Echo of the command, if any.
        let _ = self.transport.read_line(self.config.response_timeout());
        self.transport.set_baud_rate(self.config.bootloader_baud)?;
        self.transport.clear_input()?;
        self.link = Link::Bootloader;
        info!(baud = self.config.bootloader_baud, "Modem bootloader started");
        Ok(())
    }

    /// Drain stale input and re-synchronize before the next command.
    pub fn ready_read(&mut self) -> Result<(), ProtocolError> {
        self.transport.clear_input()?;
        self.send(self.opcodes.get_sync, &[])?;
        read_sync(&mut self.transport, &self.opcodes, self.timeouts.sync())
    }

    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = self.opcodes.frame(opcode, payload);
        self.transport.write(&frame)?;
        Ok(())
    }

    fn read_reply(&mut self, command: &'static str, timeout: Duration) -> Result<(), ProtocolError> {
        read_reply(&mut self.transport, &self.opcodes, command, timeout)
    }

    /// Board id from `ATI2` plus the frequency code from GET_DEVICE.
    ///
    /// SiK bootloaders carry no protocol revision; it is reported as 0.
    #[instrument(skip(self))]
    pub fn get_board_info(&mut self) -> Result<BoardInfo, ProtocolError> {
        if let Some(info) = self.info {
            return Ok(info);
        }
        self.ready_read()?;
        self.send(self.opcodes.get_device, &[])?;
        let ids = self.transport.read_exact(2, self.timeouts.command())?;
        self.read_reply("GET_DEVICE", self.timeouts.command())?;

        let info = BoardInfo {
            bootloader_protocol_revision: 0,
            board_id: self.board_id.unwrap_or(ids[0] as u32),
            board_revision: ids[1] as u32,
            flash_size: self.config.flash_size,
        };
        info!(
            board_id = info.board_id,
            frequency = %format!("0x{:02X}", ids[1]),
            "Radio info"
        );
        self.info = Some(info);
        Ok(info)
    }

    #[instrument(skip(self))]
    pub fn erase(&mut self) -> Result<(), ProtocolError> {
        info!("Erasing radio flash");
        self.ready_read()?;
        self.send(self.opcodes.chip_erase, &[])?;
        self.read_reply("CHIP_ERASE", self.timeouts.erase())
            .map_err(|e| reword(e, |detail| ProtocolError::Erase { detail }))
    }

    fn set_address(&mut self, address: u32) -> Result<(), ProtocolError> {
        let Ok(cursor) = u16::try_from(address) else {
            return Err(ProtocolError::SetAddress {
                address,
                detail: "beyond the 16-bit flash cursor".to_string(),
            });
        };
        self.ready_read()?;
        let mut payload = [0u8; 2];
        LittleEndian::write_u16(&mut payload, cursor);
        self.send(self.opcodes.load_address, &payload)?;
        self.read_reply("LOAD_ADDRESS", self.timeouts.command())
            .map_err(|e| reword(e, |detail| ProtocolError::SetAddress { address, detail }))
    }

    /// Program `block` at `address` in chunks of `chunk_size`.
    pub fn program(&mut self, address: u32, block: &[u8]) -> Result<(), ProtocolError> {
        let chunk_size = self.chunk_size();
        for (i, chunk) in block.chunks(chunk_size).enumerate() {
            let at = address + (i * chunk_size) as u32;
            self.set_address(at)?;
            self.ready_read()?;
            let mut payload = Vec::with_capacity(chunk.len() + 1);
            payload.push(chunk.len() as u8);
            payload.extend_from_slice(chunk);
            self.send(self.opcodes.prog_multi, &payload)?;
            self.read_reply("PROG_MULTI", self.timeouts.command())
                .map_err(|e| reword(e, |detail| ProtocolError::FlashWrite { detail, address: at }))?;
        }
        Ok(())
    }

    /// Read back `expected` chunk by chunk; stops at the first difference.
    pub fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), ProtocolError> {
        let chunk_size = self.chunk_size();
        for (i, chunk) in expected.chunks(chunk_size).enumerate() {
            let at = address + (i * chunk_size) as u32;
            self.set_address(at)?;
            self.ready_read()?;
            self.send(self.opcodes.read_multi, &[chunk.len() as u8])?;
            let actual = self.transport.read_exact(chunk.len(), self.timeouts.command())?;
            self.read_reply("READ_MULTI", self.timeouts.command())?;
            compare(at, chunk, &actual)?;
        }
        Ok(())
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size.clamp(1, u8::MAX as usize)
    }

    /// Leave the bootloader and wait for the modem to come back in data mode.
    #[instrument(skip(self))]
    pub fn reboot(&mut self) -> Result<(), ProtocolError> {
        if let Err(e) = self.ready_read() {
            debug!(error = %e, "No sync before reboot");
        }
        self.send(self.opcodes.reboot, &[])?;
        self.link = Link::Data;
        self.wait_for_return()
    }

    fn wait_for_return(&mut self) -> Result<(), ProtocolError> {
        self.transport.set_baud_rate(self.config.data_baud)?;
        let deadline = Instant::now() + self.config.reboot_wait();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.escape() {
                Ok(()) => {
                    info!(attempt, "Modem back after reboot");
                    self.at_command("ATO")?;
                    let _ = self.transport.read_line(self.config.response_timeout());
                    return Ok(());
                }
                Err(ProtocolError::Transport(e)) if e.is_timeout() => {
                    debug!(attempt, "Modem not back yet");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                warn!(attempt, "Modem did not return after reboot");
                return Err(ProtocolError::RebootWait {
                    timeout_ms: self.config.reboot_wait_ms,
                });
            }
        }
    }

    /// Full upgrade over the blocks of a decoded hex image: command mode,
    /// identify, bootloader, erase, program and verify every block, reboot.
    #[instrument(skip_all, fields(blocks = image.len()))]
    pub fn erase_then_program_then_verify(&mut self, image: SparseImage) -> Result<(), ProtocolError> {
        self.prepare_link()?;
        self.erase()?;
        for block in image.into_blocks() {
            self.program(block.address, &block.data)?;
            self.verify(block.address, &block.data)?;
        }
        self.reboot()
    }

    /// Walk from wherever the modem is to its bootloader.
    fn prepare_link(&mut self) -> Result<(), ProtocolError> {
        if self.link == Link::Bootloader {
            return Ok(());
        }
        if self.link == Link::Data {
            self.enter_command_mode()?;
        }
        self.identify()?;
        self.enter_bootloader()
    }
}

impl<T: SerialTransport> BootloaderDevice for RadioBootloader<T> {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Radio
    }

    fn prepare(&mut self) -> Result<(), ProtocolError> {
        self.prepare_link()
    }

    fn sync(&mut self) -> Result<(), ProtocolError> {
        self.ready_read()
    }

    fn board_info(&mut self) -> Result<BoardInfo, ProtocolError> {
        self.get_board_info()
    }

    fn erase(&mut self) -> Result<(), ProtocolError> {
        RadioBootloader::erase(self)
    }

    fn program(&mut self, address: u32, block: &[u8]) -> Result<(), ProtocolError> {
        RadioBootloader::program(self, address, block)
    }

    fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), ProtocolError> {
        RadioBootloader::verify(self, address, expected)
    }

    fn supports_crc(&self) -> bool {
        false
    }

    fn crc_check(&mut self, _expected: u32) -> Result<u32, ProtocolError> {
        Err(ProtocolError::CommandFailed {
            command: "GET_CRC",
            code: self.opcodes.invalid,
        })
    }

    fn reboot(&mut self) -> Result<(), ProtocolError> {
        RadioBootloader::reboot(self)
    }

    fn recover(&mut self) -> Result<(), ProtocolError> {
        self.transport.clear_input()?;
        Ok(())
    }
}
