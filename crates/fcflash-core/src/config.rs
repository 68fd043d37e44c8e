//! Flash session configuration (TOML).

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::OpcodeTable;
use crate::state::Step;

/// Configuration for a flash session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Serial port (e.g. `/dev/ttyACM0`); may be given on the command line instead.
    pub port: Option<String>,
    /// Line speed for the board bootloader.
    pub baud_rate: u32,
    /// Bytes per program/verify block.
    pub block_size: usize,
    /// Flash address of the first image byte.
    pub base_address: u32,
    /// Whole-session attempts for failures that allow a fresh run.
    pub session_attempts: u32,
    /// Emit a `Packet` event for every frame on the wire.
    pub trace_packets: bool,
    pub timeouts: TimeoutConfig,
    pub retries: RetryPolicy,
    pub board: BoardConfig,
    pub radio: RadioConfig,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            block_size: 64,
            base_address: 0,
            session_attempts: 1,
            trace_packets: false,
            timeouts: TimeoutConfig::default(),
            retries: RetryPolicy::default(),
            board: BoardConfig::default(),
            radio: RadioConfig::default(),
        }
    }
}

impl FlashConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlashConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Per-operation timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub sync_ms: u64,
    pub command_ms: u64,
    pub erase_ms: u64,
    pub crc_ms: u64,
    pub reboot_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sync_ms: 200,
            command_ms: 500,
            erase_ms: 20_000,
            crc_ms: 10_000,
            reboot_ms: 200,
        }
    }
}

impl TimeoutConfig {
    pub fn sync(&self) -> Duration {
        Duration::from_millis(self.sync_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn erase(&self) -> Duration {
        Duration::from_millis(self.erase_ms)
    }

    pub fn crc(&self) -> Duration {
        Duration::from_millis(self.crc_ms)
    }

    pub fn reboot(&self) -> Duration {
        Duration::from_millis(self.reboot_ms)
    }
}

/// Retry budget for each logical step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub prepare: u32,
    pub sync: u32,
    pub board_info: u32,
    pub erase: u32,
    /// Per block.
    pub program: u32,
    /// Per block.
    pub verify: u32,
    pub crc: u32,
    pub reboot: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            prepare: 2,
            sync: 5,
            board_info: 2,
            erase: 1,
            program: 3,
            verify: 2,
            crc: 1,
            reboot: 0,
        }
    }
}

impl RetryPolicy {
    /// Same budget for every step.
    pub fn uniform(retries: u32) -> Self {
        Self {
            prepare: retries,
            sync: retries,
            board_info: retries,
            erase: retries,
            program: retries,
            verify: retries,
            crc: retries,
            reboot: retries,
        }
    }

    pub fn budget(&self, step: Step) -> u32 {
        match step {
            Step::Prepare => self.prepare,
            Step::Sync => self.sync,
            Step::BoardInfo => self.board_info,
            Step::Erase => self.erase,
            Step::Program => self.program,
            Step::Verify => self.verify,
            Step::Crc => self.crc,
            Step::Reboot => self.reboot,
        }
    }
}

/// Flight-controller bootloader settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Lowest supported bootloader protocol revision.
    pub min_revision: u32,
    /// Highest supported bootloader protocol revision.
    pub max_revision: u32,
    pub opcodes: OpcodeTable,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            min_revision: 2,
            max_revision: 5,
            opcodes: OpcodeTable::board(),
        }
    }
}

/// SiK radio settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Telemetry (data mode) line speed.
    pub data_baud: u32,
    /// Bootloader line speed.
    pub bootloader_baud: u32,
    /// Silence required before and after `+++`.
    pub guard_time_ms: u64,
    /// Wait for AT command replies.
    pub response_timeout_ms: u64,
    /// Bytes of application flash.
    pub flash_size: u32,
    /// Largest PROG_MULTI/READ_MULTI payload.
    pub chunk_size: usize,
    /// How long the modem may take to come back after reboot.
    pub reboot_wait_ms: u64,
    pub opcodes: OpcodeTable,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            data_baud: 57_600,
            bootloader_baud: 115_200,
            guard_time_ms: 1_000,
            response_timeout_ms: 1_500,
            flash_size: 0xF800,
            chunk_size: 32,
            reboot_wait_ms: 10_000,
            opcodes: OpcodeTable::radio(),
        }
    }
}

impl RadioConfig {
    pub fn guard_time(&self) -> Duration {
        Duration::from_millis(self.guard_time_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reboot_wait(&self) -> Duration {
        Duration::from_millis(self.reboot_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fcflash.toml");

        let mut config = FlashConfig::default();
        config.port = Some("/dev/ttyACM0".into());
        config.block_size = 252;
        config.retries.erase = 4;
        config.save_to_file(&path).unwrap();

        let loaded = FlashConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: FlashConfig = toml::from_str(
            r#"
            block_size = 128

            [retries]
            program = 7

            [board.opcodes]
            get_crc = 0x2A
            "#,
        )
        .unwrap();
        assert_eq!(config.block_size, 128);
        assert_eq!(config.retries.program, 7);
        assert_eq!(config.retries.sync, RetryPolicy::default().sync);
        assert_eq!(config.board.opcodes.get_crc, 0x2A);
        assert_eq!(config.board.opcodes.get_sync, 0x21);
        assert_eq!(config.radio, RadioConfig::default());
    }

    #[test]
    fn test_budget_lookup() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.budget(Step::Erase), policy.erase);
        assert_eq!(RetryPolicy::uniform(0).budget(Step::Sync), 0);
    }
}
