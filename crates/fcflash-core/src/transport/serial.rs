//! serialport-based transport implementation.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, instrument};

use super::traits::{SerialTransport, TransportError};

/// Poll interval used while waiting for bytes.
const READ_SLICE: Duration = Duration::from_millis(50);

/// serialport-backed transport. Closing happens on drop.
pub struct SerialPortTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialPortTransport {
    /// Open `port` at `baud`, 8N1, no flow control.
    #[instrument(level = "info")]
    pub fn open(port: &str, baud: u32) -> Result<Self, TransportError> {
        let handle = serialport::new(port, baud)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| TransportError::Open {
                port: port.to_string(),
                message: e.to_string(),
            })?;

        info!(port = %port, baud, "Serial port opened");
        Ok(Self {
            port: handle,
            name: port.to_string(),
        })
    }
}

impl SerialTransport for SerialPortTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let written = loop {
            match self.port.write(data) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::WriteFailed(e.to_string())),
            }
        };
        if written < data.len() {
            return Err(TransportError::Write {
                actual: written,
                expected: data.len(),
            });
        }
        self.port
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(bytes_written = written, "Write complete");
        Ok(())
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    expected: n,
                    received: filled,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            self.port
                .set_timeout(remaining.min(READ_SLICE))
                .map_err(|e| TransportError::Configure(e.to_string()))?;

            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {}
                Ok(count) => filled += count,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(e) => return Err(TransportError::Read(e.to_string())),
            }
        }
        Ok(buf)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Configure(e.to_string()))
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        debug!(baud, "Changing baud rate");
        self.port
            .set_baud_rate(baud)
            .map_err(|e| TransportError::Configure(e.to_string()))
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialPortTransport {
    fn drop(&mut self) {
        info!(port = %self.name, "Serial port closed");
    }
}
