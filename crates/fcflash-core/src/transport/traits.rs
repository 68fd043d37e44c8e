//! Serial transport layer abstraction.
//!
//! Defines the `SerialTransport` trait for byte-level serial communication,
//! allowing different implementations (serialport, mock, etc.).

use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {port}: {message}")]
    Open { port: String, message: String },

    #[error("Short write: {actual} of {expected} bytes accepted")]
    Write { actual: usize, expected: usize },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Timeout after {timeout_ms}ms ({received} of {expected} bytes received)")]
    Timeout {
        expected: usize,
        received: usize,
        timeout_ms: u64,
    },

    #[error("Port configuration failed: {0}")]
    Configure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract serial transport interface.
///
/// Every read is bounded by a timeout; nothing blocks indefinitely. The
/// handle is released when the implementing value is dropped.
pub trait SerialTransport: Send {
    /// Write all bytes; fewer accepted bytes than requested is an error.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `n` bytes or fail once `timeout` elapses.
    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Discard anything pending in the receive buffer.
    fn clear_input(&mut self) -> Result<(), TransportError>;

    /// Reconfigure the line speed.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError>;

    /// Name of the underlying port.
    fn port_name(&self) -> &str;

    /// Read one `\n`-terminated line, without the line terminator.
    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut line = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    expected: line.len() + 1,
                    received: line.len(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let byte = match self.read_exact(1, remaining) {
                Ok(b) => b[0],
                Err(TransportError::Timeout { .. }) => {
                    return Err(TransportError::Timeout {
                        expected: line.len() + 1,
                        received: line.len(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Err(e) => return Err(e),
            };
            match byte {
                b'\n' => break,
                b'\r' => {}
                b => line.push(b),
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

impl<T: SerialTransport + ?Sized> SerialTransport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read_exact(n, timeout)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        (**self).clear_input()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        (**self).set_baud_rate(baud)
    }

    fn port_name(&self) -> &str {
        (**self).port_name()
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        (**self).read_line(timeout)
    }
}
