//! Mock serial transport for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{SerialTransport, TransportError};

/// Device emulator attached to a [`MockTransport`].
///
/// Every `write` on the transport is handed to the device as one frame; the
/// returned bytes are queued for subsequent reads.
pub trait MockDevice: Send {
    fn on_write(&mut self, frame: &[u8]) -> Vec<u8>;

    fn on_baud_change(&mut self, _baud: u32) {}
}

/// Mock transport for unit testing protocol and session logic.
pub struct MockTransport {
    /// Bytes waiting to be read.
    rx_queue: Arc<Mutex<VecDeque<u8>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Set once the transport is dropped.
    closed: Arc<AtomicBool>,
    /// Optional emulated device.
    device: Option<Box<dyn MockDevice>>,
    /// Accept at most this many bytes per write.
    write_limit: Option<usize>,
    baud: u32,
    name: String,
}

/// Shared view onto a [`MockTransport`] that outlives moving it into a session.
#[derive(Clone)]
pub struct MockProbe {
    rx_queue: Arc<Mutex<VecDeque<u8>>>,
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            device: None,
            write_limit: None,
            baud: 115_200,
            name: "mock".to_string(),
        }
    }

    /// Attach an emulated device that answers every write.
    pub fn with_device(device: impl MockDevice + 'static) -> Self {
        let mut mock = Self::new();
        mock.device = Some(Box::new(device));
        mock
    }

    /// Queue raw bytes to be returned by subsequent reads.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.rx_queue.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Simulate a port that accepts only `limit` bytes per write.
    pub fn set_write_limit(&mut self, limit: Option<usize>) {
        self.write_limit = limit;
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe {
            rx_queue: Arc::clone(&self.rx_queue),
            write_log: Arc::clone(&self.write_log),
            closed: Arc::clone(&self.closed),
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProbe {
    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Queue raw bytes after the transport has been moved.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.rx_queue.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Whether the transport has been dropped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SerialTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if let Some(limit) = self.write_limit
            && data.len() > limit
        {
            return Err(TransportError::Write {
                actual: limit,
                expected: data.len(),
            });
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        if let Some(device) = self.device.as_mut() {
            let reply = device.on_write(data);
            self.rx_queue.lock().unwrap().extend(reply);
        }
        Ok(())
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut queue = self.rx_queue.lock().unwrap();
        if queue.len() < n {
            let received = queue.len();
            queue.clear();
            return Err(TransportError::Timeout {
                expected: n,
                received,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(queue.drain(..n).collect())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.rx_queue.lock().unwrap().clear();
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.baud = baud;
        if let Some(device) = self.device.as_mut() {
            device.on_baud_change(baud);
        }
        Ok(())
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
