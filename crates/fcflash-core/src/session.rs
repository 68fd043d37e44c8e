//! Flash session - high-level orchestrator for one upgrade.
//!
//! A session owns the serial port for the whole run and drives the state
//! machine: prepare, sync, board info (with board id and flash size gates),
//! erase, program and verify every block, CRC, reboot. Every run ends in
//! exactly one terminal event, emitted after the port has been released.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::config::FlashConfig;
use crate::container::{self, ContainerError, FirmwareContainer};
use crate::crc::{ERASED, firmware_crc};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, LogLevel, PacketDirection, TracingObserver};
use crate::ihex::{self, SparseImage};
use crate::protocol::{
    BoardBootloader, BootloaderDevice, DeviceKind, MAX_BLOCK_SIZE, ProtocolError, RadioBootloader,
};
use crate::state::{FlashState, Input, StateMachineContext, Step};
use crate::transport::{SerialPortTransport, SerialTransport, TransportError};

/// Bytes of each frame copied into `Packet` events.
const PACKET_PREVIEW: usize = 32;

/// A loaded firmware file.
#[derive(Debug, Clone)]
pub enum Firmware {
    /// `.px4` JSON container for a flight-controller board.
    Container(FirmwareContainer),
    /// Intel-hex image for a radio modem.
    Hex(SparseImage),
}

impl Firmware {
    /// Read a firmware file, detecting its format from the content.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| ContainerError::FileOpen {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let firmware = Self::from_bytes(&bytes)?;
        info!(path = %path.display(), format = firmware.format_name(), "Firmware loaded");
        Ok(firmware)
    }

    /// Parse firmware held in memory: a JSON object is a container, a
    /// `:`-prefixed text is Intel hex.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FlashError> {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Ok(Firmware::Container(FirmwareContainer::from_bytes(bytes)?)),
            Some(b':') => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    FlashError::UnknownFormat(format!("hex file is not text: {}", e))
                })?;
                Ok(Firmware::Hex(ihex::decode_str(text)?))
            }
            Some(b) => Err(FlashError::UnknownFormat(format!(
                "unexpected leading byte 0x{:02X}",
                b
            ))),
            None => Err(FlashError::UnknownFormat("file is empty".to_string())),
        }
    }

    /// Board id the firmware targets, if the format carries one.
    pub fn board_id(&self) -> Option<u32> {
        match self {
            Firmware::Container(c) => Some(c.board_id()),
            Firmware::Hex(_) => None,
        }
    }

    /// Device kind this format is normally flashed to.
    pub fn default_kind(&self) -> DeviceKind {
        match self {
            Firmware::Container(_) => DeviceKind::Board,
            Firmware::Hex(_) => DeviceKind::Radio,
        }
    }

    pub fn format_name(&self) -> &'static str {
        match self {
            Firmware::Container(_) => "px4",
            Firmware::Hex(_) => "ihex",
        }
    }
}

/// One program/verify unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanBlock {
    pub address: u32,
    pub data: Vec<u8>,
}

/// What a run will write, in order.
#[derive(Debug, Clone)]
pub struct FlashPlan {
    blocks: Vec<PlanBlock>,
    total_bytes: u64,
    /// Flash contents from the base address, gaps erased.
    flat: Vec<u8>,
}

impl FlashPlan {
    pub fn for_firmware(firmware: &Firmware, config: &FlashConfig) -> Result<Self, FlashError> {
        let block_size = config.block_size.clamp(1, MAX_BLOCK_SIZE);
        let plan = match firmware {
            Firmware::Container(c) => {
                Self::from_binary(c.image(container::IMAGE)?, config.base_address, block_size)
            }
            Firmware::Hex(image) => Self::from_hex(image, block_size),
        };
        if plan.total_bytes == 0 {
            return Err(FlashError::EmptyImage);
        }
        Ok(plan)
    }

    /// Binary image at `base_address` in `block_size` chunks.
    pub fn from_binary(image: Vec<u8>, base_address: u32, block_size: usize) -> Self {
        let blocks = image
            .chunks(block_size)
            .enumerate()
            .map(|(i, chunk)| PlanBlock {
                address: base_address + (i * block_size) as u32,
                data: chunk.to_vec(),
            })
            .collect();
        Self {
            blocks,
            total_bytes: image.len() as u64,
            flat: image,
        }
    }

    /// Hex blocks in record order, each split into `block_size` chunks.
    pub fn from_hex(image: &SparseImage, block_size: usize) -> Self {
        let mut blocks = Vec::new();
        let mut flat = Vec::new();
        for block in image.blocks() {
            for (i, chunk) in block.data.chunks(block_size).enumerate() {
                blocks.push(PlanBlock {
                    address: block.address + (i * block_size) as u32,
                    data: chunk.to_vec(),
                });
            }
            let start = block.address as usize;
            let end = block.end() as usize;
            if flat.len() < end {
                flat.resize(end, ERASED);
            }
            flat[start..end].copy_from_slice(&block.data);
        }
        Self {
            total_bytes: image.total_bytes() as u64,
            blocks,
            flat,
        }
    }

    pub fn blocks(&self) -> &[PlanBlock] {
        &self.blocks
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Flash bytes spanned from the base address.
    pub fn span(&self) -> usize {
        self.flat.len()
    }

    /// CRC the bootloader should report once the plan is written.
    pub fn file_crc(&self, flash_size: u32) -> u32 {
        firmware_crc(&self.flat, flash_size)
    }
}

/// Cooperative cancellation flag, polled between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOutcome {
    Done { bytes: u64, crc: Option<u32> },
    /// Stopped on request; the device's flash contents are undefined.
    Cancelled { bytes_done: u64, bytes_total: u64 },
}

/// A run on a worker thread.
pub struct FlashHandle {
    cancel: CancelToken,
    handle: JoinHandle<Result<FlashOutcome, FlashError>>,
}

impl FlashHandle {
    /// Ask the worker to stop after the block in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker; `Err` only if it panicked.
    pub fn join(self) -> thread::Result<Result<FlashOutcome, FlashError>> {
        self.handle.join()
    }
}

/// Flash session - drives one device through a full upgrade.
pub struct FlashSession<O: FlashObserver> {
    config: FlashConfig,
    observer: Arc<O>,
    board_id: Option<u32>,
}

impl FlashSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: FlashConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: FlashObserver + 'static> FlashSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: FlashConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            board_id: None,
        }
    }

    /// Board id the device must report, overriding the firmware's own.
    pub fn with_board_id(mut self, board_id: u32) -> Self {
        self.board_id = Some(board_id);
        self
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    /// Flash over an already open transport.
    #[instrument(skip_all, fields(kind = %kind, port = %transport.port_name()))]
    pub fn run<T: SerialTransport + 'static>(
        &self,
        transport: T,
        firmware: &Firmware,
        kind: DeviceKind,
        cancel: &CancelToken,
    ) -> Result<FlashOutcome, FlashError> {
        let (stage, result) = self.execute(transport, firmware, kind, cancel);
        self.finish(stage, result)
    }

    /// Open `port` and flash, starting over on failures that allow it.
    pub fn run_on_port(
        &self,
        port: &str,
        firmware: &Firmware,
        kind: DeviceKind,
        cancel: &CancelToken,
    ) -> Result<FlashOutcome, FlashError> {
        let baud = match kind {
            DeviceKind::Board => self.config.baud_rate,
            DeviceKind::Radio => self.config.radio.data_baud,
        };
        self.run_with_opener(|| SerialPortTransport::open(port, baud), firmware, kind, cancel)
    }

    /// Like [`run_on_port`](Self::run_on_port) with a custom way to open the
    /// transport for each attempt.
    pub fn run_with_opener<T, F>(
        &self,
        mut open: F,
        firmware: &Firmware,
        kind: DeviceKind,
        cancel: &CancelToken,
    ) -> Result<FlashOutcome, FlashError>
    where
        T: SerialTransport + 'static,
        F: FnMut() -> Result<T, TransportError>,
    {
        let attempts = self.config.session_attempts.max(1);
        let mut attempt = 1;
        loop {
            let (stage, result) = match open() {
                Ok(transport) => {
                    self.emit(FlashEvent::PortOpened {
                        port: transport.port_name().to_string(),
                    });
                    self.execute(transport, firmware, kind, cancel)
                }
                Err(e) => (FlashState::Idle, Err(e.into())),
            };
            match result {
                Err(e)
                    if attempt < attempts && e.allows_session_retry() && !cancel.is_cancelled() =>
                {
                    warn!(attempt, attempts, error = %e, "Session failed, starting over");
                    self.emit(FlashEvent::Log {
                        level: LogLevel::Warn,
                        message: format!("Attempt {} of {} failed: {}", attempt, attempts, e),
                    });
                    attempt += 1;
                }
                result => return self.finish(stage, result),
            }
        }
    }

    /// Run on a dedicated worker thread that owns `port` exclusively.
    pub fn spawn(self, port: String, firmware: Firmware, kind: DeviceKind) -> FlashHandle {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = thread::spawn(move || self.run_on_port(&port, &firmware, kind, &token));
        FlashHandle { cancel, handle }
    }

    /// Run on a worker thread over an already open transport.
    pub fn spawn_with_transport<T: SerialTransport + 'static>(
        self,
        transport: T,
        firmware: Firmware,
        kind: DeviceKind,
    ) -> FlashHandle {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = thread::spawn(move || self.run(transport, &firmware, kind, &token));
        FlashHandle { cancel, handle }
    }

    /// One attempt. The transport is dropped before `PortReleased` on every
    /// path; returns the state the run stopped in.
    fn execute<T: SerialTransport + 'static>(
        &self,
        transport: T,
        firmware: &Firmware,
        kind: DeviceKind,
        cancel: &CancelToken,
    ) -> (FlashState, Result<FlashOutcome, FlashError>) {
        let port = transport.port_name().to_string();
        let mut ctx = StateMachineContext::new(self.config.retries.clone());

        let result = match FlashPlan::for_firmware(firmware, &self.config) {
            Ok(plan) => {
                let transport = ObservableTransport {
                    inner: transport,
                    observer: Arc::clone(&self.observer),
                    enabled: self.config.trace_packets,
                };
                let mut device: Box<dyn BootloaderDevice> = match kind {
                    DeviceKind::Board => Box::new(BoardBootloader::new(
                        transport,
                        &self.config.board,
                        &self.config.timeouts,
                    )),
                    DeviceKind::Radio => Box::new(RadioBootloader::new(
                        transport,
                        &self.config.radio,
                        &self.config.timeouts,
                    )),
                };
                let expected = self.board_id.or(firmware.board_id());
                let result = self.drive(device.as_mut(), &plan, expected, cancel, &mut ctx);
                drop(device);
                result
            }
            Err(e) => {
                drop(transport);
                Err(e)
            }
        };

        let stage = ctx.state;
        if result.is_err() {
            self.transition(&mut ctx, Input::Fail);
        }
        self.emit(FlashEvent::PortReleased { port });
        (stage, result)
    }

    fn drive(
        &self,
        device: &mut dyn BootloaderDevice,
        plan: &FlashPlan,
        expected_board: Option<u32>,
        cancel: &CancelToken,
        ctx: &mut StateMachineContext,
    ) -> Result<FlashOutcome, FlashError> {
        let total = plan.total_bytes();

        self.transition(ctx, Input::Start);
        self.step(ctx, device, Step::Prepare, |d| d.prepare())?;
        self.transition(ctx, Input::Prepared);

        self.step(ctx, device, Step::Sync, |d| d.sync())?;
        self.transition(ctx, Input::Synced);

        let info = self.step(ctx, device, Step::BoardInfo, |d| d.board_info())?;
        self.emit(FlashEvent::BoardInfo {
            kind: device.kind(),
            info,
        });
        if let Some(expected) = expected_board
            && expected != info.board_id
        {
            return Err(FlashError::BoardIdMismatch {
                expected,
                actual: info.board_id,
            });
        }
        if plan.span() > info.flash_size as usize {
            return Err(FlashError::ImageTooLarge {
                image_size: plan.span(),
                flash_size: info.flash_size,
            });
        }
        self.transition(ctx, Input::InfoAccepted);

        if cancel.is_cancelled() {
            return Ok(self.cancelled(ctx, 0, total));
        }
        self.step(ctx, device, Step::Erase, |d| d.erase())?;
        self.transition(ctx, Input::Erased);

        let count = plan.blocks().len();
        let mut done = 0u64;
        for (index, block) in plan.blocks().iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(ctx, done, total));
            }
            ctx.ledger.reset(Step::Program);
            ctx.ledger.reset(Step::Verify);

            self.step(ctx, device, Step::Program, |d| d.program(block.address, &block.data))?;
            self.transition(ctx, Input::Programmed);
            self.step(ctx, device, Step::Verify, |d| d.verify(block.address, &block.data))?;
            done += block.data.len() as u64;
            self.transition(
                ctx,
                Input::Verified {
                    more_blocks: index + 1 < count,
                },
            );
            self.emit(FlashEvent::Progress {
                stage: FlashState::Programming,
                bytes_done: done,
                bytes_total: total,
                message: None,
            });
        }

        let crc = if device.supports_crc() {
            let file_crc = plan.file_crc(info.flash_size);
            Some(self.step(ctx, device, Step::Crc, |d| d.crc_check(file_crc))?)
        } else {
            debug!("No device CRC; byte compare is the acceptance check");
            None
        };
        self.transition(ctx, Input::CrcDone);

        self.step(ctx, device, Step::Reboot, |d| d.reboot())?;
        self.transition(ctx, Input::Rebooted);

        Ok(FlashOutcome::Done { bytes: total, crc })
    }

    /// Run `op`, retrying retryable failures within the step's budget.
    fn step<R>(
        &self,
        ctx: &mut StateMachineContext,
        device: &mut dyn BootloaderDevice,
        step: Step,
        mut op: impl FnMut(&mut dyn BootloaderDevice) -> Result<R, ProtocolError>,
    ) -> Result<R, FlashError> {
        loop {
            let err = match op(&mut *device) {
                Ok(value) => return Ok(value),
                Err(e) => FlashError::from(e),
            };
            if !err.is_retryable() || !ctx.ledger.try_retry(step) {
                return Err(err);
            }
            let attempt = ctx.ledger.used(step);
            let budget = ctx.ledger.budget(step);
            warn!(step = %step, attempt, budget, error = %err, "Retrying step");
            self.emit(FlashEvent::Retry {
                step,
                attempt,
                budget,
                error: err.to_string(),
            });
            if let Err(e) = device.recover() {
                debug!(error = %e, "Recovery before retry failed");
            }
        }
    }

    fn cancelled(&self, ctx: &mut StateMachineContext, bytes_done: u64, bytes_total: u64) -> FlashOutcome {
        info!(bytes_done, bytes_total, "Cancellation requested");
        self.transition(ctx, Input::Cancel);
        FlashOutcome::Cancelled {
            bytes_done,
            bytes_total,
        }
    }

    fn transition(&self, ctx: &mut StateMachineContext, input: Input) {
        match ctx.apply(input) {
            Some((from, to)) => self.emit(FlashEvent::StateChanged { from, to }),
            None => warn!(state = %ctx.state, ?input, "Transition not in table"),
        }
    }

    /// Emit the one terminal event of a run.
    fn finish(
        &self,
        stage: FlashState,
        result: Result<FlashOutcome, FlashError>,
    ) -> Result<FlashOutcome, FlashError> {
        match &result {
            Ok(FlashOutcome::Done { bytes, crc }) => self.emit(FlashEvent::Done {
                bytes: *bytes,
                crc: *crc,
            }),
            Ok(FlashOutcome::Cancelled {
                bytes_done,
                bytes_total,
            }) => self.emit(FlashEvent::Cancelled {
                bytes_done: *bytes_done,
                bytes_total: *bytes_total,
            }),
            Err(e) => {
                error!(stage = %stage, kind = %e.kind(), "Flash failed: {}", e);
                self.emit(FlashEvent::Failed {
                    stage,
                    kind: e.kind(),
                    message: e.to_string(),
                    address: e.address(),
                });
            }
        }
        result
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<T: SerialTransport, O: FlashObserver> {
    inner: T,
    observer: Arc<O>,
    enabled: bool,
}

impl<T: SerialTransport, O: FlashObserver> ObservableTransport<T, O> {
    fn trace(&self, direction: PacketDirection, data: &[u8]) {
        if !self.enabled || data.is_empty() {
            return;
        }
        self.observer.on_event(&FlashEvent::Packet {
            direction,
            length: data.len(),
            data: Some(data.iter().take(PACKET_PREVIEW).copied().collect()),
        });
    }
}

impl<T: SerialTransport, O: FlashObserver> SerialTransport for ObservableTransport<T, O> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            self.trace(PacketDirection::Tx, data);
        }
        res
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read_exact(n, timeout);
        if let Ok(data) = &res {
            self.trace(PacketDirection::Rx, data);
        }
        res
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let res = self.inner.read_line(timeout);
        if let Ok(line) = &res {
            self.trace(PacketDirection::Rx, line.as_bytes());
        }
        res
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.inner.clear_input()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.inner.set_baud_rate(baud)
    }

    fn port_name(&self) -> &str {
        self.inner.port_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use crate::config::{RadioConfig, RetryPolicy};
    use crate::container::ContainerBuilder;
    use crate::error::ErrorKind;
    use crate::events::ChannelObserver;
    use crate::transport::MockTransport;
    use crate::transport::sim::{BoardFault, RadioFault, SimulatedBoard, SimulatedRadio};

    /// Records every event; optionally cancels after the n-th progress event.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<FlashEvent>>,
        progress: AtomicUsize,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl Recorder {
        fn cancelling_after(n: usize, token: CancelToken) -> Self {
            Self {
                cancel_after: Some((n, token)),
                ..Self::default()
            }
        }

        fn events(&self) -> Vec<FlashEvent> {
            self.events.lock().unwrap().clone()
        }

        fn terminal_events(&self) -> Vec<FlashEvent> {
            self.events().into_iter().filter(FlashEvent::is_terminal).collect()
        }

        fn count(&self, pred: impl Fn(&FlashEvent) -> bool) -> usize {
            self.events().iter().filter(|e| pred(*e)).count()
        }
    }

    impl FlashObserver for Recorder {
        fn on_event(&self, event: &FlashEvent) {
            if let FlashEvent::Progress { .. } = event {
                let n = self.progress.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some((after, token)) = &self.cancel_after
                    && n == *after
                {
                    token.cancel();
                }
            }
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn px4(board_id: u32, image: &[u8]) -> Firmware {
        let bytes = ContainerBuilder::new(board_id).image(image).unwrap().to_bytes();
        Firmware::from_bytes(&bytes).unwrap()
    }

    fn session(config: FlashConfig, recorder: Recorder) -> (FlashSession<Recorder>, Arc<Recorder>) {
        let recorder = Arc::new(recorder);
        (FlashSession::with_observer(config, Arc::clone(&recorder)), recorder)
    }

    /// Terminal event is last and comes right after the port release.
    fn assert_ends_cleanly(recorder: &Recorder) {
        let events = recorder.events();
        let n = events.len();
        assert!(events[n - 1].is_terminal());
        assert!(matches!(events[n - 2], FlashEvent::PortReleased { .. }));
        assert_eq!(recorder.terminal_events().len(), 1);
    }

    #[test]
    fn test_board_flash_done() {
        let sim = SimulatedBoard::new(9, 4096);
        let stats = sim.stats();
        let mock = MockTransport::with_device(sim);
        let probe = mock.probe();
        let (session, recorder) = session(FlashConfig::default(), Recorder::default());

        let image = pattern(1000);
        let outcome = session
            .run(mock, &px4(9, &image), DeviceKind::Board, &CancelToken::new())
            .unwrap();

        let crc = firmware_crc(&image, 4096);
        assert_eq!(
            outcome,
            FlashOutcome::Done {
                bytes: 1000,
                crc: Some(crc)
            }
        );
        assert!(probe.is_closed());
        assert_ends_cleanly(&recorder);

        let stats = stats.lock().unwrap();
        // 1000 bytes in 64-byte blocks
        assert_eq!(stats.program, 16);
        assert_eq!(stats.read, 16);
        assert_eq!(stats.crc, 1);
        assert_eq!(stats.reboot, 1);
        assert_eq!(
            recorder.count(|e| matches!(e, FlashEvent::Progress { .. })),
            16
        );
    }

    #[test]
    fn test_board_id_mismatch_fails_before_erase() {
        let sim = SimulatedBoard::new(42, 4096);
        let stats = sim.stats();
        let (session, recorder) = session(FlashConfig::default(), Recorder::default());

        let err = session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &pattern(256)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            FlashError::BoardIdMismatch {
                expected: 9,
                actual: 42
            }
        ));
        assert_eq!(stats.lock().unwrap().erase, 0);
        assert_eq!(
            recorder.terminal_events(),
            vec![FlashEvent::Failed {
                stage: FlashState::BoardInfoKnown,
                kind: ErrorKind::ContainerFormat,
                message: err.to_string(),
                address: None,
            }]
        );
    }

    #[test]
    fn test_defective_silicon_never_retried() {
        let mut config = FlashConfig::default();
        config.session_attempts = 3;
        let (session, recorder) = session(config, Recorder::default());

        let mut opens = 0;
        let opener = || {
            opens += 1;
            let sim = SimulatedBoard::new(9, 4096).with_fault(BoardFault::DefectiveSilicon);
            Ok(MockTransport::with_device(sim))
        };
        let err = session
            .run_with_opener(opener, &px4(9, &pattern(256)), DeviceKind::Board, &CancelToken::new())
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HardwareDefect);
        assert_eq!(opens, 1);
        assert_eq!(recorder.count(|e| matches!(e, FlashEvent::Retry { .. })), 0);
        assert_ends_cleanly(&recorder);
    }

    #[test]
    fn test_defective_silicon_single_sync() {
        let sim = SimulatedBoard::new(9, 4096).with_fault(BoardFault::DefectiveSilicon);
        let stats = sim.stats();
        let (session, _) = session(FlashConfig::default(), Recorder::default());

        let err = session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &pattern(256)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            FlashError::Protocol(ProtocolError::DefectiveHardware { .. })
        ));
        let stats = stats.lock().unwrap();
        assert_eq!(stats.sync, 1);
        assert_eq!(stats.erase, 0);
    }

    #[test]
    fn test_256k_image_in_64_byte_blocks() {
        const SIZE: usize = 256 * 1024;
        const BASE: u32 = 0x0800_4000;

        let sim = SimulatedBoard::new(9, SIZE).with_base_address(BASE);
        let stats = sim.stats();
        let mut config = FlashConfig::default();
        config.block_size = 64;
        config.base_address = BASE;
        let (session, recorder) = session(config, Recorder::default());

        let image = pattern(SIZE);
        let outcome = session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &image),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(
            outcome,
            FlashOutcome::Done {
                bytes: SIZE as u64,
                crc: Some(firmware_crc(&image, SIZE as u32))
            }
        );
        let stats = stats.lock().unwrap();
        assert_eq!(stats.program, 4096);
        assert_eq!(stats.read, 4096);
        assert_eq!(stats.crc, 1);
        assert_eq!(stats.crc_span, SIZE);
        assert_eq!(
            recorder.count(|e| matches!(e, FlashEvent::Progress { .. })),
            4096
        );
    }

    #[test]
    fn test_cancel_after_block_100() {
        const SIZE: usize = 256 * 1024;

        let sim = SimulatedBoard::new(9, SIZE);
        let stats = sim.stats();
        let mock = MockTransport::with_device(sim);
        let probe = mock.probe();
        let cancel = CancelToken::new();
        let (session, recorder) = session(
            FlashConfig::default(),
            Recorder::cancelling_after(100, cancel.clone()),
        );

        let outcome = session
            .run(mock, &px4(9, &pattern(SIZE)), DeviceKind::Board, &cancel)
            .unwrap();

        assert_eq!(
            outcome,
            FlashOutcome::Cancelled {
                bytes_done: 100 * 64,
                bytes_total: SIZE as u64
            }
        );
        {
            let stats = stats.lock().unwrap();
            assert_eq!(stats.program, 100);
            assert_eq!(stats.read, 100);
            assert_eq!(stats.crc, 0);
            assert_eq!(stats.reboot, 0);
        }
        assert!(probe.is_closed());
        assert_ends_cleanly(&recorder);
        assert!(matches!(
            recorder.terminal_events()[0],
            FlashEvent::Cancelled { .. }
        ));
    }

    #[test]
    fn test_readback_flip_fails_verify_with_address() {
        let sim = SimulatedBoard::new(9, 4096).with_fault(BoardFault::FlipBit {
            address: 0x83,
            mask: 0x10,
        });
        let stats = sim.stats();
        let (session, recorder) = session(FlashConfig::default(), Recorder::default());

        let err = session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &pattern(512)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.address(), Some(0x83));
        // Third block holds the flipped byte; nothing after it is written
        assert_eq!(stats.lock().unwrap().program, 3);
        match &recorder.terminal_events()[0] {
            FlashEvent::Failed { stage, address, .. } => {
                assert_eq!(*stage, FlashState::Verifying);
                assert_eq!(*address, Some(0x83));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_crc_mismatch_is_integrity_failure() {
        let sim = SimulatedBoard::new(9, 4096).with_fault(BoardFault::CrcOverride(0x1234_5678));
        let (session, recorder) = session(FlashConfig::default(), Recorder::default());

        let err = session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &pattern(300)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            FlashError::Protocol(ProtocolError::CrcMismatch {
                board_crc: 0x1234_5678,
                ..
            })
        ));
        match &recorder.terminal_events()[0] {
            FlashEvent::Failed { stage, kind, .. } => {
                assert_eq!(*stage, FlashState::CrcChecking);
                assert_eq!(*kind, ErrorKind::Integrity);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_program_retries_within_budget() {
        let sim = SimulatedBoard::new(9, 4096).with_fault(BoardFault::ProgramFails(2));
        let stats = sim.stats();
        let mut config = FlashConfig::default();
        config.retries.program = 3;
        let (session, recorder) = session(config, Recorder::default());

        session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &pattern(128)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(stats.lock().unwrap().program, 4);
        let retries: Vec<_> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::Retry { step, attempt, .. } => Some((step, attempt)),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(Step::Program, 1), (Step::Program, 2)]);
    }

    #[test]
    fn test_program_budget_exhausted() {
        let sim = SimulatedBoard::new(9, 4096).with_fault(BoardFault::ProgramFails(5));
        let mut config = FlashConfig::default();
        config.retries = RetryPolicy::uniform(1);
        let (session, recorder) = session(config, Recorder::default());

        let err = session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &pattern(128)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            FlashError::Protocol(ProtocolError::FlashWrite { address: 0, .. })
        ));
        assert_eq!(recorder.count(|e| matches!(e, FlashEvent::Retry { .. })), 1);
    }

    #[test]
    fn test_sync_retries_through_silence() {
        let sim = SimulatedBoard::new(9, 4096).with_fault(BoardFault::SilentSyncs(2));
        let stats = sim.stats();
        let (session, _) = session(FlashConfig::default(), Recorder::default());

        session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &pattern(64)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(stats.lock().unwrap().sync, 3);
    }

    #[test]
    fn test_image_larger_than_flash() {
        let sim = SimulatedBoard::new(9, 1024);
        let stats = sim.stats();
        let (session, _) = session(FlashConfig::default(), Recorder::default());

        let err = session
            .run(
                MockTransport::with_device(sim),
                &px4(9, &pattern(2048)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::ImageTooLarge {
                image_size: 2048,
                flash_size: 1024
            }
        ));
        assert_eq!(stats.lock().unwrap().erase, 0);
    }

    #[test]
    fn test_session_retry_after_lost_sync() {
        let mut config = FlashConfig::default();
        config.session_attempts = 2;
        config.retries.sync = 0;
        let (session, recorder) = session(config, Recorder::default());

        let mut opens = 0;
        let opener = || {
            opens += 1;
            let sim = if opens == 1 {
                SimulatedBoard::new(9, 4096).with_fault(BoardFault::SilentSyncs(10))
            } else {
                SimulatedBoard::new(9, 4096)
            };
            Ok(MockTransport::with_device(sim))
        };
        let outcome = session
            .run_with_opener(opener, &px4(9, &pattern(200)), DeviceKind::Board, &CancelToken::new())
            .unwrap();

        assert!(matches!(outcome, FlashOutcome::Done { bytes: 200, .. }));
        assert_eq!(opens, 2);
        assert_eq!(
            recorder.count(|e| matches!(e, FlashEvent::PortReleased { .. })),
            2
        );
        assert_eq!(recorder.terminal_events().len(), 1);
    }

    #[test]
    fn test_open_failure_is_transport_failure() {
        let (session, recorder) = session(FlashConfig::default(), Recorder::default());
        let err = session
            .run_with_opener(
                || -> Result<MockTransport, TransportError> {
                    Err(TransportError::Open {
                        port: "/dev/ttyUSB9".into(),
                        message: "No such file or directory".into(),
                    })
                },
                &px4(9, &pattern(64)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("No such file or directory"));
        assert_eq!(recorder.terminal_events().len(), 1);
    }

    #[test]
    fn test_radio_flash_skips_crc() {
        let sim = SimulatedRadio::new(78, 4096);
        let stats = sim.stats();
        let mut config = FlashConfig::default();
        config.radio = RadioConfig {
            guard_time_ms: 1,
            response_timeout_ms: 20,
            reboot_wait_ms: 50,
            flash_size: 4096,
            ..RadioConfig::default()
        };
        let (session, recorder) = session(config, Recorder::default());

        let hex = ihex::encode_bytes(0, &pattern(300)).unwrap().join("\n");
        let firmware = Firmware::from_bytes(hex.as_bytes()).unwrap();
        assert_eq!(firmware.default_kind(), DeviceKind::Radio);

        let outcome = session
            .run(
                MockTransport::with_device(sim),
                &firmware,
                DeviceKind::Radio,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(
            outcome,
            FlashOutcome::Done {
                bytes: 300,
                crc: None
            }
        );
        let stats = stats.lock().unwrap();
        assert_eq!(stats.crc, 0);
        assert_eq!(stats.erase, 1);
        assert_eq!(stats.reboot, 1);
        assert_ends_cleanly(&recorder);
    }

    #[test]
    fn test_radio_unresponsive_modem() {
        let sim = SimulatedRadio::new(78, 4096).with_fault(RadioFault::Unresponsive);
        let mut config = FlashConfig::default();
        config.radio.guard_time_ms = 1;
        config.radio.response_timeout_ms = 10;
        config.retries.prepare = 1;
        let (session, recorder) = session(config, Recorder::default());

        let hex = ihex::encode_bytes(0, &pattern(32)).unwrap().join("\n");
        let err = session
            .run(
                MockTransport::with_device(sim),
                &Firmware::from_bytes(hex.as_bytes()).unwrap(),
                DeviceKind::Radio,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::Protocol(ProtocolError::ModemUnresponsive(_))
        ));
        assert_eq!(recorder.count(|e| matches!(e, FlashEvent::Retry { .. })), 1);
    }

    #[test]
    fn test_spawned_worker_reports_over_channel() {
        let (observer, rx) = ChannelObserver::new();
        let session = FlashSession::with_observer(FlashConfig::default(), Arc::new(observer));
        let handle = session.spawn_with_transport(
            MockTransport::with_device(SimulatedBoard::new(9, 4096)),
            px4(9, &pattern(640)),
            DeviceKind::Board,
        );

        let outcome = handle.join().unwrap().unwrap();
        assert!(matches!(outcome, FlashOutcome::Done { bytes: 640, .. }));

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(FlashEvent::Done { bytes: 640, .. })));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, FlashEvent::Progress { .. }))
                .count(),
            10
        );
    }

    #[test]
    fn test_spawned_worker_stops_on_token_from_another_thread() {
        const SIZE: usize = 256 * 1024;

        let (observer, rx) = ChannelObserver::new();
        let session = FlashSession::with_observer(FlashConfig::default(), Arc::new(observer));
        let mock = MockTransport::with_device(SimulatedBoard::new(9, SIZE));
        let probe = mock.probe();
        let handle = session.spawn_with_transport(mock, px4(9, &pattern(SIZE)), DeviceKind::Board);

        // Same hand-off as the CLI interrupt handler: a clone of the token
        // cancelled from a thread that is not the worker.
        let token = handle.cancel_token();
        let mut seen = Vec::new();
        for event in rx.iter() {
            if let FlashEvent::Progress { .. } = event
                && !token.is_cancelled()
            {
                let token = token.clone();
                thread::spawn(move || token.cancel()).join().unwrap();
            }
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                break;
            }
        }

        match handle.join().unwrap().unwrap() {
            FlashOutcome::Cancelled {
                bytes_done,
                bytes_total,
            } => {
                assert!(bytes_done > 0);
                assert!(bytes_done < bytes_total);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(probe.is_closed());
        assert!(matches!(seen.last(), Some(FlashEvent::Cancelled { .. })));
    }

    #[test]
    fn test_packet_tracing() {
        let mut config = FlashConfig::default();
        config.trace_packets = true;
        let (session, recorder) = session(config, Recorder::default());
        session
            .run(
                MockTransport::with_device(SimulatedBoard::new(9, 4096)),
                &px4(9, &pattern(64)),
                DeviceKind::Board,
                &CancelToken::new(),
            )
            .unwrap();
        let first_tx = recorder.events().into_iter().find_map(|e| match e {
            FlashEvent::Packet {
                direction: PacketDirection::Tx,
                data,
                ..
            } => data,
            _ => None,
        });
        // GET_SYNC + EOC
        assert_eq!(first_tx, Some(vec![0x21, 0x20]));
    }

    #[test]
    fn test_firmware_detection() {
        let px4 = ContainerBuilder::new(9).image(&[1, 2, 3]).unwrap().to_bytes();
        let mut padded = b"\n  ".to_vec();
        padded.extend_from_slice(&px4);
        let firmware = Firmware::from_bytes(&padded).unwrap();
        assert_eq!(firmware.board_id(), Some(9));
        assert_eq!(firmware.format_name(), "px4");

        let hex = ihex::encode_bytes(0, &[1, 2, 3]).unwrap().join("\r\n");
        let firmware = Firmware::from_bytes(hex.as_bytes()).unwrap();
        assert_eq!(firmware.board_id(), None);

        assert!(matches!(
            Firmware::from_bytes(&[0x7F, b'E', b'L', b'F']),
            Err(FlashError::UnknownFormat(_))
        ));
        assert!(matches!(
            Firmware::from_bytes(b"   "),
            Err(FlashError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_firmware_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("radio.ihx");
        std::fs::write(&path, ihex::encode_bytes(0x10, &pattern(40)).unwrap().join("\n")).unwrap();
        match Firmware::load(&path).unwrap() {
            Firmware::Hex(image) => assert_eq!(image.total_bytes(), 40),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_image_rejected() {
        let (session, recorder) = session(FlashConfig::default(), Recorder::default());
        let mock = MockTransport::with_device(SimulatedBoard::new(9, 4096));
        let probe = mock.probe();
        let err = session
            .run(mock, &px4(9, &[]), DeviceKind::Board, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, FlashError::EmptyImage));
        assert!(probe.get_writes().is_empty());
        assert!(probe.is_closed());
        assert_ends_cleanly(&recorder);
    }

    #[test]
    fn test_plan_from_binary() {
        let plan = FlashPlan::from_binary(pattern(150), 0x100, 64);
        let addresses: Vec<_> = plan.blocks().iter().map(|b| b.address).collect();
        assert_eq!(addresses, vec![0x100, 0x140, 0x180]);
        assert_eq!(plan.blocks()[2].data.len(), 22);
        assert_eq!(plan.total_bytes(), 150);
        assert_eq!(plan.span(), 150);
    }

    #[test]
    fn test_plan_from_hex_fills_gaps() {
        let image = SparseImage::from_blocks(vec![
            ihex::HexBlock {
                address: 0,
                data: vec![1; 10],
            },
            ihex::HexBlock {
                address: 20,
                data: vec![2; 100],
            },
        ]);
        let plan = FlashPlan::from_hex(&image, 64);
        assert_eq!(plan.blocks().len(), 3);
        assert_eq!(plan.blocks()[2].address, 84);
        assert_eq!(plan.total_bytes(), 110);
        assert_eq!(plan.span(), 120);

        let mut flat = vec![1u8; 10];
        flat.extend([ERASED; 10]);
        flat.extend([2u8; 100]);
        assert_eq!(plan.file_crc(256), firmware_crc(&flat, 256));
    }
}
