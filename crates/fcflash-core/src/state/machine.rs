//! Flash state machine: states, inputs and the transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlashState {
    #[default]
    Idle,
    /// Bringing the device into its bootloader (radio only does work here).
    Preparing,
    Syncing,
    /// Board info read and gates passed.
    BoardInfoKnown,
    Erasing,
    Programming,
    Verifying,
    CrcChecking,
    Rebooting,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashState::Idle => write!(f, "IDLE"),
            FlashState::Preparing => write!(f, "PREPARING"),
            FlashState::Syncing => write!(f, "SYNCING"),
            FlashState::BoardInfoKnown => write!(f, "BOARD_INFO_KNOWN"),
            FlashState::Erasing => write!(f, "ERASING"),
            FlashState::Programming => write!(f, "PROGRAMMING"),
            FlashState::Verifying => write!(f, "VERIFYING"),
            FlashState::CrcChecking => write!(f, "CRC_CHECKING"),
            FlashState::Rebooting => write!(f, "REBOOTING"),
            FlashState::Done => write!(f, "DONE"),
            FlashState::Failed => write!(f, "FAILED"),
            FlashState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// What just happened, as fed to [`FlashState::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Start,
    Prepared,
    Synced,
    /// Board info read; board id and flash size gates passed.
    InfoAccepted,
    Erased,
    Programmed,
    /// Block read back and matched.
    Verified { more_blocks: bool },
    /// CRC matched, or the device has no CRC command.
    CrcDone,
    Rebooted,
    Fail,
    Cancel,
}

impl FlashState {
    /// Transition table. `None` means the input is not valid here.
    pub fn next(self, input: Input) -> Option<FlashState> {
        use FlashState::*;

        if self.is_terminal() {
            return None;
        }
        match (self, input) {
            (_, Input::Fail) => Some(Failed),
            (Idle, Input::Cancel) => None,
            (_, Input::Cancel) => Some(Cancelled),
            (Idle, Input::Start) => Some(Preparing),
            (Preparing, Input::Prepared) => Some(Syncing),
            (Syncing, Input::Synced) => Some(BoardInfoKnown),
            (BoardInfoKnown, Input::InfoAccepted) => Some(Erasing),
            (Erasing, Input::Erased) => Some(Programming),
            (Programming, Input::Programmed) => Some(Verifying),
            (Verifying, Input::Verified { more_blocks: true }) => Some(Programming),
            (Verifying, Input::Verified { more_blocks: false }) => Some(CrcChecking),
            (CrcChecking, Input::CrcDone) => Some(Rebooting),
            (Rebooting, Input::Rebooted) => Some(Done),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FlashState::Done | FlashState::Failed | FlashState::Cancelled)
    }

    /// The retry step that runs in this state.
    pub fn step(self) -> Option<Step> {
        match self {
            FlashState::Preparing => Some(Step::Prepare),
            FlashState::Syncing => Some(Step::Sync),
            FlashState::BoardInfoKnown => Some(Step::BoardInfo),
            FlashState::Erasing => Some(Step::Erase),
            FlashState::Programming => Some(Step::Program),
            FlashState::Verifying => Some(Step::Verify),
            FlashState::CrcChecking => Some(Step::Crc),
            FlashState::Rebooting => Some(Step::Reboot),
            _ => None,
        }
    }
}

/// Logical step owning a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Prepare,
    Sync,
    BoardInfo,
    Erase,
    Program,
    Verify,
    Crc,
    Reboot,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::Prepare,
        Step::Sync,
        Step::BoardInfo,
        Step::Erase,
        Step::Program,
        Step::Verify,
        Step::Crc,
        Step::Reboot,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Prepare => "prepare",
            Step::Sync => "sync",
            Step::BoardInfo => "board info",
            Step::Erase => "erase",
            Step::Program => "program",
            Step::Verify => "verify",
            Step::Crc => "crc",
            Step::Reboot => "reboot",
        };
        write!(f, "{}", name)
    }
}

/// Retries spent per step, checked against the policy.
///
/// Counters are independent: exhausting one step never touches another's
/// budget.
#[derive(Debug, Clone)]
pub struct RetryLedger {
    policy: RetryPolicy,
    used: [u32; 8],
}

impl RetryLedger {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            used: [0; 8],
        }
    }

    /// Take one retry for `step`; `false` once the budget is spent.
    pub fn try_retry(&mut self, step: Step) -> bool {
        let used = &mut self.used[step.index()];
        if *used >= self.policy.budget(step) {
            return false;
        }
        *used += 1;
        true
    }

    pub fn used(&self, step: Step) -> u32 {
        self.used[step.index()]
    }

    pub fn budget(&self, step: Step) -> u32 {
        self.policy.budget(step)
    }

    /// Start a fresh count, e.g. for the next block.
    pub fn reset(&mut self, step: Step) {
        self.used[step.index()] = 0;
    }
}

/// Current state plus its retry ledger.
#[derive(Debug, Clone)]
pub struct StateMachineContext {
    pub state: FlashState,
    pub ledger: RetryLedger,
}

impl StateMachineContext {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: FlashState::Idle,
            ledger: RetryLedger::new(policy),
        }
    }

    /// Apply `input`; returns the old and new state, or `None` if the
    /// transition is not in the table (the state is left unchanged).
    pub fn apply(&mut self, input: Input) -> Option<(FlashState, FlashState)> {
        let from = self.state;
        let to = from.next(input)?;
        tracing::debug!(from = %from, to = %to, "State transition");
        self.state = to;
        Some((from, to))
    }
}
