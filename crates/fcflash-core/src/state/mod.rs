//! State machine module.

pub mod machine;

pub use machine::{FlashState, Input, RetryLedger, StateMachineContext, Step};
