//! Two-wire bus transaction engine
//!
//! The protocol state machine lives in one place ([`machine`]) and is
//! driven two ways: [`blocking::BlockingTwi`] polls it in a tight
//! loop, [`asynch::AsyncTwi`] advances it one step per hardware
//! interrupt against a queue of commands. Both map protocol outcomes
//! onto futures (or plain slices, for the blocking convenience API)
//! and honor the same recovery policy and observer hooks.

pub mod asynch;
pub mod blocking;
pub mod command;
pub(crate) mod machine;
pub mod queue;

pub use asynch::AsyncTwi;
pub use blocking::BlockingTwi;
pub use command::{Command, CommandFlags};
pub use queue::CommandQueue;

use dyad_hal::twi::{BusConfig, TwiStatus};

/// What happens to queued commands when a command fails on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecoveryPolicy {
    /// Empty the whole queue: after a fault, the remaining commands
    /// are assumed to belong to a now-meaningless sequence.
    #[default]
    ClearAll,
    /// Drop only the commands sharing the failed command's future;
    /// unrelated traffic keeps running.
    ClearTransaction,
}

/// One protocol-level action, as reported to the debug hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DebugStep {
    Start,
    RepeatStart,
    /// Address byte with the write bit (payload: the wire byte).
    SlaW,
    /// Address byte with the read bit (payload: the wire byte).
    SlaR,
    /// Data byte clocked out (payload: the byte).
    Send,
    /// Reception of an intermediate byte initiated.
    Recv,
    /// Reception of the final byte initiated (will be NACKed).
    RecvLast,
    Stop,
    SendOk,
    SendError,
    /// Data byte clocked in (payload: the byte).
    RecvOk,
    RecvError,
}

/// Debug observer: fires on every micro-step.
pub type DebugHook = fn(DebugStep, u8);

/// Status observer: fires on every status check with the expected and
/// the actual low-level status.
pub type StatusHook = fn(TwiStatus, TwiStatus);

/// Engine configuration. Observer hooks are attached here, at
/// construction; both default to none and cost nothing when absent.
#[derive(Debug, Clone, Copy)]
pub struct TwiConfig {
    pub bus: BusConfig,
    pub recovery: RecoveryPolicy,
    pub debug_hook: Option<DebugHook>,
    pub status_hook: Option<StatusHook>,
}

impl TwiConfig {
    pub const fn new() -> Self {
        Self {
            bus: BusConfig::STANDARD,
            recovery: RecoveryPolicy::ClearAll,
            debug_hook: None,
            status_hook: None,
        }
    }
}

impl Default for TwiConfig {
    fn default() -> Self {
        Self::new()
    }
}
