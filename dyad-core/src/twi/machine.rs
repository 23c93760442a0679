//! Protocol transition table
//!
//! One state machine serves both drivers: the blocking driver
//! re-enters [`Machine::step`] in a polling loop, the asynchronous
//! driver re-enters it once per hardware interrupt. A step reads the
//! outcome of the previously initiated micro-operation, transitions,
//! and initiates the next one.
//!
//! ```text
//! Idle -> StartSent -> AddressSent -> DataTransfer* -> StopSent -> Idle
//! ```
//!
//! The machine owns the repeat-start bookkeeping (`bus_open`): a
//! command that completes without a STOP leaves the bus held, and the
//! next `begin_op` turns into a repeated START, which is what makes
//! chained commands atomic on the wire.

use dyad_hal::twi::{Direction, TwiBus, TwiStatus};

use crate::error::Error;
use crate::future::Payload;
use crate::twi::command::Command;
use crate::twi::{DebugHook, DebugStep, StatusHook};

/// Protocol phase of the in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    StartSent,
    AddressSent,
    DataTransfer,
    StopSent,
}

/// Execution state of one command, live while it is on the bus.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpState {
    pub direction: Direction,
    pub target: u8,
    pub remaining: usize,
    pub stop: bool,
    pub finish: bool,
    pub end_of_chain: bool,
}

impl OpState {
    pub(crate) fn of(command: &Command) -> Self {
        Self {
            direction: command.direction,
            target: command.target,
            remaining: command.length as usize,
            stop: command.flags.stop,
            finish: command.flags.finish,
            end_of_chain: command.flags.end_of_chain,
        }
    }
}

/// Outcome of one `step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepResult {
    /// Waiting for the next bus event.
    Pending,
    /// The command completed; the machine stopped or left the bus
    /// open according to the command's flags and `more`.
    Done,
    /// The command failed; its future carries the error and a STOP
    /// was forced. The caller applies its recovery policy.
    Failed(Error),
}

pub(crate) struct Machine {
    phase: Phase,
    bus_open: bool,
    expected: TwiStatus,
    debug_hook: Option<DebugHook>,
    status_hook: Option<StatusHook>,
}

impl Machine {
    pub const fn new(debug_hook: Option<DebugHook>, status_hook: Option<StatusHook>) -> Self {
        Self {
            phase: Phase::Idle,
            bus_open: false,
            expected: TwiStatus::Idle,
            debug_hook,
            status_hook,
        }
    }

    pub fn bus_open(&self) -> bool {
        self.bus_open
    }

    fn note(&self, step: DebugStep, byte: u8) {
        if let Some(hook) = self.debug_hook {
            hook(step, byte);
        }
    }

    fn observe(&self, actual: TwiStatus) {
        if let Some(hook) = self.status_hook {
            hook(self.expected, actual);
        }
    }

    /// Put a command on the bus: START on a released bus, repeated
    /// START on one held open by the previous command.
    pub fn begin_op<B: TwiBus>(&mut self, bus: &mut B, _op: &OpState) {
        if self.bus_open {
            self.note(DebugStep::RepeatStart, 0);
            bus.raise_repeat_start();
            self.expected = TwiStatus::RepeatStart;
        } else {
            self.note(DebugStep::Start, 0);
            bus.raise_start();
            self.expected = TwiStatus::Start;
            self.bus_open = true;
        }
        self.phase = Phase::StartSent;
    }

    /// Process the outcome of the last micro-operation and initiate
    /// the next one. `more` tells the machine whether further commands
    /// are queued behind this one; the last command of a transaction
    /// always forces a STOP.
    pub fn step<B: TwiBus>(
        &mut self,
        bus: &mut B,
        op: &mut OpState,
        payload: &dyn Payload,
        more: bool,
    ) -> StepResult {
        let actual = bus.status();
        if actual == TwiStatus::Busy {
            return StepResult::Pending;
        }
        match self.phase {
            Phase::Idle | Phase::StopSent => StepResult::Pending,
            Phase::StartSent => {
                self.observe(actual);
                if actual != self.expected {
                    return self.fail_op(bus, payload, Error::Protocol);
                }
                let header = (op.target << 1) | matches!(op.direction, Direction::Read) as u8;
                match op.direction {
                    Direction::Write => self.note(DebugStep::SlaW, header),
                    Direction::Read => self.note(DebugStep::SlaR, header),
                }
                bus.send_address(op.target, op.direction);
                self.expected = TwiStatus::SlaAck;
                self.phase = Phase::AddressSent;
                StepResult::Pending
            }
            Phase::AddressSent => {
                self.observe(actual);
                if actual != TwiStatus::SlaAck {
                    return self.fail_op(bus, payload, Error::Protocol);
                }
                if op.remaining == 0 {
                    // Address-only command (probe): done after the ack.
                    return self.complete_op(bus, op, payload, more);
                }
                self.phase = Phase::DataTransfer;
                self.advance(bus, op, payload)
            }
            Phase::DataTransfer => {
                self.observe(actual);
                match op.direction {
                    Direction::Write => match actual {
                        TwiStatus::DataAck => {
                            self.note(DebugStep::SendOk, 0);
                            if op.remaining == 0 {
                                self.complete_op(bus, op, payload, more)
                            } else {
                                self.advance(bus, op, payload)
                            }
                        }
                        // A NACK on the last byte of a write only means
                        // the target wants no more; the write itself
                        // succeeded.
                        TwiStatus::DataNack if op.remaining == 0 => {
                            self.note(DebugStep::SendOk, 0);
                            self.complete_op(bus, op, payload, more)
                        }
                        _ => {
                            self.note(DebugStep::SendError, 0);
                            self.fail_op(bus, payload, Error::Protocol)
                        }
                    },
                    Direction::Read => {
                        let wanted = if op.remaining == 1 {
                            TwiStatus::DataNack
                        } else {
                            TwiStatus::DataAck
                        };
                        if actual != wanted {
                            self.note(DebugStep::RecvError, 0);
                            return self.fail_op(bus, payload, Error::Protocol);
                        }
                        let byte = bus.data();
                        self.note(DebugStep::RecvOk, byte);
                        if !payload.push(byte) {
                            return self.fail_op(bus, payload, Error::Overflow);
                        }
                        op.remaining -= 1;
                        if op.remaining == 0 {
                            self.complete_op(bus, op, payload, more)
                        } else {
                            self.advance(bus, op, payload)
                        }
                    }
                }
            }
        }
    }

    /// Initiate the next payload byte.
    fn advance<B: TwiBus>(
        &mut self,
        bus: &mut B,
        op: &mut OpState,
        payload: &dyn Payload,
    ) -> StepResult {
        match op.direction {
            Direction::Write => {
                let Some(byte) = payload.pull() else {
                    // The future has fewer input bytes than the command
                    // promised: producer and command disagree.
                    return self.fail_op(bus, payload, Error::Desync);
                };
                self.note(DebugStep::Send, byte);
                bus.send_byte(byte);
                op.remaining -= 1;
                self.expected = TwiStatus::DataAck;
                StepResult::Pending
            }
            Direction::Read => {
                let last = op.remaining == 1;
                self.note(
                    if last {
                        DebugStep::RecvLast
                    } else {
                        DebugStep::Recv
                    },
                    0,
                );
                bus.receive_byte(last);
                self.expected = if last {
                    TwiStatus::DataNack
                } else {
                    TwiStatus::DataAck
                };
                StepResult::Pending
            }
        }
    }

    fn complete_op<B: TwiBus>(
        &mut self,
        bus: &mut B,
        op: &OpState,
        payload: &dyn Payload,
        more: bool,
    ) -> StepResult {
        if op.finish {
            let _ = payload.finish();
        }
        if op.stop || op.end_of_chain || !more {
            self.release(bus);
        } else {
            // Keep the bus held: the next command repeat-starts and no
            // other controller can slip in between.
            self.phase = Phase::Idle;
        }
        StepResult::Done
    }

    fn fail_op<B: TwiBus>(
        &mut self,
        bus: &mut B,
        payload: &dyn Payload,
        error: Error,
    ) -> StepResult {
        let _ = payload.fail(error);
        self.release(bus);
        StepResult::Failed(error)
    }

    /// Force a STOP and idle the machine. The bus must never stay
    /// held once nothing is queued behind the current command.
    pub fn release<B: TwiBus>(&mut self, bus: &mut B) {
        self.note(DebugStep::Stop, 0);
        bus.raise_stop();
        self.bus_open = false;
        self.phase = Phase::StopSent;
    }
}
