//! Bus commands
//!
//! A [`Command`] is the unit of queued work: one read or write of a
//! fixed byte count against one target, carrying the id of the future
//! that sources or sinks the payload. Commands hold the id (a light
//! proxy), never an address - the future may relocate while the
//! command waits in the queue.

use dyad_hal::twi::Direction;

use crate::lifecycle::SlotId;

/// Per-command behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandFlags {
    /// Force a STOP after this command even mid-transaction.
    pub stop: bool,
    /// Call `finish()` on the future when the command completes.
    pub finish: bool,
    /// Last command of a committed transaction; set by the queue on
    /// commit. Implies a STOP.
    pub end_of_chain: bool,
}

impl CommandFlags {
    pub const fn none() -> Self {
        Self {
            stop: false,
            finish: false,
            end_of_chain: false,
        }
    }
}

/// One queued bus operation. Consumed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Command {
    pub direction: Direction,
    /// 7-bit target address.
    pub target: u8,
    /// Payload byte count.
    pub length: u8,
    pub flags: CommandFlags,
    /// Light proxy to the payload future.
    pub future: SlotId,
}

impl Command {
    /// A write of `length` bytes pulled from `future`'s input.
    pub const fn write(target: u8, length: u8, future: SlotId) -> Self {
        Self {
            direction: Direction::Write,
            target,
            length,
            flags: CommandFlags::none(),
            future,
        }
    }

    /// A read of `length` bytes pushed into `future`'s output.
    pub const fn read(target: u8, length: u8, future: SlotId) -> Self {
        Self {
            direction: Direction::Read,
            target,
            length,
            flags: CommandFlags::none(),
            future,
        }
    }

    /// Force a STOP after this command.
    pub const fn with_stop(mut self) -> Self {
        self.flags.stop = true;
        self
    }

    /// Finish the future when this command completes - the completion
    /// signal for void (zero-output) futures.
    pub const fn with_finish(mut self) -> Self {
        self.flags.finish = true;
        self
    }
}
