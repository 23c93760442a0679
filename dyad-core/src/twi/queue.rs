//! Two-phase command queue
//!
//! Commands are staged invisibly, then published atomically: the
//! engine's `pop` never sees a half-built transaction. The ready side
//! is a fixed-capacity ring; `stage` accounts for both sides so a
//! `commit` can never overflow.
//!
//! The queue itself is a plain data structure - the engines wrap it in
//! their critical section together with the rest of their state.

use heapless::{Deque, Vec};

use crate::error::Error;
use crate::lifecycle::SlotId;
use crate::twi::command::Command;

/// Fixed-capacity command queue with two-phase commit.
#[derive(Debug)]
pub struct CommandQueue<const N: usize> {
    ready: Deque<Command, N>,
    staged: Vec<Command, N>,
}

impl<const N: usize> CommandQueue<N> {
    pub const fn new() -> Self {
        Self {
            ready: Deque::new(),
            staged: Vec::new(),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Committed commands awaiting execution.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Staged (not yet visible) commands.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Stage a command for the next commit.
    ///
    /// Fails with `Overflow` when ready + staged would exceed the
    /// capacity, so a later commit always fits.
    pub fn stage(&mut self, command: Command) -> Result<(), Error> {
        if self.ready.len() + self.staged.len() >= N {
            return Err(Error::Overflow);
        }
        self.staged.push(command).map_err(|_| Error::Overflow)
    }

    /// Publish all staged commands in order, marking the last one as
    /// the end of its chain. Returns how many became visible.
    pub fn commit(&mut self) -> usize {
        let count = self.staged.len();
        if count == 0 {
            return 0;
        }
        for (i, &command) in self.staged.iter().enumerate() {
            let mut command = command;
            if i + 1 == count {
                command.flags.end_of_chain = true;
            }
            // Cannot fail: stage() reserved the room.
            let _ = self.ready.push_back(command);
        }
        self.staged.clear();
        count
    }

    /// Discard all staged commands. Returns how many were dropped.
    pub fn rollback(&mut self) -> usize {
        let count = self.staged.len();
        self.staged.clear();
        count
    }

    /// Take the oldest committed command.
    pub fn pop(&mut self) -> Option<Command> {
        self.ready.pop_front()
    }

    /// Drop every committed command.
    pub fn clear(&mut self) {
        while self.ready.pop_front().is_some() {}
    }

    /// Drop the committed commands sharing `future`. Returns how many
    /// were removed; the survivors keep their order.
    pub fn purge(&mut self, future: SlotId) -> usize {
        let mut removed = 0;
        for _ in 0..self.ready.len() {
            if let Some(command) = self.ready.pop_front() {
                if command.future == future {
                    removed += 1;
                } else {
                    let _ = self.ready.push_back(command);
                }
            }
        }
        removed
    }
}

impl<const N: usize> Default for CommandQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
