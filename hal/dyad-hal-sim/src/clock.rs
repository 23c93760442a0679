//! Simulated monotonic clock

use core::cell::Cell;

use dyad_hal::clock::Clock;

/// Test clock. Advances manually via [`SimClock::advance`], or
/// automatically by a fixed step on every read when built with
/// [`SimClock::advancing`] - handy for driving timeout loops that poll
/// the clock.
#[derive(Debug)]
pub struct SimClock {
    now: Cell<u64>,
    step: u64,
}

impl SimClock {
    pub const fn new() -> Self {
        Self {
            now: Cell::new(0),
            step: 0,
        }
    }

    /// A clock that advances `step_ms` on every `now_ms` call.
    pub const fn advancing(step_ms: u64) -> Self {
        Self {
            now: Cell::new(0),
            step: step_ms,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        let t = self.now.get();
        self.now.set(t + self.step);
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_holds_still() {
        let clock = SimClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn advancing_clock_ticks_per_read() {
        let clock = SimClock::advancing(10);
        assert_eq!(clock.now_ms(), 0);
        assert_eq!(clock.now_ms(), 10);
        assert_eq!(clock.now_ms(), 20);
    }
}
