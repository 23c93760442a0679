//! Monotonic clock abstraction
//!
//! The engines themselves are clock-free; only the blocking timed
//! receive path consumes this trait, so targets without a timer never
//! have to provide one.

/// Monotonic millisecond clock.
pub trait Clock {
    /// Milliseconds since an arbitrary, fixed origin. Never decreases.
    fn now_ms(&self) -> u64;
}
