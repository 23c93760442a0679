//! Simulated Dyad bus backend
//!
//! In-memory implementations of the `dyad-hal` traits for host-side
//! testing: a scriptable bus peripheral with target devices and an
//! event log ([`SimBus`]), and a manually or automatically advancing
//! clock ([`SimClock`]). Engine tests assert exact wire sequences
//! against the event log instead of real hardware.

#![no_std]
#![deny(unsafe_code)]

pub mod bus;
pub mod clock;

pub use bus::{BusEvent, SimBus};
pub use clock::SimClock;
