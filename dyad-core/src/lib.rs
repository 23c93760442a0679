//! Board-agnostic core of the Dyad two-wire bus engine
//!
//! This crate contains everything that does not depend on a concrete
//! bus peripheral:
//!
//! - Futures: write-once-read-once result containers an interrupt
//!   handler can fill while ordinary code waits
//! - Lifecycle registry and proxies for objects referenced across the
//!   interrupt boundary
//! - The command model and its two-phase queue
//! - The two-wire protocol state machine with its blocking (polling)
//!   and asynchronous (interrupt-stepped) drivers
//!
//! Hardware access goes exclusively through the `dyad-hal` traits, so
//! the whole crate runs against the simulated backend on a host.

#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod future;
pub mod lifecycle;
pub mod twi;

pub use error::Error;
