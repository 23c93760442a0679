//! Futures: interrupt-fillable result containers
//!
//! A [`Future`] is a write-once-read-once value a bus engine fills
//! byte by byte from interrupt context while application code polls or
//! waits on it. Its status walks one way:
//!
//! ```text
//! Invalid --register--> NotReady --+--> Ready --get--> Invalid
//!                                  `--> Error
//! ```
//!
//! The output buffer size `O` and the optional input size `I` are
//! fixed at compile time; a `Future<0, I>` is a "void" future used
//! purely as a completion signal. All shared state sits behind a
//! critical-section mutex and every method takes `&self`, so a
//! registered future is never aliased by a `&mut` while an interrupt
//! handler holds a resolved reference to it.

pub mod manager;

use core::cell::RefCell;
use core::ptr::NonNull;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::error::Error;
use crate::future::manager::FutureRegistry;
use crate::lifecycle::SlotId;

/// Future lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// Not registered, or already consumed.
    Invalid,
    /// Registered and awaiting its producer.
    NotReady,
    /// Output complete; one `get` will consume it.
    Ready,
    /// The producer reported a failure; see [`Future::error`].
    Error,
}

/// Producer/engine side of a future.
///
/// Engines only ever see futures through this object-safe trait (via
/// the registry), so they are independent of the concrete buffer
/// sizes. Every method is a silent no-op, returning `false`/`None`,
/// when the future is not in the state that accepts it.
pub trait Payload {
    /// Append one byte to the output; `Ready` once capacity is hit.
    fn push(&self, byte: u8) -> bool;

    /// Append several bytes at once. Exceeding the remaining capacity
    /// moves the future to `Error(Overflow)` and stores nothing.
    fn push_all(&self, bytes: &[u8]) -> bool;

    /// Take the next input byte, advancing the read cursor.
    fn pull(&self) -> Option<u8>;

    /// Fill `buf` from the input, advancing the cursor; fails without
    /// consuming anything if fewer bytes remain than `buf` holds.
    fn pull_into(&self, buf: &mut [u8]) -> bool;

    /// Move `NotReady` to `Error(error)`.
    fn fail(&self, error: Error) -> bool;

    /// Force `Ready` on a future whose output is complete - the
    /// completion signal for void futures. Idempotent on `Ready`; a
    /// finish with unfilled output is a desync and moves to `Error`.
    fn finish(&self) -> bool;
}

#[derive(Clone, Copy)]
struct Binding {
    registry: &'static dyn FutureRegistry,
    id: SlotId,
}

struct Inner<const O: usize, const I: usize> {
    status: Status,
    error: Option<Error>,
    output: [u8; O],
    out_len: usize,
    input: [u8; I],
    in_len: usize,
    in_pos: usize,
    binding: Option<Binding>,
}

/// Write-once-read-once result container with `O` output bytes and an
/// optional `I`-byte input.
pub struct Future<const O: usize, const I: usize = 0> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner<O, I>>>,
}

impl<const O: usize, const I: usize> Future<O, I> {
    /// A fresh, unregistered future with no input.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                status: Status::Invalid,
                error: None,
                output: [0; O],
                out_len: 0,
                input: [0; I],
                in_len: 0,
                in_pos: 0,
                binding: None,
            })),
        }
    }

    /// A fresh, unregistered future carrying `input` for the engine to
    /// transmit.
    pub const fn with_input(input: [u8; I]) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                status: Status::Invalid,
                error: None,
                output: [0; O],
                out_len: 0,
                input,
                in_len: I,
                in_pos: 0,
                binding: None,
            })),
        }
    }

    pub fn status(&self) -> Status {
        self.inner.lock(|cell| cell.borrow().status)
    }

    /// The id this future is registered under, if any.
    pub fn id(&self) -> Option<SlotId> {
        self.inner
            .lock(|cell| cell.borrow().binding.map(|b| b.id))
    }

    /// Obtain an id from `registry` and become `NotReady`.
    ///
    /// Fails with `Invalid` if an id already exists or the future has
    /// not been (re)set to `Invalid`, and with `Overflow` if the
    /// registry has no free slot. Re-registering a consumed future
    /// resets its cursors and keeps its input.
    pub fn register(&self, registry: &'static dyn FutureRegistry) -> Result<(), Error> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.binding.is_some() || inner.status != Status::Invalid {
                return Err(Error::Invalid);
            }
            let payload = NonNull::from(self as &dyn Payload);
            // SAFETY: the slot is released before this future goes
            // away - Drop deregisters and `adopt` rebinds. Leaking a
            // registered future with mem::forget breaks that contract
            // and is the one thing this API cannot survive.
            let id = unsafe { registry.attach(payload) }.ok_or(Error::Overflow)?;
            inner.binding = Some(Binding { registry, id });
            inner.status = Status::NotReady;
            inner.error = None;
            inner.out_len = 0;
            inner.in_pos = 0;
            Ok(())
        })
    }

    /// Busy-wait until the status leaves `NotReady`.
    ///
    /// Yields a spin-loop hint between polls. Must not be called from
    /// interrupt context: only an interrupt can change the status.
    pub fn wait(&self) -> Status {
        loop {
            let status = self.status();
            if status != Status::NotReady {
                return status;
            }
            core::hint::spin_loop();
        }
    }

    /// Wait, then consume the output into `out`.
    ///
    /// On `Ready` the bytes are copied, the future is invalidated
    /// (deregistered, `Invalid`) and `true` is returned. Any other
    /// terminal status returns `false` and leaves the error readable.
    pub fn get(&self, out: &mut [u8; O]) -> bool {
        if self.wait() != Status::Ready {
            return false;
        }
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.status != Status::Ready {
                return false;
            }
            out.copy_from_slice(&inner.output);
            self.detach_locked(&mut inner);
            true
        })
    }

    /// The stored error code: `None` while no failure is recorded,
    /// `Error::Invalid` for an unregistered/consumed future.
    pub fn error(&self) -> Option<Error> {
        self.inner.lock(|cell| {
            let inner = cell.borrow();
            match inner.status {
                Status::Invalid => Some(Error::Invalid),
                Status::Error => inner.error,
                Status::NotReady | Status::Ready => None,
            }
        })
    }

    /// Replace the input value. Fails once the engine has started
    /// reading it.
    pub fn reset_input(&self, input: [u8; I]) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.in_pos > 0 {
                return false;
            }
            inner.input = input;
            inner.in_len = I;
            true
        })
    }

    /// Take over `src`'s identity and state after a relocation.
    ///
    /// Rust cannot hook moves, so relocating a registered future is
    /// explicit: build the destination, then `dst.adopt(&src)`. The
    /// slot is rebound to the new address, status/error/cursors carry
    /// over, and the source drops to `Invalid` with no id. A stale
    /// source (its slot no longer holds it) invalidates both sides and
    /// returns `false`.
    pub fn adopt(&self, src: &Self) -> bool {
        if core::ptr::eq(self, src) {
            return false;
        }
        self.inner.lock(|dst_cell| {
            src.inner.lock(|src_cell| {
                let mut dst = dst_cell.borrow_mut();
                let mut from = src_cell.borrow_mut();
                if dst.binding.is_some() || dst.status != Status::Invalid {
                    return false;
                }
                let Some(binding) = from.binding.take() else {
                    return false;
                };
                let old = NonNull::from(src as &dyn Payload);
                let new = NonNull::from(self as &dyn Payload);
                // SAFETY: `new` is this future, which honors the same
                // release-before-death contract as register.
                let rebound = unsafe { binding.registry.rebind(binding.id, old, new) };
                if !rebound {
                    from.status = Status::Invalid;
                    return false;
                }
                dst.status = from.status;
                dst.error = from.error;
                dst.output = from.output;
                dst.out_len = from.out_len;
                dst.input = from.input;
                dst.in_len = from.in_len;
                dst.in_pos = from.in_pos;
                dst.binding = Some(binding);
                from.status = Status::Invalid;
                from.error = None;
                from.out_len = 0;
                from.in_pos = 0;
                true
            })
        })
    }

    fn detach_locked(&self, inner: &mut Inner<O, I>) {
        if let Some(binding) = inner.binding.take() {
            let payload = NonNull::from(self as &dyn Payload);
            let _ = binding.registry.detach(binding.id, payload);
        }
        inner.status = Status::Invalid;
    }
}

impl<const O: usize, const I: usize> Default for Future<O, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const O: usize, const I: usize> Drop for Future<O, I> {
    fn drop(&mut self) {
        let this: &Self = self;
        this.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            this.detach_locked(&mut inner);
        });
    }
}

impl<const O: usize, const I: usize> Payload for Future<O, I> {
    fn push(&self, byte: u8) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.status != Status::NotReady {
                return false;
            }
            if inner.out_len >= O {
                inner.status = Status::Error;
                inner.error = Some(Error::Overflow);
                return false;
            }
            let at = inner.out_len;
            inner.output[at] = byte;
            inner.out_len = at + 1;
            if inner.out_len == O {
                inner.status = Status::Ready;
            }
            true
        })
    }

    fn push_all(&self, bytes: &[u8]) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.status != Status::NotReady {
                return false;
            }
            let at = inner.out_len;
            if at + bytes.len() > O {
                inner.status = Status::Error;
                inner.error = Some(Error::Overflow);
                return false;
            }
            inner.output[at..at + bytes.len()].copy_from_slice(bytes);
            inner.out_len = at + bytes.len();
            if inner.out_len == O {
                inner.status = Status::Ready;
            }
            true
        })
    }

    fn pull(&self) -> Option<u8> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.in_pos >= inner.in_len {
                return None;
            }
            let byte = inner.input[inner.in_pos];
            inner.in_pos += 1;
            Some(byte)
        })
    }

    fn pull_into(&self, buf: &mut [u8]) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let available = inner.in_len - inner.in_pos;
            if available < buf.len() {
                return false;
            }
            let from = inner.in_pos;
            buf.copy_from_slice(&inner.input[from..from + buf.len()]);
            inner.in_pos = from + buf.len();
            true
        })
    }

    fn fail(&self, error: Error) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.status != Status::NotReady {
                return false;
            }
            inner.status = Status::Error;
            inner.error = Some(error);
            true
        })
    }

    fn finish(&self) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            match inner.status {
                Status::Ready => true,
                Status::NotReady if inner.out_len == O => {
                    inner.status = Status::Ready;
                    true
                }
                Status::NotReady => {
                    inner.status = Status::Error;
                    inner.error = Some(Error::Desync);
                    false
                }
                Status::Invalid | Status::Error => false,
            }
        })
    }
}
