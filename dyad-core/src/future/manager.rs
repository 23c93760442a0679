//! Future registry
//!
//! Gives futures their dense small-integer ids. Engines address
//! futures exclusively through the object-safe [`FutureRegistry`]
//! trait, so engine types stay independent of the manager's capacity
//! and multiple independent managers can coexist (there is no global
//! singleton; constructors take an explicit `&'static` reference).

use core::ptr::NonNull;

use crate::future::Payload;
use crate::lifecycle::{Registry, SlotId};

/// Object-safe view of a future manager.
///
/// `attach`/`rebind` are unsafe for the same reason
/// [`Registry::register`] is: the caller vouches that the payload
/// stays valid and in place until the slot is released.
pub trait FutureRegistry: Sync {
    /// Store `payload` in a free slot and hand out its id.
    ///
    /// # Safety
    ///
    /// `payload` must stay valid and at the same address until
    /// [`FutureRegistry::detach`] or a successful rebind replaces it.
    unsafe fn attach(&self, payload: NonNull<dyn Payload>) -> Option<SlotId>;

    /// Release slot `id` if it still holds `payload`.
    fn detach(&self, id: SlotId, payload: NonNull<dyn Payload>) -> bool;

    /// Swap slot `id` from `old` to `new`; no-op on a stale `old`.
    ///
    /// # Safety
    ///
    /// `new` carries the same obligation as
    /// [`FutureRegistry::attach`].
    unsafe fn rebind(
        &self,
        id: SlotId,
        old: NonNull<dyn Payload>,
        new: NonNull<dyn Payload>,
    ) -> bool;

    /// Resolve `id` and run `f` on the payload inside the critical
    /// section. Returns false if the slot is empty or out of range.
    fn resolve(&self, id: SlotId, f: &mut dyn FnMut(&dyn Payload)) -> bool;
}

/// Fixed-capacity future manager with `N` slots.
pub struct FutureManager<const N: usize> {
    slots: Registry<dyn Payload, N>,
}

impl<const N: usize> FutureManager<N> {
    pub const fn new() -> Self {
        Self {
            slots: Registry::new(),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.slots.contains(id)
    }

    /// Resolve `id` and run `f` on the registered payload.
    pub fn with<R>(&self, id: SlotId, f: impl FnOnce(&(dyn Payload + 'static)) -> R) -> Option<R> {
        self.slots.with(id, f)
    }
}

impl<const N: usize> Default for FutureManager<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FutureRegistry for FutureManager<N> {
    unsafe fn attach(&self, payload: NonNull<dyn Payload>) -> Option<SlotId> {
        // SAFETY: forwarded contract.
        unsafe { self.slots.register(payload) }
    }

    fn detach(&self, id: SlotId, payload: NonNull<dyn Payload>) -> bool {
        self.slots.deregister(id, payload)
    }

    unsafe fn rebind(
        &self,
        id: SlotId,
        old: NonNull<dyn Payload>,
        new: NonNull<dyn Payload>,
    ) -> bool {
        // SAFETY: forwarded contract.
        unsafe { self.slots.update(id, old, new) }
    }

    fn resolve(&self, id: SlotId, f: &mut dyn FnMut(&dyn Payload)) -> bool {
        self.slots.with(id, |payload| f(payload)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::{Future, Status};

    #[test]
    fn capacity_is_enforced_and_freed_ids_are_reusable() {
        static MGR: FutureManager<2> = FutureManager::new();

        let a = Future::<1>::new();
        let b = Future::<1>::new();
        let c = Future::<1>::new();

        a.register(&MGR).unwrap();
        b.register(&MGR).unwrap();
        assert_eq!(MGR.len(), 2);

        // A third registration must fail while both slots are taken.
        assert!(c.register(&MGR).is_err());

        // Consuming `a` frees its slot; the freed id comes back.
        let freed = a.id().unwrap();
        assert!(a.push(1));
        let mut out = [0u8; 1];
        assert!(a.get(&mut out));

        c.register(&MGR).unwrap();
        assert_eq!(c.id(), Some(freed));
    }

    #[test]
    fn dropping_a_future_releases_its_slot() {
        static MGR: FutureManager<1> = FutureManager::new();
        {
            let fut = Future::<1>::new();
            fut.register(&MGR).unwrap();
            assert_eq!(MGR.len(), 1);
        }
        assert_eq!(MGR.len(), 0);
    }

    #[test]
    fn resolve_reaches_the_registered_future() {
        static MGR: FutureManager<2> = FutureManager::new();
        let fut = Future::<1>::new();
        fut.register(&MGR).unwrap();
        let id = fut.id().unwrap();

        let mut pushed = false;
        assert!(MGR.resolve(id, &mut |payload| pushed = payload.push(0x42)));
        assert!(pushed);
        assert_eq!(fut.status(), Status::Ready);
    }

    #[test]
    fn resolve_of_a_stale_id_reports_absence() {
        static MGR: FutureManager<1> = FutureManager::new();
        let fut = Future::<1>::new();
        fut.register(&MGR).unwrap();
        let id = fut.id().unwrap();
        drop(fut);

        assert!(!MGR.resolve(id, &mut |_| {}));
    }
}
