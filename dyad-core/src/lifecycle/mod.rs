//! Lifecycle registry and proxies
//!
//! Interrupt-driven code must never hold a raw reference to an
//! application object across a suspension point: the object may have
//! moved or died by the time the interrupt fires. The registry hands
//! out small dense ids instead; a [`LightProxy`] carries only the id
//! and resolves it to a live reference at the point of use, inside a
//! critical section. Objects that provably never move (statics) can
//! skip the lookup with a [`DirectProxy`].
//!
//! The slot tables are fixed-capacity and shared between main-line
//! code and interrupt handlers; every access runs under a
//! `CriticalSectionRawMutex`, so each protected region is a handful of
//! loads and stores.

use core::cell::RefCell;
use core::marker::PhantomData;
use core::num::NonZeroU8;
use core::ptr::NonNull;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// Dense registry slot id. Slot `i` carries id `i + 1`; "no id" is
/// expressed as `Option<SlotId>` rather than a reserved zero value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(NonZeroU8);

impl SlotId {
    fn from_index(index: usize) -> Option<Self> {
        let raw = u8::try_from(index + 1).ok()?;
        NonZeroU8::new(raw).map(Self)
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(raw: NonZeroU8) -> Self {
        Self(raw)
    }

    /// The raw id value (1-based).
    pub fn get(self) -> u8 {
        self.0.get()
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for SlotId {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "SlotId({})", self.0.get());
    }
}

/// Compare registry entries by object address only. Fat-pointer
/// metadata (vtables) is not guaranteed unique per type, so it must
/// not participate in identity checks.
fn same<T: ?Sized>(a: NonNull<T>, b: NonNull<T>) -> bool {
    a.cast::<u8>() == b.cast::<u8>()
}

struct SlotTable<T: ?Sized, const N: usize> {
    slots: [Option<NonNull<T>>; N],
    /// Index where the next registration scan begins; parked on the
    /// most-recently-freed slot so steady churn re-registers in O(1).
    cursor: usize,
}

// SAFETY: the pointers cross the interrupt boundary by design. They are
// only stored and compared outside the owning registry's critical
// section, and only dereferenced inside it, which serializes main-line
// and interrupt access.
unsafe impl<T: ?Sized, const N: usize> Send for SlotTable<T, N> {}

/// Fixed-capacity table of id -> object slots.
///
/// The registry stores raw addresses. `register` is unsafe because the
/// caller promises the object stays at that address until it is
/// deregistered (or rebound via [`Registry::update`]); everything else
/// is safe because resolution is closure-scoped and the reference can
/// never leave the critical section.
pub struct Registry<T: ?Sized, const N: usize> {
    table: Mutex<CriticalSectionRawMutex, RefCell<SlotTable<T, N>>>,
}

impl<T: ?Sized, const N: usize> Registry<T, N> {
    pub const fn new() -> Self {
        assert!(N >= 1 && N <= u8::MAX as usize);
        Self {
            table: Mutex::new(RefCell::new(SlotTable {
                slots: [None; N],
                cursor: 0,
            })),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.table
            .lock(|table| table.borrow().slots.iter().filter(|s| s.is_some()).count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `object` in a free slot and return its id.
    ///
    /// Fails if the object is already registered or no slot is free.
    ///
    /// # Safety
    ///
    /// `object` must point to a live value that stays valid and at the
    /// same address until [`Registry::deregister`] releases the slot or
    /// [`Registry::update`] rebinds it to the value's new address.
    pub unsafe fn register(&self, object: NonNull<T>) -> Option<SlotId> {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            if table
                .slots
                .iter()
                .any(|slot| matches!(slot, Some(p) if same(*p, object)))
            {
                return None;
            }
            for offset in 0..N {
                let index = (table.cursor + offset) % N;
                if table.slots[index].is_none() {
                    table.slots[index] = Some(object);
                    table.cursor = (index + 1) % N;
                    return SlotId::from_index(index);
                }
            }
            None
        })
    }

    /// Release the slot `id`, if it still holds `object`.
    pub fn deregister(&self, id: SlotId, object: NonNull<T>) -> bool {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            let index = id.index();
            let current = table.slots.get(index).copied().flatten();
            match current {
                Some(p) if same(p, object) => {
                    table.slots[index] = None;
                    table.cursor = index;
                    true
                }
                _ => false,
            }
        })
    }

    /// Point slot `id` at `new` instead of `old`.
    ///
    /// No-op if the slot does not currently hold `old`: a stale update
    /// racing a concurrent resolve must lose, not corrupt the slot.
    ///
    /// # Safety
    ///
    /// `new` carries the same validity obligation as
    /// [`Registry::register`].
    pub unsafe fn update(&self, id: SlotId, old: NonNull<T>, new: NonNull<T>) -> bool {
        self.table.lock(|table| {
            let mut table = table.borrow_mut();
            let index = id.index();
            let current = table.slots.get(index).copied().flatten();
            match current {
                Some(p) if same(p, old) => {
                    table.slots[index] = Some(new);
                    true
                }
                _ => false,
            }
        })
    }

    /// Resolve `id` and run `f` on the object, inside the critical
    /// section. Returns `None` if the slot is out of range or empty.
    ///
    /// The reference handed to `f` cannot escape the closure, so it is
    /// impossible to cache it across a suspension point.
    pub fn with<R>(&self, id: SlotId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.table.lock(|table| {
            let table = table.borrow();
            let slot = (*table.slots.get(id.index())?)?;
            // SAFETY: the slot was occupied under this critical section
            // and registered pointers are valid until deregistered;
            // deregistration takes the same critical section.
            Some(f(unsafe { slot.as_ref() }))
        })
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.table.lock(|table| {
            matches!(table.borrow().slots.get(id.index()), Some(Some(_)))
        })
    }
}

/// Id-only proxy, resolved against its registry at the point of use.
///
/// This is the only proxy flavor safe for objects that may relocate:
/// resolution always goes through the live slot table.
pub struct LightProxy<T: ?Sized> {
    id: SlotId,
    _marker: PhantomData<fn(&T)>,
}

impl<T: ?Sized> LightProxy<T> {
    pub const fn new(id: SlotId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Resolve against `registry` and run `f` on the target.
    pub fn with<R, const N: usize>(
        &self,
        registry: &Registry<T, N>,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        registry.with(self.id, f)
    }
}

impl<T: ?Sized> Clone for LightProxy<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for LightProxy<T> {}

impl<T: ?Sized> core::fmt::Debug for LightProxy<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("LightProxy").field(&self.id.get()).finish()
    }
}

/// Address-holding proxy with zero lookup cost.
///
/// Only valid for targets that never move. The safe constructor
/// requires `&'static`; anything else goes through the unsafe one.
pub struct DirectProxy<T: ?Sized> {
    target: NonNull<T>,
}

impl<T: ?Sized> DirectProxy<T> {
    pub fn new(target: &'static T) -> Self {
        Self {
            target: NonNull::from(target),
        }
    }

    /// # Safety
    ///
    /// `target` must outlive the proxy and never move while any copy
    /// of the proxy exists.
    pub unsafe fn new_unchecked(target: &T) -> Self {
        Self {
            target: NonNull::from(target),
        }
    }

    pub fn get(&self) -> &T {
        // SAFETY: upheld by the constructors - the target is 'static or
        // the caller promised equivalent lifetime and immovability.
        unsafe { self.target.as_ref() }
    }
}

impl<T: ?Sized> Clone for DirectProxy<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for DirectProxy<T> {}

// SAFETY: a DirectProxy is a shared reference in disguise; sharing it
// across contexts is exactly as safe as sharing &T.
unsafe impl<T: ?Sized + Sync> Send for DirectProxy<T> {}
unsafe impl<T: ?Sized + Sync> Sync for DirectProxy<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr_of(value: &u32) -> NonNull<u32> {
        NonNull::from(value)
    }

    #[test]
    fn register_resolve_deregister() {
        let registry: Registry<u32, 4> = Registry::new();
        let value = 42u32;
        let id = unsafe { registry.register(ptr_of(&value)) }.unwrap();

        assert_eq!(registry.with(id, |v| *v), Some(42));
        assert!(registry.contains(id));

        assert!(registry.deregister(id, ptr_of(&value)));
        assert_eq!(registry.with(id, |v| *v), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn double_registration_fails() {
        let registry: Registry<u32, 4> = Registry::new();
        let value = 7u32;
        let _id = unsafe { registry.register(ptr_of(&value)) }.unwrap();
        assert!(unsafe { registry.register(ptr_of(&value)) }.is_none());
    }

    #[test]
    fn full_table_rejects_and_reuses_freed_slot() {
        let registry: Registry<u32, 2> = Registry::new();
        let (a, b, c) = (1u32, 2u32, 3u32);
        let id_a = unsafe { registry.register(ptr_of(&a)) }.unwrap();
        let _id_b = unsafe { registry.register(ptr_of(&b)) }.unwrap();

        assert!(unsafe { registry.register(ptr_of(&c)) }.is_none());

        assert!(registry.deregister(id_a, ptr_of(&a)));
        let id_c = unsafe { registry.register(ptr_of(&c)) }.unwrap();
        assert_eq!(id_c, id_a);
    }

    #[test]
    fn stale_update_is_a_no_op() {
        let registry: Registry<u32, 2> = Registry::new();
        let (old, new, stranger) = (1u32, 2u32, 3u32);
        let id = unsafe { registry.register(ptr_of(&old)) }.unwrap();

        // An update naming the wrong current address must lose.
        assert!(!unsafe { registry.update(id, ptr_of(&stranger), ptr_of(&new)) });
        assert_eq!(registry.with(id, |v| *v), Some(1));

        assert!(unsafe { registry.update(id, ptr_of(&old), ptr_of(&new)) });
        assert_eq!(registry.with(id, |v| *v), Some(2));

        assert!(registry.deregister(id, ptr_of(&new)));
    }

    #[test]
    fn moved_object_resolves_at_new_address() {
        let registry: Registry<u32, 2> = Registry::new();
        let first = Box::new(10u32);
        let id = unsafe { registry.register(NonNull::from(first.as_ref())) }.unwrap();
        let proxy: LightProxy<u32> = LightProxy::new(id);

        // Relocate: new storage, rebind, drop the old one.
        let second = Box::new(*first + 1);
        assert!(unsafe {
            registry.update(
                id,
                NonNull::from(first.as_ref()),
                NonNull::from(second.as_ref()),
            )
        });
        drop(first);

        // Resolution from a simulated interrupt context sees the new
        // address, never the stale one.
        let seen = proxy.with(&registry, |v| *v);
        assert_eq!(seen, Some(11));

        assert!(registry.deregister(id, NonNull::from(second.as_ref())));
    }

    #[test]
    fn direct_proxy_reads_static_target() {
        static TARGET: u32 = 99;
        let proxy = DirectProxy::new(&TARGET);
        assert_eq!(*proxy.get(), 99);
        let copy = proxy;
        assert_eq!(*copy.get(), 99);
    }
}
