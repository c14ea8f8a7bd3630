//! Driver-mapped counters region and non-owning references into it.
//!
//! The region stands in for the memory the driver maps and shares with its
//! clients. The mapping layer (whoever holds the `Arc<CountersRegion>`) decides
//! how long it stays valid. Handles only ever hold a [`SharedRef`]: a `Weak`
//! pointer plus a slot index. They never free or remap anything.
//!
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────────┐
//! │ slot 0       │ slot 1       │ ... │ slot n-1     │
//! │ state, value │ state, value │     │ state, value │
//! └──────────────┴──────────────┴─────┴──────────────┘
//!   each slot on its own cache line
//! ```

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use crate::types::DriverAssignedId;

const SLOT_FREE: i32 = 0;
const SLOT_ALLOCATED: i32 = 1;

#[repr(C)]
#[repr(align(64))]
struct CounterSlot {
    state: AtomicI32,
    type_id: AtomicI32,
    value: AtomicI64,
}

/// Fixed-size array of 64-bit counters allocated by the driver.
pub struct CountersRegion {
    slots: Box<[CounterSlot]>,
}

impl CountersRegion {
    /// Maps a fresh region with `max_counters` free slots.
    #[must_use]
    pub fn new(max_counters: usize) -> Arc<Self> {
        let slots = (0..max_counters)
            .map(|_| CounterSlot {
                state: AtomicI32::new(SLOT_FREE),
                type_id: AtomicI32::new(0),
                value: AtomicI64::new(0),
            })
            .collect();
        Arc::new(Self { slots })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims the lowest free slot and zeroes its value. Driver side only.
    pub fn allocate(&self, type_id: i32) -> Option<DriverAssignedId> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(SLOT_FREE, SLOT_ALLOCATED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.value.store(0, Ordering::Relaxed);
                slot.type_id.store(type_id, Ordering::Release);
                let id = i32::try_from(index).ok()?;
                return Some(DriverAssignedId::new(id));
            }
        }
        None
    }

    /// Returns a slot to the free list. Driver side only.
    ///
    /// Returns `false` if the slot was not allocated.
    pub fn free(&self, id: DriverAssignedId) -> bool {
        self.slot(id).is_some_and(|slot| {
            slot.state
                .compare_exchange(SLOT_ALLOCATED, SLOT_FREE, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    #[must_use]
    pub fn is_allocated(&self, id: DriverAssignedId) -> bool {
        self.slot(id)
            .is_some_and(|slot| slot.state.load(Ordering::Acquire) == SLOT_ALLOCATED)
    }

    /// Type id recorded for an allocated slot.
    #[must_use]
    pub fn type_id(&self, id: DriverAssignedId) -> Option<i32> {
        self.slot(id)
            .filter(|slot| slot.state.load(Ordering::Acquire) == SLOT_ALLOCATED)
            .map(|slot| slot.type_id.load(Ordering::Acquire))
    }

    /// Number of allocated slots.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == SLOT_ALLOCATED)
            .count()
    }

    fn slot(&self, id: DriverAssignedId) -> Option<&CounterSlot> {
        usize::try_from(id.get())
            .ok()
            .and_then(|index| self.slots.get(index))
    }
}

/// Non-owning reference to one slot of a [`CountersRegion`].
///
/// Every access returns `None` once the mapping has been released.
#[derive(Clone)]
pub struct SharedRef {
    region: Weak<CountersRegion>,
    id: DriverAssignedId,
}

impl SharedRef {
    #[must_use]
    pub fn new(region: &Arc<CountersRegion>, id: DriverAssignedId) -> Self {
        Self {
            region: Arc::downgrade(region),
            id,
        }
    }

    /// Reference that never resolves.
    #[must_use]
    pub fn unmapped() -> Self {
        Self {
            region: Weak::new(),
            id: DriverAssignedId::NULL,
        }
    }

    #[must_use]
    pub const fn id(&self) -> DriverAssignedId {
        self.id
    }

    /// Whether the underlying mapping is still live and the slot exists.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.with_slot(|_| ()).is_some()
    }

    #[must_use]
    pub fn load(&self) -> Option<i64> {
        self.with_slot(|slot| slot.value.load(Ordering::Acquire))
    }

    /// Stores `value`; returns `false` if the mapping is gone.
    pub fn store(&self, value: i64) -> bool {
        self.with_slot(|slot| slot.value.store(value, Ordering::Release))
            .is_some()
    }

    /// Adds `delta` and returns the previous value.
    pub fn fetch_add(&self, delta: i64) -> Option<i64> {
        self.with_slot(|slot| slot.value.fetch_add(delta, Ordering::AcqRel))
    }

    fn with_slot<R>(&self, f: impl FnOnce(&CounterSlot) -> R) -> Option<R> {
        let region = self.region.upgrade()?;
        region.slot(self.id).map(f)
    }
}

impl std::fmt::Debug for SharedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRef")
            .field("id", &self.id)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
