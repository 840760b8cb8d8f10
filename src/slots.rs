//! Fixed pool of Tx control-block slots.
//!
//! The firmware refers to in-flight packets by a small numeric id, so the pool is an
//! arena of at most [MAX_SLOTS] slots addressed by [SlotId]. Slot 0 is a sentinel that is
//! never handed out; its chain link doubles as the free-list head. Packet-originating
//! code may allocate and free from outside the driver worker, which makes the free chain
//! the one structure in the crate behind a real lock.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};

/// Upper bound on the pool size, fixed at build time.
pub const MAX_SLOTS: usize = 32;

const LINK_NONE: u8 = u8::MAX;

/// Identifier of one control-block slot.
///
/// Only the pool mints these, so holding one proves the slot was allocated at some point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u8);
impl SlotId {
    pub(crate) const fn from_raw(id: u8) -> Self {
        Self(id)
    }
    pub const fn raw(self) -> u8 {
        self.0
    }
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

struct PoolInner {
    /// Index links: entry 0 is the free-list head, free slots link onwards,
    /// allocated slots and the chain tail hold [LINK_NONE].
    next: [u8; MAX_SLOTS],
    /// Bit per slot, set while the slot is free.
    free_mask: u32,
    count: u8,
}

/// The slot pool.
///
/// `const fn new` so the pool can live in a `static` and be shared with whatever context
/// originates packets; all methods take `&self`.
pub struct SlotPool {
    inner: Mutex<CriticalSectionRawMutex, RefCell<PoolInner>>,
}
impl SlotPool {
    /// Create a pool with `count` slots including the sentinel.
    ///
    /// `count` is clamped to `2..=MAX_SLOTS`.
    pub const fn new(count: u8) -> Self {
        let count = if count as usize > MAX_SLOTS {
            MAX_SLOTS as u8
        } else if count < 2 {
            2
        } else {
            count
        };
        let mut next = [LINK_NONE; MAX_SLOTS];
        let mut free_mask = 0u32;
        let mut slot = 0;
        while slot + 1 < count {
            next[slot as usize] = slot + 1;
            slot += 1;
        }
        let mut slot = 1;
        while slot < count {
            free_mask |= 1 << slot;
            slot += 1;
        }
        Self {
            inner: Mutex::new(RefCell::new(PoolInner {
                next,
                free_mask,
                count,
            })),
        }
    }
    /// Pop the head of the free chain.
    ///
    /// Returns `None` once the pool is exhausted; that is backpressure, not an error.
    pub fn allocate(&self) -> Option<SlotId> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let head = inner.next[0];
            if head == LINK_NONE {
                trace!("Slot pool exhausted.");
                return None;
            }
            inner.next[0] = inner.next[head as usize];
            inner.next[head as usize] = LINK_NONE;
            inner.free_mask &= !(1 << head);
            trace!("Allocated slot {}.", head);
            Some(SlotId(head))
        })
    }
    /// Push a slot back right after the sentinel, so it is reused first.
    ///
    /// Freeing the sentinel or a slot that is already free is reported and ignored; the
    /// `false` return distinguishes it from a normal free.
    pub fn free(&self, slot: SlotId) -> bool {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let id = slot.0;
            if id == 0 || id >= inner.count {
                error!("Refusing to free invalid slot {}.", id);
                return false;
            }
            if inner.free_mask & (1 << id) != 0 {
                warn!("Double free of slot {}.", id);
                return false;
            }
            inner.next[id as usize] = inner.next[0];
            inner.next[0] = id;
            inner.free_mask |= 1 << id;
            trace!("Slot {} is now free again.", id);
            true
        })
    }
    /// Validate a raw slot id reported by the firmware.
    ///
    /// Ids past the pool bound are a logic error and logged as such; ids of slots that
    /// are not currently allocated yield `None` so the caller can skip stale reports.
    pub fn lookup(&self, id: u8) -> Option<SlotId> {
        self.inner.lock(|inner| {
            let inner = inner.borrow();
            if id == 0 || id >= inner.count {
                error!("Slot id {} is out of bounds.", id);
                return None;
            }
            if inner.free_mask & (1 << id) != 0 {
                warn!("Slot id {} is not allocated.", id);
                return None;
            }
            Some(SlotId(id))
        })
    }
    /// Number of slots currently free.
    pub fn free_count(&self) -> usize {
        self.inner
            .lock(|inner| inner.borrow().free_mask.count_ones() as usize)
    }
    /// Whether `slot` is currently handed out.
    pub fn in_use(&self, slot: SlotId) -> bool {
        self.inner.lock(|inner| {
            let inner = inner.borrow();
            slot.0 != 0 && slot.0 < inner.count && inner.free_mask & (1 << slot.0) == 0
        })
    }
    /// Usable capacity, the sentinel excluded.
    pub fn capacity(&self) -> usize {
        self.inner.lock(|inner| inner.borrow().count as usize - 1)
    }
    /// Relink every slot into the free chain.
    ///
    /// Part of driver restart; the caller must have dropped all outstanding [SlotId]s.
    pub fn reset(&self) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let count = inner.count;
            let mut slot = 0;
            while slot + 1 < count {
                inner.next[slot as usize] = slot + 1;
                slot += 1;
            }
            inner.next[count as usize - 1] = LINK_NONE;
            inner.free_mask = 0;
            let mut slot = 1;
            while slot < count {
                inner.free_mask |= 1 << slot;
                slot += 1;
            }
            debug!("Slot pool reset, {} slots free.", count - 1);
        });
    }
}
