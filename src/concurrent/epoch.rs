// Epoch-based memory reclamation.
//
// Readers of a lock-free structure enter an epoch before touching shared
// nodes and leave when done. A writer that unlinks a node retires it
// with the current global epoch; the node is freed only once every
// active reader entered at a strictly later epoch. Unlike the classic
// thread-local schemes, this manager is instance-scoped: each tree owns
// one, and nothing is process-global.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// A retired allocation awaiting reclamation. Type-erased so one bag can
/// hold nodes of any shape.
struct Garbage {
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
}

impl Garbage {
    fn new<T: Send>(ptr: *mut T) -> Self {
        unsafe fn deleter<T>(ptr: *mut u8) {
            drop(Box::from_raw(ptr as *mut T));
        }
        Self {
            ptr: ptr as *mut u8,
            deleter: deleter::<T>,
        }
    }

    /// Frees the allocation. Caller must guarantee no reader can still
    /// observe the pointer.
    unsafe fn reclaim(self) {
        (self.deleter)(self.ptr);
    }
}

// The pointers inside are only touched by whichever thread reclaims.
unsafe impl Send for Garbage {}

/// Reader slot: the entry epoch, or 0 while inactive.
type Slot = Arc<AtomicU64>;

/// Tracks reader epochs and retired nodes for one data structure.
pub struct EpochManager {
    /// Monotonic epoch counter. Starts at 1 so 0 can mean "inactive".
    global: AtomicU64,
    /// Reader slots. Claimed lock-free with CAS; the vector only grows,
    /// and only under the write lock, when every slot is taken.
    slots: RwLock<Vec<Slot>>,
    /// Retired nodes tagged with their retirement epoch.
    retired: Mutex<Vec<(u64, Garbage)>>,
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochManager {
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(1),
            slots: RwLock::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Current global epoch.
    pub fn current_epoch(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    /// Registers the caller as an active reader at the current epoch.
    /// The guard must be dropped by the same logical session.
    pub fn enter(&self) -> EpochGuard {
        let epoch = self.global.load(Ordering::Acquire);
        {
            let slots = self.slots.read();
            for slot in slots.iter() {
                if slot
                    .compare_exchange(0, epoch, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    fence(Ordering::SeqCst);
                    return EpochGuard { slot: slot.clone() };
                }
            }
        }
        // Every slot busy: grow the registry.
        let slot: Slot = Arc::new(AtomicU64::new(epoch));
        self.slots.write().push(slot.clone());
        fence(Ordering::SeqCst);
        EpochGuard { slot }
    }

    /// Bumps the global epoch, returning the new value.
    pub fn advance(&self) -> u64 {
        self.global.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Records `ptr` for deferred destruction at the current epoch.
    pub fn retire<T: Send>(&self, ptr: *mut T) {
        let epoch = self.global.load(Ordering::Acquire);
        self.retired.lock().push((epoch, Garbage::new(ptr)));
    }

    /// Retires a whole batch, e.g. every node replaced along one
    /// path-copied write.
    pub fn retire_nodes<T: Send>(&self, ptrs: impl IntoIterator<Item = *mut T>) {
        let epoch = self.global.load(Ordering::Acquire);
        let mut retired = self.retired.lock();
        for ptr in ptrs {
            retired.push((epoch, Garbage::new(ptr)));
        }
    }

    /// Frees every retired node from before the minimum active reader
    /// epoch. Returns how many were reclaimed.
    pub fn try_reclaim(&self) -> usize {
        let min_safe = {
            let slots = self.slots.read();
            slots
                .iter()
                .map(|slot| slot.load(Ordering::Acquire))
                .filter(|&epoch| epoch != 0)
                .min()
                .unwrap_or_else(|| self.global.load(Ordering::Acquire))
        };

        let mut retired = self.retired.lock();
        let mut keep = Vec::with_capacity(retired.len());
        let mut freed = 0;
        for (epoch, garbage) in retired.drain(..) {
            if epoch < min_safe {
                // Safety: every active reader entered after this node
                // was retired, so none can hold a pointer into it.
                unsafe { garbage.reclaim() };
                freed += 1;
            } else {
                keep.push((epoch, garbage));
            }
        }
        *retired = keep;
        if freed > 0 {
            log::trace!("epoch reclaim: freed {freed}, min safe epoch {min_safe}");
        }
        freed
    }

    /// Retired nodes still waiting for a safe epoch.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Active reader count (slots currently claimed).
    pub fn active_readers(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != 0)
            .count()
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // No readers can exist once the manager is being dropped.
        let mut retired = self.retired.lock();
        for (_, garbage) in retired.drain(..) {
            unsafe { garbage.reclaim() };
        }
    }
}

/// Active-reader registration. Leaving the epoch happens on drop.
pub struct EpochGuard {
    slot: Slot,
}

impl EpochGuard {
    /// Epoch this reader entered at.
    pub fn epoch(&self) -> u64 {
        self.slot.load(Ordering::Acquire)
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.slot.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Counted;
    impl Drop for Counted {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_enter_leave_reuses_slots() {
        let mgr = EpochManager::new();
        {
            let _a = mgr.enter();
            let _b = mgr.enter();
            assert_eq!(mgr.active_readers(), 2);
        }
        assert_eq!(mgr.active_readers(), 0);

        let _c = mgr.enter();
        // Slot got reused instead of growing the registry.
        assert_eq!(mgr.slots.read().len(), 2);
    }

    #[test]
    fn test_reclaim_waits_for_reader() {
        let mgr = EpochManager::new();
        let reader = mgr.enter();

        let node = Box::into_raw(Box::new(Counted));
        mgr.retire(node);
        mgr.advance();

        // Reader entered at or before the retire epoch: nothing frees.
        assert_eq!(mgr.try_reclaim(), 0);
        assert_eq!(mgr.retired_count(), 1);

        drop(reader);
        assert_eq!(mgr.try_reclaim(), 1);
        assert_eq!(mgr.retired_count(), 0);
    }

    #[test]
    fn test_late_reader_does_not_block_old_garbage() {
        let mgr = EpochManager::new();
        let node = Box::into_raw(Box::new(Counted));
        mgr.retire(node);
        mgr.advance();

        // This reader entered after the epoch advanced past the retire
        // epoch, so the node is already invisible to it.
        let _late = mgr.enter();
        assert_eq!(mgr.try_reclaim(), 1);
    }

    #[test]
    fn test_drop_frees_outstanding_garbage() {
        let before = DROPS.load(Ordering::SeqCst);
        {
            let mgr = EpochManager::new();
            mgr.retire(Box::into_raw(Box::new(Counted)));
            mgr.retire(Box::into_raw(Box::new(Counted)));
        }
        assert!(DROPS.load(Ordering::SeqCst) >= before + 2);
    }

    #[test]
    fn test_epoch_advances() {
        let mgr = EpochManager::new();
        let start = mgr.current_epoch();
        assert_eq!(mgr.advance(), start + 1);
        assert_eq!(mgr.current_epoch(), start + 1);
    }
}
