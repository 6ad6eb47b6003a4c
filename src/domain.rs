//! Process-scoped registry of per-thread reclamation state.
//!
//! Grounded on `rs_lockfree::hazard_epoch::HazardEpoch` (thread lookup,
//! `thread_lock`-guarded first registration, walking the thread list to find
//! a minimum version) and `rs_lockfree::hazard_pointer::ThreadStore` (the
//! per-thread hazard/retired bookkeeping). `HazardEpoch`'s thread table was a
//! fixed-size `[ThreadStore; MAX_THREAD_COUNT]` array; spec.md requires an
//! unbounded, runtime-growable table, so growth is modeled after
//! `Johnabell-atom_box::domain::Domain`'s append-only `LockFreeList` instead.
//! See the "retired tables" note on [`Domain::grow`] below for how the two
//! ideas are reconciled.

use crate::error::Status;
use crate::node::Node;
use crate::spin_lock::SpinLock;
use crate::util;
use cfg_if::cfg_if;
use log::{debug, trace, warn};
use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        /// Initial slot-table capacity hint. The table still grows past this
        /// if more threads register (spec.md §4.1); this only sizes the
        /// first allocation and the default growth increment.
        pub const DEFAULT_CAPACITY: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const DEFAULT_CAPACITY: usize = 256;
    } else {
        pub const DEFAULT_CAPACITY: usize = 16;
    }
}

/// Per-thread reclamation state: two hazard cells, an active-snapshot gate,
/// and a thread-local retired stack (spec.md §3's "Thread State").
pub struct ThreadState {
    hazard: [AtomicPtr<Node>; 2],
    active_snapshot: AtomicU64,
    retired: AtomicPtr<Node>,
    in_use: AtomicBool,
}

impl ThreadState {
    fn new() -> Self {
        ThreadState {
            hazard: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
            active_snapshot: AtomicU64::new(0),
            retired: AtomicPtr::new(ptr::null_mut()),
            in_use: AtomicBool::new(true),
        }
    }

    /// Publish `node` into hazard cell `slot` (0 or 1). Release-ordered: must
    /// happen-before any subsequent re-validation read.
    #[inline]
    pub fn hazard_acquire(&self, slot: usize, node: *mut Node) {
        self.hazard[slot].store(node, Ordering::Release);
    }

    #[inline]
    pub fn hazard_load(&self, slot: usize) -> *mut Node {
        self.hazard[slot].load(Ordering::Acquire)
    }

    /// Clear hazard cell `slot`.
    #[inline]
    pub fn hazard_release(&self, slot: usize) {
        self.hazard[slot].store(ptr::null_mut(), Ordering::Release);
    }

    /// Publish `snap` as this thread's active snapshot (iterator `begin`).
    #[inline]
    pub fn set_active_snapshot(&self, snap: u64) {
        self.active_snapshot.store(snap, Ordering::Release);
    }

    /// Clear this thread's active snapshot gate (iterator `end`).
    #[inline]
    pub fn clear_active_snapshot(&self) {
        self.active_snapshot.store(0, Ordering::Release);
    }

    #[inline]
    pub fn active_snapshot(&self) -> u64 {
        self.active_snapshot.load(Ordering::Acquire)
    }

    /// Push `node` onto this thread's retired stack. Safe only once `node`
    /// has actually been unlinked from its list. `node`'s `next` field is
    /// overloaded as the retired-stack link (spec.md §9).
    ///
    /// # Safety
    /// `node` must already be unreachable from any list's head chain.
    pub unsafe fn push_retired(&self, node: *mut Node) {
        let mut head = self.retired.load(Ordering::Relaxed);
        loop {
            (*node).set_next(head, Ordering::Relaxed);
            match self.retired.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Atomically take the entire retired stack, leaving it empty.
    pub fn take_retired(&self) -> *mut Node {
        self.retired.swap(ptr::null_mut(), Ordering::Acquire)
    }

    /// Push a whole chain (as built by `take_retired` + filtering) back onto
    /// the retired stack, prepending whatever was pushed concurrently.
    ///
    /// # Safety
    /// `tail` must be the last node of `head`'s chain (its `next` is
    /// overwritten).
    pub unsafe fn put_back_retired(&self, head: *mut Node, tail: *mut Node) {
        if head.is_null() {
            return;
        }
        let mut cur = self.retired.load(Ordering::Relaxed);
        loop {
            (*tail).set_next(cur, Ordering::Relaxed);
            match self.retired.compare_exchange_weak(
                cur,
                head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        // Domain::destroy drains retired lists before dropping thread
        // states; this only guards against a caller skipping that step.
        let mut cur = *self.retired.get_mut();
        while !cur.is_null() {
            unsafe {
                let next = (*cur).next(Ordering::Relaxed);
                Node::free(cur);
                cur = next;
            }
        }
    }
}

struct SlotTable {
    slots: Box<[AtomicPtr<ThreadState>]>,
}

impl SlotTable {
    fn with_capacity(cap: usize) -> Option<*mut SlotTable> {
        let mut v = Vec::with_capacity(cap);
        for _ in 0..cap {
            v.push(AtomicPtr::new(ptr::null_mut()));
        }
        util::try_alloc(SlotTable {
            slots: v.into_boxed_slice(),
        })
    }
}

/// A previous generation of the slot table, retained rather than freed so a
/// reader that loaded the old table pointer before a `grow` can keep reading
/// it safely (see [`Domain::grow`]). Freed only at [`Domain::destroy`].
struct RetiredTable {
    table: *mut SlotTable,
    next: *mut RetiredTable,
}

/// Process-scoped registry of per-thread hazard-pointer/retired-list state.
///
/// A `Domain` may be shared by any number of [`List`](crate::list::List)s; it
/// owns none of them. Must not be moved once any thread has registered with
/// it (thread-local bindings key on its address), mirroring
/// `rs_lockfree::hazard_epoch::HazardEpoch`'s equivalent constraint.
pub struct Domain {
    table: AtomicPtr<SlotTable>,
    capacity: AtomicUsize,
    count: AtomicUsize,
    resize_latch: SpinLock,
    retired_tables: AtomicPtr<RetiredTable>,
}

thread_local! {
    static BINDINGS: RefCell<Vec<(usize, *mut ThreadState)>> = RefCell::new(Vec::new());
}

impl Domain {
    /// Create a domain with at least `initial_capacity` slots (clamped up to
    /// the compile-time [`DEFAULT_CAPACITY`] hint). Returns `Err(NoMem)` if
    /// the initial slot table cannot be allocated (spec.md §6:
    /// `create(initial_capacity) -> domain | NOMEM`).
    pub fn create(initial_capacity: usize) -> Result<Domain, Status> {
        let cap = initial_capacity.max(DEFAULT_CAPACITY).next_power_of_two();
        debug!("creating domain with initial capacity {cap}");
        let table = match SlotTable::with_capacity(cap) {
            Some(table) => table,
            None => {
                warn!("domain creation failed: out of memory allocating slot table");
                return Err(Status::NoMem);
            }
        };
        Ok(Domain {
            table: AtomicPtr::new(table),
            capacity: AtomicUsize::new(cap),
            count: AtomicUsize::new(0),
            resize_latch: SpinLock::default(),
            retired_tables: AtomicPtr::new(ptr::null_mut()),
        })
    }

    fn domain_key(&self) -> usize {
        self as *const Domain as usize
    }

    fn current_binding(&self) -> Option<*mut ThreadState> {
        let key = self.domain_key();
        BINDINGS.with(|b| {
            b.borrow()
                .iter()
                .find(|(d, _)| *d == key)
                .map(|(_, ts)| *ts)
        })
    }

    /// The calling thread's [`ThreadState`] if it is registered with this
    /// domain, else `None` (the `NOTHREAD` fail-fast case, spec.md §5).
    pub(crate) fn thread_state(&self) -> Option<&ThreadState> {
        self.current_binding().map(|ts| unsafe { &*ts })
    }

    /// Bind the calling thread to this domain (spec.md §4.1).
    ///
    /// Idempotent: calling this again from a thread already bound to `self`
    /// succeeds without changing anything.
    pub fn register(&self) -> Status {
        if self.current_binding().is_some() {
            return Status::Success;
        }

        if let Some(ts) = self.try_claim_free_slot() {
            self.bind_current_thread(ts);
            return Status::Success;
        }

        let idx = self.count.fetch_add(1, Ordering::AcqRel);
        if idx >= self.capacity.load(Ordering::Acquire) {
            if let Err(status) = self.grow(idx + 1) {
                return status;
            }
        }

        let ts = match util::try_alloc(ThreadState::new()) {
            Some(ts) => ts,
            None => {
                warn!("register failed: out of memory allocating thread state");
                return Status::NoMem;
            }
        };
        let table = self.table.load(Ordering::Acquire);
        let slots = unsafe { &(*table).slots };
        // idx is guaranteed < slots.len() after grow(), by construction.
        slots[idx].store(ts, Ordering::Release);
        trace!("registered new thread state at slot {idx}");
        self.bind_current_thread(ts);
        Status::Success
    }

    fn try_claim_free_slot(&self) -> Option<*mut ThreadState> {
        let table = self.table.load(Ordering::Acquire);
        let slots = unsafe { &(*table).slots };
        for slot in slots.iter() {
            let ts_ptr = slot.load(Ordering::Acquire);
            if ts_ptr.is_null() {
                continue;
            }
            let ts = unsafe { &*ts_ptr };
            if ts
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(ts_ptr);
            }
        }
        None
    }

    fn bind_current_thread(&self, ts: *mut ThreadState) {
        let key = self.domain_key();
        BINDINGS.with(|b| b.borrow_mut().push((key, ts)));
    }

    /// Unbind the calling thread from this domain. Idempotent for threads
    /// that were never registered.
    pub fn unregister(&self) {
        let key = self.domain_key();
        let ts = BINDINGS.with(|b| {
            let mut b = b.borrow_mut();
            if let Some(pos) = b.iter().position(|(d, _)| *d == key) {
                Some(b.remove(pos).1)
            } else {
                None
            }
        });
        if let Some(ts) = ts {
            let ts = unsafe { &*ts };
            ts.hazard_release(0);
            ts.hazard_release(1);
            ts.clear_active_snapshot();
            // The retired list is intentionally left attached to the slot:
            // a future thread claiming this slot inherits it (spec.md §9,
            // "slot reuse"). Draining eagerly here would be wasted work if
            // nothing reclaims it for a while; the next `reclaim` call sweeps
            // it regardless of which thread originally retired the nodes.
            ts.in_use.store(false, Ordering::Release);
        }
    }

    /// Grow the slot table to hold at least `needed` slots.
    ///
    /// spec.md §4.1 describes allocating a new array, copying forward the
    /// existing slot pointers, publishing it, and freeing the old array.
    /// Freeing the old array immediately would race a reader that loaded the
    /// old table pointer (not just its capacity) just before the swap and is
    /// still indexing into it, and nothing in spec.md protects the table
    /// array itself the way hazard pointers protect nodes. This implementation
    /// instead retains every old generation on `retired_tables`, freed only
    /// in [`Domain::destroy`], which preserves spec.md's invariant that
    /// "a reader that loaded `capacity` may continue to use the table
    /// pointer it has already observed" without ever reading freed memory.
    fn grow(&self, needed: usize) -> Result<(), Status> {
        let _guard = self.resize_latch.lock_guard();

        let cur_cap = self.capacity.load(Ordering::Acquire);
        if needed <= cur_cap {
            return Ok(());
        }
        let new_cap = needed.max(cur_cap * 2).next_power_of_two();
        debug!("growing domain slot table from {cur_cap} to {new_cap}");

        let old_table_ptr = self.table.load(Ordering::Acquire);
        let old_slots = unsafe { &(*old_table_ptr).slots };
        let mut new_slots = Vec::with_capacity(new_cap);
        for i in 0..new_cap {
            let carried = old_slots
                .get(i)
                .map(|s| s.load(Ordering::Relaxed))
                .unwrap_or(ptr::null_mut());
            new_slots.push(AtomicPtr::new(carried));
        }
        let new_table = match util::try_alloc(SlotTable {
            slots: new_slots.into_boxed_slice(),
        }) {
            Some(table) => table,
            None => {
                warn!("grow failed: out of memory allocating new slot table");
                return Err(Status::NoMem);
            }
        };

        self.table.store(new_table, Ordering::Release);
        self.capacity.store(new_cap, Ordering::Release);

        self.retire_table(old_table_ptr);
        Ok(())
    }

    /// Retain `table` on the retired-generations chain. Allocation failure
    /// here only means the old generation leaks until `destroy` rather than
    /// being tracked for it (the new table has already been published, so
    /// growth itself must not fail because of this); the leak is logged
    /// rather than silently swallowed.
    fn retire_table(&self, table: *mut SlotTable) {
        let node = match util::try_alloc(RetiredTable {
            table,
            next: ptr::null_mut(),
        }) {
            Some(node) => node,
            None => {
                warn!("failed to track retired slot table generation, it will leak");
                return;
            }
        };
        let mut head = self.retired_tables.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self.retired_tables.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Scan all registered thread slots for a hazard cell equal to `p`.
    ///
    /// Racy by design (spec.md §4.2): a `false` result means no thread could
    /// subsequently validly acquire `p` (it is already unreachable from every
    /// list head); a `true` result means the reclaimer must defer freeing it.
    pub(crate) fn any_hazard_equals(&self, p: *mut Node) -> bool {
        let mut found = false;
        self.for_each_thread_state(|ts| {
            found = found || ts.hazard_load(0) == p || ts.hazard_load(1) == p;
        });
        found
    }

    /// Minimum active snapshot across all registered threads, or `u64::MAX`
    /// if none is currently active (spec.md §4.7, phase 1).
    pub(crate) fn min_active_snapshot(&self) -> u64 {
        let mut min = u64::MAX;
        self.for_each_thread_state(|ts| {
            let snap = ts.active_snapshot();
            if snap != 0 && snap < min {
                min = snap;
            }
        });
        min
    }

    /// Every currently registered thread's state, for reclaim to iterate.
    pub(crate) fn for_each_thread_state(&self, mut f: impl FnMut(&ThreadState)) {
        let table = self.table.load(Ordering::Acquire);
        let slots = unsafe { &(*table).slots };
        let count = self.count.load(Ordering::Acquire).min(slots.len());
        for slot in &slots[..count] {
            let ts_ptr = slot.load(Ordering::Acquire);
            if !ts_ptr.is_null() {
                f(unsafe { &*ts_ptr });
            }
        }
    }

    /// Free every thread state and the slot table itself.
    ///
    /// # Safety
    /// Undefined behavior if any thread is still registered with this domain
    /// or any `List` still references it (spec.md §4.1's caller obligation).
    pub unsafe fn destroy(&mut self) {
        let table = *self.table.get_mut();
        let slots = &(*table).slots;
        for slot in slots.iter() {
            let ts_ptr = slot.load(Ordering::Acquire);
            if !ts_ptr.is_null() {
                util::free(ts_ptr);
            }
        }
        util::free(table);

        let mut retired = *self.retired_tables.get_mut();
        while !retired.is_null() {
            let next = (*retired).next;
            util::free((*retired).table);
            util::free(retired);
            retired = next;
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        unsafe { self.destroy() };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let domain = Domain::create(4).unwrap();
        assert_eq!(domain.register(), Status::Success);
        assert_eq!(domain.register(), Status::Success);
        assert!(domain.thread_state().is_some());
        domain.unregister();
        assert!(domain.thread_state().is_none());
    }

    #[test]
    fn unregister_without_register_is_noop() {
        let domain = Domain::create(4).unwrap();
        domain.unregister();
        assert!(domain.thread_state().is_none());
    }

    #[test]
    fn grow_past_initial_capacity() {
        let domain = Domain::create(1).unwrap();
        for _ in 0..40 {
            std::thread::scope(|s| {
                s.spawn(|| {
                    assert_eq!(domain.register(), Status::Success);
                    assert!(domain.thread_state().is_some());
                });
            });
        }
        assert!(domain.capacity.load(Ordering::Acquire) >= 2);
    }

    #[test]
    fn slot_reuse_after_unregister() {
        let domain = Domain::create(4).unwrap();
        domain.register();
        let first_ts = domain.current_binding().unwrap();
        domain.unregister();
        domain.register();
        let second_ts = domain.current_binding().unwrap();
        assert_eq!(first_ts, second_ts, "same thread's slot should be reclaimed first");
        domain.unregister();
    }
}
