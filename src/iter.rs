//! Per-thread snapshot iterator over a [`List`](crate::list::List)'s
//! visible elements (spec.md §4.6).
//!
//! Grounded on spec.md §4.6 directly. `rs_lockfree` has no iterator of its
//! own to draw from, since its stack/queue only ever expose pop. The
//! node-walk-with-hazard pattern reuses `List`'s `is_reachable`-adjacent
//! hazard-then-reload idiom from `list.rs`.

use crate::domain::ThreadState;
use crate::error::Status;
use crate::list::List;
use crate::node::Node;
use log::trace;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::Ordering;

/// Single-threaded w.r.t. itself: only the thread that called
/// [`ListIter::begin`] may call [`ListIter::next`]/[`ListIter::end`] on the
/// resulting iterator. `active_snapshot` is a per-thread gate (spec.md
/// §4.6), so at most one iteration per thread can be in flight at a time.
/// A second `begin` on the same thread simply overwrites the gate with a new
/// snapshot.
pub struct ListIter<'a, 'dom> {
    list: &'a List<'dom>,
    snap: u64,
    current: *mut Node,
    ts: Option<&'a ThreadState>,
}

impl<'a, 'dom> ListIter<'a, 'dom> {
    /// Begin an iteration over `list`, capturing a snapshot of the commit
    /// counter now (spec.md §4.6's `begin`). Fails with `NoThread` if the
    /// calling thread is not registered with `list`'s domain.
    pub fn try_begin(list: &'a List<'dom>) -> Result<Self, Status> {
        let ts = list.domain().thread_state().ok_or(Status::NoThread)?;
        let snap = list.commit_counter().load(Ordering::Acquire);
        ts.set_active_snapshot(snap);
        trace!("iterator begin: captured snap={snap}");
        Ok(ListIter {
            list,
            snap,
            current: ptr::null_mut(),
            ts: Some(ts),
        })
    }

    /// Convenience wrapper around [`ListIter::try_begin`] for callers that
    /// have already ensured their thread is registered. Returns an inert
    /// iterator (snapshot 0, yields nothing) if it is not, rather than
    /// panicking. Registration is a precondition the caller owns, and a
    /// dead iterator is a safer failure mode than a panic deep inside a
    /// traversal.
    pub fn begin(list: &'a List<'dom>) -> Self {
        Self::try_begin(list).unwrap_or(ListIter {
            list,
            snap: 0,
            current: ptr::null_mut(),
            ts: None,
        })
    }

    /// Advance to, and return, the next visible element in head-to-tail
    /// (i.e. most-recently-inserted-first) order, or `None` once exhausted.
    ///
    /// Walks forward from `current` (or the list head on the first call),
    /// re-validating each candidate against the predecessor's freshly
    /// reloaded `next` before trusting it (spec.md §4.2's
    /// acquire-then-validate rule). `prev` (slot 0) and `curr` (slot 1)
    /// rotate exactly as in
    /// [`List::remove_first`](crate::list::List::remove_first): every node
    /// dereferenced beyond its `next` pointer is hazard-protected first,
    /// even `self.current` itself. It happens to also be protected
    /// against unlinking by this thread's own `active_snapshot` (a node
    /// this iterator already returned cannot satisfy reclaim's unlink-gate
    /// condition `removed_txn < min_active_snapshot <= self.snap`), but
    /// hazarding it too costs one redundant store and removes any need to
    /// lean on that argument here (spec.md §4.2's rule applies
    /// unconditionally).
    pub fn next(&mut self) -> Option<*mut c_void> {
        let ts = self.ts?;

        'restart: loop {
            let mut prev = self.current;
            if !prev.is_null() {
                ts.hazard_acquire(0, prev);
            }
            let mut curr = if prev.is_null() {
                self.list.head_ptr().load(Ordering::Acquire)
            } else {
                unsafe { (*prev).next(Ordering::Acquire) }
            };

            loop {
                if curr.is_null() {
                    if !prev.is_null() {
                        ts.hazard_release(0);
                    }
                    return None;
                }

                ts.hazard_acquire(1, curr);
                let still_linked = if prev.is_null() {
                    self.list.head_ptr().load(Ordering::Acquire) == curr
                } else {
                    unsafe { (*prev).next(Ordering::Acquire) == curr }
                };
                if !still_linked {
                    if !prev.is_null() {
                        ts.hazard_release(0);
                    }
                    ts.hazard_release(1);
                    continue 'restart;
                }

                let node = unsafe { &*curr };
                let removed = node.removed_txn(Ordering::Acquire);
                if node.visible_at(self.snap, removed) {
                    self.current = curr;
                    let elm = node.user_elm();
                    if !prev.is_null() {
                        ts.hazard_release(0);
                    }
                    ts.hazard_release(1);
                    return Some(elm);
                }

                // curr is not visible at our snapshot, so reclaim's unlink
                // gate may apply to it at any time once we let go of it;
                // promote it into slot 0 as the new `prev` before advancing
                // past it, so it stays hazard-protected for the
                // `(*prev).next` read on the next iteration.
                let next = node.next(Ordering::Acquire);
                ts.hazard_acquire(0, curr);
                prev = curr;
                curr = next;
            }
        }
    }

    /// End the iteration, clearing this thread's `active_snapshot` gate so
    /// reclaim may resume unlinking nodes below this snapshot (spec.md
    /// §4.6's `end`).
    pub fn end(mut self) {
        self.end_mut();
    }

    fn end_mut(&mut self) {
        if let Some(ts) = self.ts.take() {
            ts.clear_active_snapshot();
        }
        self.current = ptr::null_mut();
        self.snap = 0;
    }

    /// The snapshot captured at `begin` (spec.md §4.6's `snapshot`); `0` if
    /// `begin` failed to register a snapshot.
    pub fn snapshot(&self) -> u64 {
        self.snap
    }
}

impl Drop for ListIter<'_, '_> {
    fn drop(&mut self) {
        self.end_mut();
    }
}
