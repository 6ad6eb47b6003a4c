//! A concurrent, append-at-head singly linked list with multi-version
//! visibility, bound to exactly one [`Domain`].
//!
//! Grounded on `rs_lockfree::lockfree_stack::LockFreeStack` for the CAS-loop
//! head insert and `rs_lockfree::lockfree_queue::LockFreeQueue` for the
//! prev/curr hazard-walking dequeue shape, generalized per spec.md §4.3-4.5:
//! nodes carry `insert_txn`/`removed_txn` instead of being single-shot, and
//! every traversal re-validates its hazard before trusting the pointer it
//! protects, per spec.md §4.2.

use crate::domain::Domain;
use crate::error::Status;
use crate::node::Node;
use log::{trace, warn};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// A caller-supplied callback invoked exactly once per element whose node is
/// physically freed (spec.md §6's destructor callback contract). Must not
/// re-enter the list it was invoked from, nor call any domain function.
pub type Destructor = unsafe fn(*mut c_void);

/// One head pointer plus a monotonic commit counter, bound to exactly one
/// [`Domain`] (spec.md §3.2). Multiple lists may share a domain; they share
/// its reclamation guarantees but not their head pointers.
pub struct List<'dom> {
    head: AtomicPtr<Node>,
    commit: AtomicU64,
    domain: &'dom Domain,
    destructor: Option<Destructor>,
}

impl<'dom> List<'dom> {
    /// Initialize a list bound to `domain` (spec.md §6's `init`). The commit
    /// counter starts at 1, per spec.md §3.2.
    pub fn new(domain: &'dom Domain) -> Self {
        List {
            head: AtomicPtr::new(ptr::null_mut()),
            commit: AtomicU64::new(1),
            domain,
            destructor: None,
        }
    }

    /// Like [`List::new`], but remembers `destructor` so [`List::reclaim`]
    /// (with no arguments) and `Drop` can invoke it without the caller having
    /// to thread a destructor through every call site. This is ambient, not
    /// in spec.md (the literal `reclaim(list, destructor)`/`destroy(list,
    /// destructor)` calls are still available via
    /// [`List::reclaim_with`]/[`List::destroy`]).
    pub fn with_destructor(domain: &'dom Domain, destructor: Destructor) -> Self {
        List {
            head: AtomicPtr::new(ptr::null_mut()),
            commit: AtomicU64::new(1),
            domain,
            destructor: Some(destructor),
        }
    }

    fn thread_state_or_nothread(&self) -> Result<&crate::domain::ThreadState, Status> {
        self.domain.thread_state().ok_or_else(|| {
            warn!("list operation attempted by an unregistered thread");
            Status::NoThread
        })
    }

    /// True if `target` is still reachable by walking from `head`. This is
    /// the coarse O(n) re-validation spec.md §4.4 prescribes in place of
    /// per-step invariant proofs. §9 notes a Harris-style marked-pointer
    /// scheme is the standard upgrade for large lists; not implemented here.
    fn is_reachable(&self, target: *mut Node) -> bool {
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            if p == target {
                return true;
            }
            p = unsafe { (*p).next(Ordering::Acquire) };
        }
        false
    }

    /// Insert `elm` at the head of the list (spec.md §4.3).
    ///
    /// No hazard is needed: the node is unreachable until the publishing CAS
    /// succeeds, so no other thread can observe it beforehand.
    pub fn insert_head(&self, elm: *mut c_void) -> Status {
        if self.thread_state_or_nothread().is_err() {
            return Status::NoThread;
        }

        let node = match Node::alloc(elm, 0) {
            Some(node) => node,
            None => {
                warn!("insert_head failed: out of memory allocating node");
                return Status::NoMem;
            }
        };

        // Counter bumped only after allocation succeeds, so a failed insert
        // never opens a gap in the version sequence (spec.md §4.3).
        let txn = self.commit.fetch_add(1, Ordering::AcqRel);
        unsafe { (*node).set_insert_txn(txn) };

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*node).set_next(head, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    trace!("insert_head: published node at txn={txn}");
                    return Status::Success;
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Logically remove the first live node whose `user_elm == elm`
    /// (spec.md §4.4). Marks `removed_txn`; does not unlink. Calling this
    /// twice for the same element returns `NotFound` the second time (spec.md
    /// §8 property 3). A node already carrying a nonzero `removed_txn` is
    /// skipped rather than matched again, since the invariant is that the
    /// field transitions from 0 to nonzero exactly once.
    pub fn remove(&self, elm: *mut c_void) -> Status {
        let ts = match self.thread_state_or_nothread() {
            Ok(ts) => ts,
            Err(status) => return status,
        };

        let txn = self.commit.fetch_add(1, Ordering::AcqRel);

        'restart: loop {
            let mut curr = self.head.load(Ordering::Acquire);
            loop {
                if curr.is_null() {
                    return Status::NotFound;
                }

                ts.hazard_acquire(0, curr);
                if !self.is_reachable(curr) {
                    ts.hazard_release(0);
                    continue 'restart;
                }

                let node = unsafe { &*curr };
                if node.user_elm() == elm && node.removed_txn(Ordering::Acquire) == 0 {
                    node.set_removed_txn(txn, Ordering::Release);
                    ts.hazard_release(0);
                    trace!("remove: logically removed node at txn={txn}");
                    return Status::Success;
                }

                let next = node.next(Ordering::Acquire);
                ts.hazard_release(0);
                curr = next;
            }
        }
    }

    /// Physically unlink and free the first visible node (spec.md §4.5).
    /// Unlike [`List::remove`], this both samples a snapshot and frees
    /// memory in the same call.
    pub fn remove_first(&self) -> Result<*mut c_void, Status> {
        let ts = match self.thread_state_or_nothread() {
            Ok(ts) => ts,
            Err(status) => return Err(status),
        };

        let snap = self.commit.load(Ordering::Acquire);

        'restart: loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return Err(Status::NotFound);
            }

            ts.hazard_acquire(0, head);
            if self.head.load(Ordering::Acquire) != head {
                ts.hazard_release(0);
                continue 'restart;
            }

            let head_node = unsafe { &*head };
            if head_node.visible_at(snap, head_node.removed_txn(Ordering::Acquire)) {
                let next = head_node.next(Ordering::Acquire);
                match self
                    .head
                    .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                {
                    Ok(_) => {
                        let elm = head_node.user_elm();
                        ts.hazard_release(0);
                        unsafe { Node::free(head) };
                        trace!("remove_first: dequeued head node");
                        return Ok(elm);
                    }
                    Err(_) => {
                        ts.hazard_release(0);
                        continue 'restart;
                    }
                }
            }

            // Head itself isn't visible: walk forward seeking the first
            // visible node, keeping `prev` hazarded in slot 0 and `curr` in
            // slot 1 (spec.md §4.5's inner loop).
            let mut prev = head;
            let mut curr = head_node.next(Ordering::Acquire);
            loop {
                if curr.is_null() {
                    ts.hazard_release(0);
                    return Err(Status::NotFound);
                }

                ts.hazard_acquire(1, curr);
                let prev_node = unsafe { &*prev };
                if prev_node.next(Ordering::Acquire) != curr {
                    ts.hazard_release(0);
                    ts.hazard_release(1);
                    continue 'restart;
                }

                let curr_node = unsafe { &*curr };
                if curr_node.visible_at(snap, curr_node.removed_txn(Ordering::Acquire)) {
                    let next = curr_node.next(Ordering::Acquire);
                    match prev_node.compare_exchange_next(
                        curr,
                        next,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            let elm = curr_node.user_elm();
                            ts.hazard_release(0);
                            ts.hazard_release(1);
                            unsafe { Node::free(curr) };
                            trace!("remove_first: dequeued interior node");
                            return Ok(elm);
                        }
                        Err(_) => {
                            ts.hazard_release(0);
                            ts.hazard_release(1);
                            continue 'restart;
                        }
                    }
                }

                // Advance: curr becomes the new prev.
                ts.hazard_acquire(0, curr);
                prev = curr;
                curr = curr_node.next(Ordering::Acquire);
            }
        }
    }

    /// True if no element is visible at a fresh snapshot.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// True if `elm` is visible at a fresh snapshot.
    ///
    /// Resolves the Open Question in spec.md §9 ("queries without hazards")
    /// as a fix: every node visited is hazard-protected before its fields
    /// are read, via the same `prev`/`curr` rotation
    /// [`List::remove_first`] uses (SPEC_FULL.md §4.8). A thread not
    /// registered with this list's domain has no hazard cells to protect a
    /// traversal with, so it gets the "absent" answer instead of an unsafe
    /// walk (spec.md §5: unregistered threads see no-op queries behave as
    /// if the list were empty).
    pub fn contains(&self, elm: *mut c_void) -> bool {
        let Some(ts) = self.domain.thread_state() else {
            return false;
        };
        let mut found = false;
        self.walk_visible(ts, |e| {
            if e == elm {
                found = true;
                false
            } else {
                true
            }
        });
        found
    }

    /// Count of elements visible at a fresh snapshot. See [`List::contains`]
    /// for the hazard-protection and unregistered-thread rationale.
    pub fn count(&self) -> usize {
        let Some(ts) = self.domain.thread_state() else {
            return 0;
        };
        let mut n = 0usize;
        self.walk_visible(ts, |_| {
            n += 1;
            true
        });
        n
    }

    /// Walk every node visible at a snapshot taken now, invoking `f` with
    /// each visible `user_elm` until it returns `false` or the list is
    /// exhausted.
    ///
    /// Every node dereferenced is hazard-protected: `prev` in slot 0 (once
    /// advanced past the list head), `curr` in slot 1, re-validated against
    /// a fresh read of `prev.next` before either is trusted. This is the same
    /// rotation `remove_first` uses. A query's own `curr` has no
    /// `active_snapshot` gate backing it the way an iterator's last
    /// returned node does (queries don't register one), so skipping the
    /// hazard on any visited node would let a concurrent reclaim free it
    /// between this traversal reading its pointer and dereferencing it.
    fn walk_visible(&self, ts: &crate::domain::ThreadState, mut f: impl FnMut(*mut c_void) -> bool) {
        let snap = self.commit.load(Ordering::Acquire);

        'restart: loop {
            let mut prev: *mut Node = ptr::null_mut();
            let mut curr = self.head.load(Ordering::Acquire);

            loop {
                if curr.is_null() {
                    if !prev.is_null() {
                        ts.hazard_release(0);
                    }
                    return;
                }

                ts.hazard_acquire(1, curr);
                let still_linked = if prev.is_null() {
                    self.head.load(Ordering::Acquire) == curr
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
                let visible = node.visible_at(snap, removed);
                let elm = node.user_elm();
                let next = node.next(Ordering::Acquire);

                if visible && !f(elm) {
                    if !prev.is_null() {
                        ts.hazard_release(0);
                    }
                    ts.hazard_release(1);
                    return;
                }

                ts.hazard_acquire(0, curr);
                prev = curr;
                curr = next;
            }
        }
    }

    /// Run one reclamation pass using the destructor given at construction,
    /// if any (see [`List::with_destructor`]). If none was set, nodes past
    /// both reclamation gates are freed without invoking any callback.
    pub fn reclaim(&self) -> Status {
        crate::reclaim::run(self, self.destructor)
    }

    /// Run one reclamation pass with an explicit destructor, matching
    /// spec.md §6's literal `reclaim(list, destructor)` signature.
    pub fn reclaim_with(&self, destructor: Destructor) -> Status {
        crate::reclaim::run(self, Some(destructor))
    }

    /// Unconditionally free every remaining node, invoking the stored
    /// destructor (if any) on each `user_elm`, regardless of its visibility
    /// or removal state. Matches spec.md §6's `destroy(list, destructor)`.
    ///
    /// # Safety
    /// Undefined behavior if any thread still holds an iterator or hazard on
    /// this list, or concurrently calls any other list operation.
    pub unsafe fn destroy(&mut self) {
        let mut curr = *self.head.get_mut();
        *self.head.get_mut() = ptr::null_mut();
        while !curr.is_null() {
            let next = (*curr).next(Ordering::Relaxed);
            if let Some(destructor) = self.destructor {
                destructor((*curr).user_elm());
            }
            Node::free(curr);
            curr = next;
        }
    }

    pub(crate) fn domain(&self) -> &'dom Domain {
        self.domain
    }

    pub(crate) fn head_ptr(&self) -> &AtomicPtr<Node> {
        &self.head
    }

    pub(crate) fn commit_counter(&self) -> &AtomicU64 {
        &self.commit
    }
}

impl Drop for List<'_> {
    fn drop(&mut self) {
        unsafe { self.destroy() };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::domain::Domain;

    fn elm(v: i32) -> *mut c_void {
        Box::into_raw(Box::new(v)) as *mut c_void
    }

    unsafe fn drop_elm(p: *mut c_void) {
        drop(Box::from_raw(p as *mut i32));
    }

    unsafe fn read_elm(p: *mut c_void) -> i32 {
        *(p as *const i32)
    }

    #[test]
    fn insert_then_contains_and_count() {
        let domain = Domain::create(4).unwrap();
        domain.register();
        let list = List::new(&domain);
        let a = elm(1);
        assert_eq!(list.insert_head(a), Status::Success);
        assert!(list.contains(a));
        assert_eq!(list.count(), 1);
        assert!(!list.is_empty());
        unsafe { drop_elm(a) };
        unsafe { list.destroy() };
        domain.unregister();
    }

    #[test]
    fn remove_is_idempotent() {
        let domain = Domain::create(4).unwrap();
        domain.register();
        let list = List::new(&domain);
        let a = elm(1);
        list.insert_head(a);
        assert_eq!(list.remove(a), Status::Success);
        assert_eq!(list.remove(a), Status::NotFound);
        unsafe { drop_elm(a) };
        unsafe { list.destroy() };
        domain.unregister();
    }

    #[test]
    fn remove_unknown_element_is_not_found() {
        let domain = Domain::create(4).unwrap();
        domain.register();
        let list = List::new(&domain);
        let a = elm(1);
        list.insert_head(a);
        let unknown = elm(2);
        assert_eq!(list.remove(unknown), Status::NotFound);
        unsafe { drop_elm(unknown) };
        unsafe { list.destroy() };
        domain.unregister();
    }

    #[test]
    fn insert_head_without_registration_fails() {
        let domain = Domain::create(4).unwrap();
        let list = List::new(&domain);
        let a = elm(1);
        assert_eq!(list.insert_head(a), Status::NoThread);
        unsafe { drop_elm(a) };
    }

    #[test]
    fn lifo_order_s5() {
        let domain = Domain::create(4).unwrap();
        domain.register();
        let list = List::new(&domain);
        let (a, b, c) = (elm(1), elm(2), elm(3));
        list.insert_head(a);
        list.insert_head(b);
        list.insert_head(c);

        let mut seen = Vec::new();
        let mut iter = crate::iter::ListIter::begin(&list);
        while let Some(e) = iter.next() {
            seen.push(unsafe { read_elm(e) });
        }
        iter.end();
        assert_eq!(seen, vec![3, 2, 1]);

        unsafe {
            drop_elm(a);
            drop_elm(b);
            drop_elm(c);
        }
        unsafe { list.destroy() };
        domain.unregister();
    }

    #[test]
    fn remove_first_dequeues_front_to_back() {
        let domain = Domain::create(4).unwrap();
        domain.register();
        let list = List::new(&domain);
        let (a, b) = (elm(1), elm(2));
        list.insert_head(a); // txn 1
        list.insert_head(b); // txn 2, head is now b

        let first = list.remove_first().unwrap();
        assert_eq!(unsafe { read_elm(first) }, 2);
        unsafe { drop_elm(first) };

        let second = list.remove_first().unwrap();
        assert_eq!(unsafe { read_elm(second) }, 1);
        unsafe { drop_elm(second) };

        assert_eq!(list.remove_first(), Err(Status::NotFound));
        domain.unregister();
    }
}
