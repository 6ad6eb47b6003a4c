//! Two-phase reclamation: unlink past the version gate, free past the
//! hazard-pointer gate (spec.md §4.7).
//!
//! Grounded on `rs_lockfree::hazard_pointer::ThreadStore::retire`'s
//! retired-list CAS-detach bookkeeping and
//! `Johnabell-atom_box::domain::Domain::bulk_reclaim`/`reclaim_unguarded`'s
//! guarded-pointer-set scan before freeing, still-retired nodes relinked.
//! The split itself (a version gate for unlink, a pointer gate for free) is
//! spec.md's own design; neither of the two does both in one pass.

use crate::error::Status;
use crate::list::{Destructor, List};
use crate::node::Node;
use log::{debug, trace};
use std::sync::atomic::Ordering;

/// Run one reclamation pass over `list`, invoking `destructor` (if any) on
/// every element whose node is actually freed this pass.
pub(crate) fn run(list: &List<'_>, destructor: Option<Destructor>) -> Status {
    if list.domain().thread_state().is_none() {
        return Status::NoThread;
    }

    unlink_pass(list);
    free_pass(list, destructor);
    Status::Success
}

/// Phase 1: unlink every logically-removed node whose `removed_txn` is
/// strictly below the minimum active snapshot across the domain, pushing
/// each onto the calling thread's retired stack.
fn unlink_pass(list: &List<'_>) {
    let domain = list.domain();
    let min_active = domain.min_active_snapshot();
    let ts = domain.thread_state().expect("checked by caller");

    let mut prev: *mut Node = std::ptr::null_mut();
    let mut curr = list.head_ptr().load(Ordering::Acquire);

    while !curr.is_null() {
        let node = unsafe { &*curr };
        let removed = node.removed_txn(Ordering::Acquire);
        let next = node.next(Ordering::Acquire);

        if removed != 0 && removed < min_active {
            let unlinked = if prev.is_null() {
                list.head_ptr()
                    .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            } else {
                unsafe { &*prev }
                    .compare_exchange_next(curr, next, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            };

            if unlinked {
                trace!("reclaim: unlinked node (removed_txn={removed})");
                // Safe to overload `next` as the retired-stack link: the CAS
                // above just made `curr` unreachable from the head chain
                // (spec.md §9, "node reuse via retired next").
                unsafe { ts.push_retired(curr) };
                curr = next;
                continue;
            }
            // Lost the race for this node; leave it for a later pass rather
            // than looping here (spec.md §4.7: "advance and try again on a
            // subsequent reclaim pass").
        }

        prev = curr;
        curr = next;
    }
}

/// Phase 2: drain the calling thread's retired stack, freeing each node not
/// currently protected by any hazard cell in the domain, and re-deferring
/// the rest.
fn free_pass(list: &List<'_>, destructor: Option<Destructor>) {
    let domain = list.domain();
    let ts = domain.thread_state().expect("checked by caller");

    let mut curr = ts.take_retired();
    let mut deferred_head: *mut Node = std::ptr::null_mut();
    let mut deferred_tail: *mut Node = std::ptr::null_mut();
    let mut freed = 0usize;
    let mut deferred_count = 0usize;

    while !curr.is_null() {
        let next = unsafe { (*curr).next(Ordering::Relaxed) };

        if domain.any_hazard_equals(curr) {
            unsafe { (*curr).set_next(deferred_head, Ordering::Relaxed) };
            deferred_head = curr;
            if deferred_tail.is_null() {
                deferred_tail = curr;
            }
            deferred_count += 1;
        } else {
            let elm = unsafe { (*curr).user_elm() };
            unsafe { Node::free(curr) };
            if let Some(destructor) = destructor {
                unsafe { destructor(elm) };
            }
            freed += 1;
        }

        curr = next;
    }

    if !deferred_head.is_null() {
        unsafe { ts.put_back_retired(deferred_head, deferred_tail) };
    }

    debug!("reclaim: freed {freed} node(s), deferred {deferred_count}");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::domain::Domain;
    use crate::iter::ListIter;
    use std::ffi::c_void;
    use std::sync::atomic::AtomicUsize;

    fn elm(v: i32) -> *mut c_void {
        Box::into_raw(Box::new(v)) as *mut c_void
    }

    static DESTRUCTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_destructor(p: *mut c_void) {
        DESTRUCTOR_CALLS.fetch_add(1, Ordering::Relaxed);
        drop(Box::from_raw(p as *mut i32));
    }

    #[test]
    fn s6_reclaim_frees_unlinked_nodes() {
        DESTRUCTOR_CALLS.store(0, Ordering::Relaxed);
        let domain = Domain::create(4).unwrap();
        domain.register();
        let list = List::with_destructor(&domain, counting_destructor);
        let a = elm(1);
        list.insert_head(a);
        assert_eq!(list.remove(a), Status::Success);

        assert_eq!(list.reclaim(), Status::Success);
        assert_eq!(DESTRUCTOR_CALLS.load(Ordering::Relaxed), 1);

        // Second reclaim is a no-op: nothing left to unlink or free.
        assert_eq!(list.reclaim(), Status::Success);
        assert_eq!(DESTRUCTOR_CALLS.load(Ordering::Relaxed), 1);

        domain.unregister();
    }

    #[test]
    fn reclaim_defers_while_a_snapshot_is_active() {
        DESTRUCTOR_CALLS.store(0, Ordering::Relaxed);
        let domain = Domain::create(4).unwrap();
        domain.register();
        let list = List::with_destructor(&domain, counting_destructor);
        let a = elm(1);
        list.insert_head(a);

        let iter = ListIter::try_begin(&list).unwrap();
        assert_eq!(list.remove(a), Status::Success);
        assert_eq!(list.reclaim(), Status::Success);
        // min_active_snapshot <= removed_txn, so the node must not be
        // unlinked yet, let alone freed.
        assert_eq!(DESTRUCTOR_CALLS.load(Ordering::Relaxed), 0);
        iter.end();

        assert_eq!(list.reclaim(), Status::Success);
        assert_eq!(DESTRUCTOR_CALLS.load(Ordering::Relaxed), 1);

        domain.unregister();
    }

    #[test]
    fn reclaim_without_registration_fails() {
        let domain = Domain::create(4).unwrap();
        let list = List::new(&domain);
        assert_eq!(list.reclaim(), Status::NoThread);
    }
}
