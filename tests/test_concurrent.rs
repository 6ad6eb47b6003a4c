//! Concurrent stress test modeled on
//! `rs_lockfree/tests/test_hazard_epoch.rs::test_multi_thread`: reader
//! threads continuously iterate while writer threads insert/remove/reclaim,
//! each thread pinned to a core via `core_affinity`. Exercises spec.md §8
//! property 4 (no use-after-free) and property 5 (eventual reclamation)
//! under contention; a wrong hazard-pointer or reclamation gate would show
//! up here as a crash or an assertion failure, not just a lint.

extern crate core_affinity;
extern crate env_logger;
extern crate hazptr_list;

use hazptr_list::{Domain, List, ListIter, Status};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

unsafe fn free_i64(p: *mut c_void) {
    drop(Box::from_raw(p as *mut i64));
}

fn pin_to_core(index: usize) {
    if let Some(cores) = core_affinity::get_core_ids() {
        if !cores.is_empty() {
            core_affinity::set_for_current(cores[index % cores.len()]);
        }
    }
}

/// Writers insert, then immediately logically remove and reclaim, so the
/// list length stays bounded while hazard/retired-list churn stays high.
fn writer(list: &'static List<'static>, domain: &'static Domain, loops: usize, live: &AtomicI64) {
    domain.register();
    for i in 0..loops {
        let elm = Box::into_raw(Box::new(i as i64)) as *mut c_void;
        assert_eq!(list.insert_head(elm), Status::Success);
        live.fetch_add(1, Ordering::Relaxed);
        assert_eq!(list.remove(elm), Status::Success);
        list.reclaim();
    }
    domain.unregister();
}

/// Readers repeatedly snapshot-iterate the list, asserting every yielded
/// element is readable (the use-after-free canary: a freed node's memory
/// being reused elsewhere would corrupt this read and fail the assert).
fn reader(list: &'static List<'static>, domain: &'static Domain, loops: usize, stop: &AtomicBool) {
    domain.register();
    for _ in 0..loops {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let mut iter = match ListIter::try_begin(list) {
            Ok(iter) => iter,
            Err(_) => continue,
        };
        while let Some(e) = iter.next() {
            let v = unsafe { *(e as *const i64) };
            assert!(v >= 0);
        }
        iter.end();
        assert_eq!(list.reclaim(), Status::Success);
    }
    domain.unregister();
}

#[test]
fn concurrent_readers_writers_no_crash_eventual_reclaim() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Leaked for the test's duration: every spawned thread below joins
    // before this function returns, so the 'static erasure never outlives
    // an actual use.
    let domain: &'static Domain = Box::leak(Box::new(Domain::create(8).unwrap()));
    let list: &'static List<'static> =
        Box::leak(Box::new(List::with_destructor(domain, free_i64)));

    let writer_count = 3;
    let reader_count = 3;
    let loops = 2000;

    let live = Arc::new(AtomicI64::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for i in 0..writer_count {
        let live = live.clone();
        handles.push(thread::spawn(move || {
            pin_to_core(i);
            writer(list, domain, loops, &live);
        }));
    }
    for i in 0..reader_count {
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            pin_to_core(writer_count + i);
            reader(list, domain, loops, &stop);
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);

    assert_eq!(live.load(Ordering::Relaxed), (writer_count * loops) as i64);

    domain.register();
    assert_eq!(list.count(), 0);
    domain.unregister();
}
