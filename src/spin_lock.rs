//! A user-mode test-and-set spin lock.
//!
//! Ported from `rs_lockfree::spin_lock::SpinLock` (which used nightly
//! `std::intrinsics::atomic_cxchg` on a raw `i8`) to stable
//! `std::sync::atomic::AtomicBool`. Used by [`crate::domain::Domain`] to
//! serialize concurrent calls to `grow` (the only blocking operation
//! anywhere in this crate, spec.md §5).

use crate::util::pause;
use std::sync::atomic::{AtomicBool, Ordering};

/// A spin lock taken only around `Domain`'s slot-table resize.
#[derive(Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Keep trying to lock until successful.
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                pause();
            }
        }
    }

    /// Keep trying to lock until successful, returning a guard that unlocks on drop.
    #[inline]
    pub fn lock_guard(&self) -> SpinLockGuard<'_> {
        self.lock();
        SpinLockGuard { spin_lock: self }
    }

    /// Unlock. Panics if not currently locked.
    #[inline]
    pub fn unlock(&self) {
        let was_locked = self.locked.swap(false, Ordering::Release);
        assert!(was_locked, "unlock called on a lock that was not held");
    }

    /// True if currently locked.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Try to lock once, without spinning. Returns true on success.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

/// RAII guard returned by [`SpinLock::lock_guard`]; unlocks on drop.
pub struct SpinLockGuard<'a> {
    spin_lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.spin_lock.unlock();
    }
}

#[cfg(test)]
mod test {
    use super::SpinLock;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = SpinLock::default();
        lock.lock();
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let lock = SpinLock::default();
        {
            let _guard = lock.lock_guard();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::default();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
    }

    #[test]
    #[should_panic]
    fn unlock_without_lock_panics() {
        let lock = SpinLock::default();
        lock.unlock();
    }
}
