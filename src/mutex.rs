// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::backoff::Backoff;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::util::loom_const_fn;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// A spinning mutual exclusion primitive protecting the small bookkeeping
/// structures of this crate (the cancellation registry, the mock clock).
///
/// Critical sections must stay short; nothing in this crate holds this lock
/// across unbounded work.
pub(crate) struct Mutex<T: ?Sized> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
#[clippy::has_significant_drop]
#[must_use = "if unused the Mutex will immediately unlock"]
pub(crate) struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: the mutex synchronizes access to `data`
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// Safety: the mutex synchronizes access to `data`
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    loom_const_fn! {
        pub(crate) const fn new(val: T) -> Mutex<T> {
            Mutex {
                lock: AtomicBool::new(false),
                data: UnsafeCell::new(val),
            }
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Creates a new `MutexGuard` without checking if the mutex is locked.
    ///
    /// # Safety
    ///
    /// This method must only be called if the thread logically holds the lock.
    #[inline]
    unsafe fn make_guard_unchecked(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            marker: PhantomData,
        }
    }

    /// Acquires the mutex, spinning until it is able to do so.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        let mut boff = Backoff::default();
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.spin();
            }
        }

        // Safety: The lock is held, as required.
        unsafe { self.make_guard_unchecked() }
    }

    /// Checks whether the mutex is currently locked.
    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

// === impl MutexGuard ===

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.mutex.data.with(|data| {
            // Safety: the guard proves the lock is held
            unsafe { &*data }
        })
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.mutex.data.with_mut(|data| {
            // Safety: the guard proves the lock is held
            unsafe { &mut *data }
        })
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.store(false, Ordering::Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::thread;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn counts_under_contention() {
        let m = Arc::new(Mutex::new(0_usize));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(*m.lock(), 400);
    }
}
