// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronous adapter over the async lock: every operation drives the same
//! acquisition future to completion on the calling thread, parking through
//! [`StdPark`] instead of suspending a task. Blocking and async callers may
//! share one lock instance.

use core::fmt;
use core::pin::pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::time::Instant;

use crate::error::OptionsError;
use crate::park::{Parker, StdPark};
use crate::raw::{Options, Timeout};
use crate::rwlock;

pub use crate::rwlock::{
    RwLockReadGuard, RwLockUpgradableReadGuard, RwLockUpgradedWriteGuard, RwLockWriteGuard,
};

/// A blocking reader-writer lock with upgradable readers, sharing its
/// machinery (and optionally an instance) with the async [`RwLock`].
///
/// The waiting operations panic on [queue overflow] and [disposal] of the
/// underlying lock, mirroring how poisoned standard-library locks surface
/// misuse; the `*_timeout` variants return `None` when the deadline elapses
/// first.
///
/// [`RwLock`]: crate::RwLock
/// [queue overflow]: crate::AcquireError::Overflow
/// [disposal]: crate::AcquireError::Disposed
pub struct RwLock<T: ?Sized> {
    inner: rwlock::RwLock<T>,
}

/// Drives `future` to completion on the calling thread, parking between
/// polls. `budget` bounds the parking so a deadline measured on the lock's
/// clock is honored even if no releaser comes by to complete the waiter.
fn block_on<F: Future>(future: F, budget: Option<Duration>) -> F::Output {
    let parker = Parker::new(StdPark::for_current());
    let waker = parker.clone().into_waker();
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);

    let expires = budget.map(|budget| Instant::now() + budget);
    loop {
        if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
            return out;
        }
        match expires {
            Some(expires) => {
                let now = Instant::now();
                // poll once more past the deadline so the future can observe
                // its own timeout
                let remaining = expires.saturating_duration_since(now);
                parker.park_timeout(remaining.max(Duration::from_millis(1)));
            }
            None => parker.park(),
        }
    }
}

// === impl RwLock ===

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock<T>` with default [`Options`].
    pub fn new(val: T) -> RwLock<T> {
        Self {
            inner: rwlock::RwLock::new(val),
        }
    }

    /// Creates a new unlocked `RwLock<T>` configured by `opts`.
    ///
    /// # Errors
    ///
    /// Returns an [`OptionsError`] when the options are inconsistent.
    pub fn with_options(opts: Options, val: T) -> Result<RwLock<T>, OptionsError> {
        Ok(Self {
            inner: rwlock::RwLock::with_options(opts, val)?,
        })
    }

    /// Consumes this `RwLock`, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// The async view of this lock; guards from either side interoperate.
    #[inline]
    pub fn as_async(&self) -> &rwlock::RwLock<T> {
        &self.inner
    }

    /// Locks this `RwLock` with shared read access, blocking the current
    /// thread until it can be acquired.
    ///
    /// # Panics
    ///
    /// Panics if the underlying lock was disposed or its waiter queue
    /// overflowed.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        block_on(self.inner.read(), None).expect("lock disposed or waiter queue overflowed")
    }

    /// Attempts to acquire this `RwLock` with shared read access.
    ///
    /// This function does not block.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.inner.try_read()
    }

    /// Locks this `RwLock` with shared read access, giving up once `timeout`
    /// elapses.
    ///
    /// # Panics
    ///
    /// Panics if the underlying lock was disposed or its waiter queue
    /// overflowed.
    pub fn read_timeout(&self, timeout: Duration) -> Option<RwLockReadGuard<'_, T>> {
        block_on(
            self.inner.read_with(Timeout::After(timeout), None),
            Some(timeout),
        )
        .expect("lock disposed or waiter queue overflowed")
    }

    /// Locks this `RwLock` with upgradable read access, blocking the current
    /// thread until it can be acquired.
    ///
    /// # Panics
    ///
    /// Panics if the underlying lock was disposed or its waiter queue
    /// overflowed.
    pub fn upgradable_read(&self) -> RwLockUpgradableReadGuard<'_, T> {
        block_on(self.inner.upgradable_read(), None)
            .expect("lock disposed or waiter queue overflowed")
    }

    /// Attempts to acquire this `RwLock` with upgradable read access.
    ///
    /// This function does not block.
    pub fn try_upgradable_read(&self) -> Option<RwLockUpgradableReadGuard<'_, T>> {
        self.inner.try_upgradable_read()
    }

    /// Locks this `RwLock` with upgradable read access, giving up once
    /// `timeout` elapses.
    ///
    /// # Panics
    ///
    /// Panics if the underlying lock was disposed or its waiter queue
    /// overflowed.
    pub fn upgradable_read_timeout(
        &self,
        timeout: Duration,
    ) -> Option<RwLockUpgradableReadGuard<'_, T>> {
        block_on(
            self.inner
                .upgradable_read_with(Timeout::After(timeout), None),
            Some(timeout),
        )
        .expect("lock disposed or waiter queue overflowed")
    }

    /// Locks this `RwLock` with exclusive write access, blocking the current
    /// thread until it can be acquired.
    ///
    /// # Panics
    ///
    /// Panics if the underlying lock was disposed or its waiter queue
    /// overflowed.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        block_on(self.inner.write(), None).expect("lock disposed or waiter queue overflowed")
    }

    /// Attempts to lock this `RwLock` with exclusive write access.
    ///
    /// This function does not block.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }

    /// Locks this `RwLock` with exclusive write access, giving up once
    /// `timeout` elapses.
    ///
    /// # Panics
    ///
    /// Panics if the underlying lock was disposed or its waiter queue
    /// overflowed.
    pub fn write_timeout(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, T>> {
        block_on(
            self.inner.write_with(Timeout::After(timeout), None),
            Some(timeout),
        )
        .expect("lock disposed or waiter queue overflowed")
    }

    /// Returns a mutable reference to the underlying data.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Converts an upgradable read guard to exclusive access, blocking the
/// current thread until the sibling readers have left.
///
/// # Panics
///
/// Panics if the underlying lock is disposed while waiting.
pub fn upgrade<T: ?Sized>(guard: RwLockUpgradableReadGuard<'_, T>) -> RwLockUpgradedWriteGuard<'_, T> {
    block_on(guard.upgrade(), None).expect("lock disposed while upgrading")
}

impl<T: Default> Default for RwLock<T> {
    #[inline]
    fn default() -> RwLock<T> {
        RwLock::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::mem;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::vec::Vec;

    #[derive(Eq, PartialEq, Debug)]
    struct NonCopy(i32);

    #[test]
    fn smoke() {
        let l = RwLock::new(());
        drop(l.read());
        drop(l.write());
        drop((l.read(), l.read()));
        drop(l.upgradable_read());
        drop(l.write());
    }

    #[test]
    fn test_rw_arc() {
        let arc = Arc::new(RwLock::new(0));
        let arc2 = arc.clone();
        let (tx, rx) = channel();

        thread::spawn(move || {
            let mut lock = arc2.write();
            for _ in 0..10 {
                let tmp = *lock;
                *lock = -1;
                thread::yield_now();
                *lock = tmp + 1;
            }
            tx.send(()).unwrap();
        });

        // Readers try to catch the writer in the act
        let mut children = Vec::new();
        for _ in 0..5 {
            let arc3 = arc.clone();
            children.push(thread::spawn(move || {
                let lock = arc3.read();
                assert!(*lock >= 0);
            }));
        }

        // Wait for children to pass their asserts
        for r in children {
            assert!(r.join().is_ok());
        }

        // Wait for writer to finish
        rx.recv().unwrap();
        let lock = arc.read();
        assert_eq!(*lock, 10);
    }

    #[test]
    fn test_into_inner() {
        let m = RwLock::new(NonCopy(10));
        assert_eq!(m.into_inner(), NonCopy(10));
    }

    #[test]
    fn test_into_inner_drop() {
        struct Foo(Arc<AtomicUsize>);
        impl Drop for Foo {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let num_drops = Arc::new(AtomicUsize::new(0));
        let m = RwLock::new(Foo(num_drops.clone()));
        assert_eq!(num_drops.load(Ordering::SeqCst), 0);
        {
            let _inner = m.into_inner();
            assert_eq!(num_drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(num_drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_mut() {
        let mut m = RwLock::new(NonCopy(10));
        *m.get_mut() = NonCopy(20);
        assert_eq!(m.into_inner(), NonCopy(20));
    }

    #[test]
    fn test_needs_drop() {
        assert!(!mem::needs_drop::<NonCopy>());
    }

    #[test]
    fn try_write_fails_under_read() {
        let lock = RwLock::new(0isize);
        let read_guard = lock.read();

        assert!(lock.try_write().is_none());
        drop(read_guard);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn write_timeout_expires_under_contention() {
        let lock = RwLock::new(());
        let read_guard = lock.read();

        assert!(lock.write_timeout(Duration::from_millis(20)).is_none());
        drop(read_guard);
        assert!(lock.write_timeout(Duration::from_millis(20)).is_some());
    }

    #[test]
    fn upgrade_waits_for_sibling_readers() {
        let lock = Arc::new(RwLock::new(0));

        let upgradable = lock.upgradable_read();
        let reader = {
            let lock = lock.clone();
            let (tx, rx) = channel();
            let handle = thread::spawn(move || {
                let guard = lock.read();
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(30));
                drop(guard);
            });
            rx.recv().unwrap();
            handle
        };

        // blocks until the sibling reader is gone
        let mut writer = upgrade(upgradable);
        *writer = 7;
        let upgradable = writer.downgrade();
        assert_eq!(*upgradable, 7);
        drop(upgradable);

        reader.join().unwrap();
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn writer_blocks_reader_until_release() {
        let lock = Arc::new(RwLock::new(0));
        let write_guard = lock.write();

        let reader = {
            let lock = lock.clone();
            thread::spawn(move || *lock.read())
        };

        thread::sleep(Duration::from_millis(20));
        drop(write_guard);
        assert_eq!(reader.join().unwrap(), 0);
    }
}
