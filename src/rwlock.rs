// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::cancel::CancelToken;
use crate::error::{AcquireError, OptionsError};
use crate::loom::cell::UnsafeCell;
use crate::raw::{Options, RawRwLock, Timeout};

/// An async reader-writer lock with upgradable readers.
///
/// Any number of readers (up to the count the state word can carry) share the
/// lock in parallel with at most one [upgradable reader]; a writer excludes
/// everyone. Waiters queue in FIFO order, optionally with one side elevated
/// (see [`Options::elevation`]), with per-request timeouts and cancellation.
///
/// The plain `read`/`upgradable_read`/`write` operations wait without a
/// deadline and fail only if the lock [overflows] or is [disposed]; the
/// `*_with` variants take a [`Timeout`] and an optional [`CancelToken`] and
/// resolve `Ok(None)` when the deadline elapses first.
///
/// [upgradable reader]: RwLockUpgradableReadGuard
/// [overflows]: AcquireError::Overflow
/// [disposed]: AcquireError::Disposed
pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

/// RAII structure used to release the shared read access of a lock when
/// dropped.
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockReadGuard<'a, T: ?Sized + 'a> {
    // NB: we use a pointer instead of `&'a T` to avoid `noalias` violations, because a
    // `RwLockReadGuard` argument doesn't hold immutability for its whole scope, only until it
    // drops. `NonNull` is also covariant over `T`, just like we would have with `&T`.
    data: NonNull<T>,
    lock: &'a RwLock<T>,
}

/// RAII structure used to release the upgradable read access of a lock when
/// dropped.
///
/// The holder shares the lock with ordinary readers but may [`upgrade`] to
/// exclusive access once it is the only reader left.
///
/// [`upgrade`]: Self::upgrade
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockUpgradableReadGuard<'a, T: ?Sized + 'a> {
    data: NonNull<T>,
    lock: &'a RwLock<T>,
}

/// RAII structure used to release the exclusive write access of a lock when
/// dropped.
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

/// RAII structure for the exclusive phase of an upgraded reader.
///
/// Dropping it releases both the exclusive phase and the underlying
/// upgradable hold; [`downgrade`] releases only the exclusive phase, handing
/// back the upgradable read guard.
///
/// [`downgrade`]: Self::downgrade
#[clippy::has_significant_drop]
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockUpgradedWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

// Safety: the lock provides the synchronization for `data`
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
// Safety: see above
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

// Safety: a read guard only exposes `&T`; releasing from another thread is
// supported by the lock.
unsafe impl<T: ?Sized + Send + Sync> Send for RwLockReadGuard<'_, T> {}
// Safety: see above
unsafe impl<T: ?Sized + Sync> Sync for RwLockReadGuard<'_, T> {}
// Safety: see above
unsafe impl<T: ?Sized + Send + Sync> Send for RwLockUpgradableReadGuard<'_, T> {}
// Safety: see above
unsafe impl<T: ?Sized + Sync> Sync for RwLockUpgradableReadGuard<'_, T> {}

// === impl RwLock ===

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock<T>` with default [`Options`].
    pub fn new(val: T) -> RwLock<T> {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(val),
        }
    }

    /// Creates a new unlocked `RwLock<T>` configured by `opts`.
    ///
    /// # Errors
    ///
    /// Returns an [`OptionsError`] when the options are inconsistent.
    pub fn with_options(opts: Options, val: T) -> Result<RwLock<T>, OptionsError> {
        Ok(Self {
            raw: RawRwLock::with_options(opts)?,
            data: UnsafeCell::new(val),
        })
    }

    /// Consumes this `RwLock`, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// The raw lock backing this `RwLock`.
    #[inline]
    pub fn raw(&self) -> &RawRwLock {
        &self.raw
    }

    /// Creates a new `RwLockReadGuard` without checking if the lock is held.
    ///
    /// # Safety
    ///
    /// This method must only be called if the caller logically holds a shared
    /// lock that no other guard accounts for.
    #[inline]
    unsafe fn make_read_guard_unchecked(&self) -> RwLockReadGuard<'_, T> {
        RwLockReadGuard {
            data: self.data.with_mut(|data| {
                // Safety: ensured by caller
                unsafe { NonNull::new_unchecked(data) }
            }),
            lock: self,
        }
    }

    /// # Safety
    ///
    /// See [`Self::make_read_guard_unchecked`], for the upgradable hold.
    #[inline]
    unsafe fn make_upgradable_guard_unchecked(&self) -> RwLockUpgradableReadGuard<'_, T> {
        RwLockUpgradableReadGuard {
            data: self.data.with_mut(|data| {
                // Safety: ensured by caller
                unsafe { NonNull::new_unchecked(data) }
            }),
            lock: self,
        }
    }

    /// # Safety
    ///
    /// See [`Self::make_read_guard_unchecked`], for the exclusive hold.
    #[inline]
    unsafe fn make_write_guard_unchecked(&self) -> RwLockWriteGuard<'_, T> {
        RwLockWriteGuard { lock: self }
    }

    /// Locks this `RwLock` with shared read access.
    ///
    /// # Errors
    ///
    /// Fails only on [overflow] or [disposal]; timeouts cannot occur.
    ///
    /// [overflow]: AcquireError::Overflow
    /// [disposal]: AcquireError::Disposed
    pub async fn read(&self) -> Result<RwLockReadGuard<'_, T>, AcquireError> {
        let acquired = self.raw.enter_read(Timeout::Never, None).await?;
        debug_assert!(acquired);
        // Safety: the lock was just entered shared.
        Ok(unsafe { self.make_read_guard_unchecked() })
    }

    /// Locks this `RwLock` with shared read access, bounded by `timeout` and
    /// optionally cancellable. Resolves `Ok(None)` when the timeout elapses
    /// first.
    pub async fn read_with(
        &self,
        timeout: Timeout,
        cancel: Option<CancelToken>,
    ) -> Result<Option<RwLockReadGuard<'_, T>>, AcquireError> {
        if self.raw.enter_read(timeout, cancel).await? {
            // Safety: the lock was just entered shared.
            Ok(Some(unsafe { self.make_read_guard_unchecked() }))
        } else {
            Ok(None)
        }
    }

    /// Attempts to acquire this `RwLock` with shared read access without
    /// waiting.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        if self.raw.try_enter_read() {
            // Safety: the lock was just entered shared.
            Some(unsafe { self.make_read_guard_unchecked() })
        } else {
            None
        }
    }

    /// Locks this `RwLock` with upgradable read access.
    ///
    /// # Errors
    ///
    /// Fails only on [overflow] or [disposal]; timeouts cannot occur.
    ///
    /// [overflow]: AcquireError::Overflow
    /// [disposal]: AcquireError::Disposed
    pub async fn upgradable_read(
        &self,
    ) -> Result<RwLockUpgradableReadGuard<'_, T>, AcquireError> {
        let acquired = self.raw.enter_read_upgrade(Timeout::Never, None).await?;
        debug_assert!(acquired);
        // Safety: the lock was just entered upgradable-shared.
        Ok(unsafe { self.make_upgradable_guard_unchecked() })
    }

    /// Locks this `RwLock` with upgradable read access, bounded by `timeout`
    /// and optionally cancellable.
    pub async fn upgradable_read_with(
        &self,
        timeout: Timeout,
        cancel: Option<CancelToken>,
    ) -> Result<Option<RwLockUpgradableReadGuard<'_, T>>, AcquireError> {
        if self.raw.enter_read_upgrade(timeout, cancel).await? {
            // Safety: the lock was just entered upgradable-shared.
            Ok(Some(unsafe { self.make_upgradable_guard_unchecked() }))
        } else {
            Ok(None)
        }
    }

    /// Attempts to acquire this `RwLock` with upgradable read access without
    /// waiting.
    pub fn try_upgradable_read(&self) -> Option<RwLockUpgradableReadGuard<'_, T>> {
        if self.raw.try_enter_read_upgrade() {
            // Safety: the lock was just entered upgradable-shared.
            Some(unsafe { self.make_upgradable_guard_unchecked() })
        } else {
            None
        }
    }

    /// Locks this `RwLock` with exclusive write access.
    ///
    /// # Errors
    ///
    /// Fails only on [overflow] or [disposal]; timeouts cannot occur.
    ///
    /// [overflow]: AcquireError::Overflow
    /// [disposal]: AcquireError::Disposed
    pub async fn write(&self) -> Result<RwLockWriteGuard<'_, T>, AcquireError> {
        let acquired = self.raw.enter_write(Timeout::Never, None).await?;
        debug_assert!(acquired);
        // Safety: the lock was just entered exclusive.
        Ok(unsafe { self.make_write_guard_unchecked() })
    }

    /// Locks this `RwLock` with exclusive write access, bounded by `timeout`
    /// and optionally cancellable.
    pub async fn write_with(
        &self,
        timeout: Timeout,
        cancel: Option<CancelToken>,
    ) -> Result<Option<RwLockWriteGuard<'_, T>>, AcquireError> {
        if self.raw.enter_write(timeout, cancel).await? {
            // Safety: the lock was just entered exclusive.
            Ok(Some(unsafe { self.make_write_guard_unchecked() }))
        } else {
            Ok(None)
        }
    }

    /// Attempts to lock this `RwLock` with exclusive write access without
    /// waiting.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        if self.raw.try_enter_write() {
            // Safety: the lock was just entered exclusive.
            Some(unsafe { self.make_write_guard_unchecked() })
        } else {
            None
        }
    }

    /// Fails all queued waiters and rejects future locking; current guards
    /// stay valid until dropped.
    pub fn dispose(&self) {
        self.raw.dispose();
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `RwLock` mutably, no actual locking needs
    /// to take place---the mutable borrow statically guarantees no locks
    /// exist.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.with_mut(|data| {
            // Safety: `&mut self` excludes all guards.
            unsafe { &mut *data }
        })
    }
}

impl<T: Default> Default for RwLock<T> {
    #[inline]
    fn default() -> RwLock<T> {
        RwLock::new(T::default())
    }
}

impl<T> From<T> for RwLock<T> {
    fn from(val: T) -> Self {
        RwLock::new(val)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RwLock");
        match self.try_read() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.field("state", &self.raw.state()).finish_non_exhaustive()
    }
}

// === impl RwLockReadGuard ===

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves the shared lock is held.
        unsafe { self.data.as_ref() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.exit_read();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

// === impl RwLockUpgradableReadGuard ===

impl<'a, T: ?Sized> RwLockUpgradableReadGuard<'a, T> {
    /// Converts this hold to exclusive access, waiting for sibling readers to
    /// leave.
    ///
    /// # Errors
    ///
    /// On [disposal] the upgradable hold is released and the error returned.
    ///
    /// [disposal]: AcquireError::Disposed
    pub async fn upgrade(self) -> Result<RwLockUpgradedWriteGuard<'a, T>, AcquireError> {
        let lock = self.lock;
        let acquired = lock.raw.enter_write_upgrade(Timeout::Never, None).await?;
        debug_assert!(acquired);
        mem::forget(self);
        Ok(RwLockUpgradedWriteGuard { lock })
    }

    /// Converts this hold to exclusive access if no sibling readers are
    /// inside the lock, returning the untouched guard otherwise.
    pub fn try_upgrade(self) -> Result<RwLockUpgradedWriteGuard<'a, T>, Self> {
        if self.lock.raw.try_enter_write_upgrade() {
            let lock = self.lock;
            mem::forget(self);
            Ok(RwLockUpgradedWriteGuard { lock })
        } else {
            Err(self)
        }
    }
}

impl<T: ?Sized> Deref for RwLockUpgradableReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves the upgradable-shared lock is held.
        unsafe { self.data.as_ref() }
    }
}

impl<T: ?Sized> Drop for RwLockUpgradableReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.exit_read_upgrade();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockUpgradableReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

// === impl RwLockWriteGuard ===

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.lock.data.with(|data| {
            // Safety: the guard proves the exclusive lock is held.
            unsafe { &*data }
        })
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.lock.data.with_mut(|data| {
            // Safety: the guard proves the exclusive lock is held.
            unsafe { &mut *data }
        })
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.exit_write();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

// === impl RwLockUpgradedWriteGuard ===

impl<'a, T: ?Sized> RwLockUpgradedWriteGuard<'a, T> {
    /// Releases only the exclusive phase, handing back the upgradable read
    /// hold this guard was upgraded from.
    pub fn downgrade(self) -> RwLockUpgradableReadGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        lock.raw.exit_write_upgrade();
        // Safety: the upgradable-shared hold is still ours.
        unsafe { lock.make_upgradable_guard_unchecked() }
    }
}

impl<T: ?Sized> Deref for RwLockUpgradedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.lock.data.with(|data| {
            // Safety: the guard proves the exclusive lock is held.
            unsafe { &*data }
        })
    }
}

impl<T: ?Sized> DerefMut for RwLockUpgradedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.lock.data.with_mut(|data| {
            // Safety: the guard proves the exclusive lock is held.
            unsafe { &mut *data }
        })
    }
}

impl<T: ?Sized> Drop for RwLockUpgradedWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.exit_write_upgrade();
        self.lock.raw.exit_read_upgrade();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLockUpgradedWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn read_guard_releases_on_drop() {
        let lock = RwLock::new(5);
        {
            let guard = block_on(lock.read()).unwrap();
            assert_eq!(*guard, 5);
            assert_eq!(lock.raw().state().shared_count(), 1);
        }
        assert_eq!(lock.raw().state().bits(), 0);
    }

    #[test]
    fn write_guard_is_exclusive() {
        let lock = RwLock::new(5);
        let mut guard = block_on(lock.write()).unwrap();
        *guard = 6;

        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(guard);

        assert_eq!(*block_on(lock.read()).unwrap(), 6);
    }

    #[test]
    fn upgrade_and_downgrade() {
        let lock = RwLock::new(0);

        let upgradable = block_on(lock.upgradable_read()).unwrap();
        // ordinary readers coexist with the upgradable holder
        let reader = lock.try_read().unwrap();
        assert_eq!(*reader, 0);

        let mut upgrade = task::spawn(upgradable.upgrade());
        assert_pending!(upgrade.poll());

        drop(reader);
        assert!(upgrade.is_woken());
        let mut writer = assert_ready!(upgrade.poll()).unwrap();
        drop(upgrade);
        *writer = 9;

        let upgradable = writer.downgrade();
        assert_eq!(*upgradable, 9);
        // back in upgradable-read state, readers may join again
        assert!(lock.try_read().is_some());
        drop(upgradable);

        assert_eq!(lock.raw().state().bits(), 0);
        assert_eq!(lock.into_inner(), 9);
    }

    #[test]
    fn try_upgrade_fails_with_sibling_reader() {
        let lock = RwLock::new(());
        let upgradable = lock.try_upgradable_read().unwrap();
        let reader = lock.try_read().unwrap();

        let upgradable = match upgradable.try_upgrade() {
            Err(guard) => guard,
            Ok(_) => panic!("upgrade must fail while a sibling reader is inside"),
        };

        drop(reader);
        assert!(upgradable.try_upgrade().is_ok());
        assert_eq!(lock.raw().state().bits(), 0);
    }

    #[test]
    fn timeout_surface_returns_none() {
        let lock = RwLock::new(());
        let _write = lock.try_write().unwrap();

        let res = block_on(lock.read_with(Timeout::Immediate, None)).unwrap();
        assert!(res.is_none());
        let res = block_on(lock.write_with(Timeout::Immediate, None)).unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn dispose_poisons_future_lockers() {
        let lock = RwLock::new(());
        lock.dispose();
        assert!(matches!(
            block_on(lock.read()),
            Err(AcquireError::Disposed)
        ));
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn debug_does_not_take_the_lock() {
        let lock = RwLock::new(7);
        let _write = lock.try_write().unwrap();
        let rendered = std::format!("{lock:?}");
        assert!(rendered.contains("locked"));
    }
}
