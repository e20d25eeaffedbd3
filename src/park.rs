// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bridges blocking callers onto the async acquisition machinery: a [`Park`]
//! implementation suspends the calling thread, and [`Parker::into_waker`]
//! turns it into a [`Waker`] the lock's completion paths can use like any
//! other.

use alloc::sync::Arc;
use core::task::{RawWaker, RawWakerVTable, Waker};
use core::time::Duration;
use static_assertions::assert_impl_all;

/// An execution context that can suspend itself until unparked.
pub trait Park {
    fn park(&self);
    fn park_timeout(&self, duration: Duration);
    fn unpark(&self);
}

/// [`Park`] over [`std::thread`].
#[derive(Debug)]
pub struct StdPark {
    thread: std::thread::Thread,
}

impl StdPark {
    /// The parker for the calling thread.
    #[must_use]
    pub fn for_current() -> Self {
        Self {
            thread: std::thread::current(),
        }
    }
}

impl Park for StdPark {
    #[inline]
    fn park(&self) {
        std::thread::park();
    }

    #[inline]
    fn park_timeout(&self, duration: Duration) {
        std::thread::park_timeout(duration);
    }

    #[inline]
    fn unpark(&self) {
        self.thread.unpark();
    }
}

/// A cloneable handle over a [`Park`] implementation, convertible into a
/// [`Waker`].
#[derive(Debug)]
pub struct Parker<P>(Arc<P>);

assert_impl_all!(Parker<StdPark>: Send, Sync);

// === impl Parker ===

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Park + Send + Sync> Parker<P> {
    pub fn new(park_impl: P) -> Self {
        Self(Arc::new(park_impl))
    }

    #[inline]
    pub fn park(&self) {
        self.0.park();
    }

    #[inline]
    pub fn park_timeout(&self, duration: Duration) {
        self.0.park_timeout(duration);
    }

    #[inline]
    pub fn unpark(&self) {
        self.0.unpark();
    }

    /// Convert self into an async Rust compatible `Waker` which will wake
    /// this thread through its unparking method.
    #[inline]
    #[must_use]
    pub fn into_waker(self) -> Waker {
        // Safety: the vtable functions uphold the RawWaker contract, see below
        unsafe {
            let raw = Self::into_raw_waker(self.0);
            Waker::from_raw(raw)
        }
    }

    fn into_raw(this: Arc<P>) -> *const () {
        Arc::into_raw(this).cast::<()>()
    }

    unsafe fn from_raw(ptr: *const ()) -> Arc<P> {
        // Safety: ensured by caller
        unsafe { Arc::from_raw(ptr.cast::<P>()) }
    }

    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    unsafe fn waker_clone(raw: *const ()) -> RawWaker {
        // Safety: ensured by the vtable contract
        unsafe {
            Arc::increment_strong_count(raw.cast::<P>());
            Self::into_raw_waker(Self::from_raw(raw))
        }
    }

    unsafe fn waker_drop(raw: *const ()) {
        // Safety: ensured by the vtable contract
        unsafe {
            drop(Self::from_raw(raw));
        }
    }

    unsafe fn waker_wake(raw: *const ()) {
        // Safety: ensured by the vtable contract
        let park = unsafe { Self::from_raw(raw) };
        park.unpark();
    }

    unsafe fn waker_wake_by_ref(raw: *const ()) {
        let park = raw.cast::<P>();
        // Safety: ensured by the vtable contract
        unsafe {
            (*park).unpark();
        }
    }

    // `Waker::will_wake` is used all over the place to optimize waker code (e.g. only update wakers
    // if they have a different wake target). Problem is `will_wake` only checks for pointer
    // equality and since `into_raw_waker` would usually be inlined in release mode (and with it
    // `WAKER_VTABLE`) the Waker identity would be different before and after calling `.clone()`.
    // This isn't a correctness problem since it's still the same waker in the end, it just causes a
    // lot of unnecessary wake ups. the `inline(never)` below is therefore quite load-bearing
    #[inline(never)]
    fn into_raw_waker(this: Arc<P>) -> RawWaker {
        RawWaker::new(Self::into_raw(this), &Self::WAKER_VTABLE)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::thread;

    #[test]
    fn waker_unparks_the_thread() {
        let (tx, rx) = channel();

        let parked = thread::spawn(move || {
            let parker = Parker::new(StdPark::for_current());
            tx.send(parker.clone().into_waker()).unwrap();
            parker.park();
        });

        let waker = rx.recv().unwrap();
        waker.wake();

        parked.join().unwrap();
    }
}
