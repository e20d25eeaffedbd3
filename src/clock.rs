// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::time::Duration;

/// Ticks of a [`Clock`], the granularity deadlines are measured in.
pub type Ticks = u64;

/// A monotonic time source for deadline checks and vacuum pacing.
///
/// A `Clock` is a type-erased handle over an arbitrary tick counter, injected
/// into a lock through [`Options::clock`] so that tests can substitute a
/// manually driven source.
///
/// [`Options::clock`]: crate::Options::clock
pub struct Clock {
    name: &'static str,
    tick_duration: Duration,
    clock: RawClock,
}

/// A virtual function pointer table (vtable) that specifies the behavior
/// of a [`RawClock`].
///
/// The pointer passed to all functions inside the vtable is the `data` pointer
/// from the enclosing [`RawClock`] object.
///
/// The functions inside this struct are only intended to be called on the `data`
/// pointer of a properly constructed [`RawClock`] object from inside the
/// [`RawClock`] implementation. Calling one of the contained functions using
/// any other `data` pointer will cause undefined behavior.
///
/// # Thread safety
///
/// All vtable functions must be thread-safe (even though [`RawClock`] is
/// <code>\![Send] + \![Sync]</code>). This is because [`Clock`] is
/// <code>[Send] + [Sync]</code>, and it *will* be moved to arbitrary threads or
/// invoked by `&` reference. For example, this means that if the `clone` and
/// `drop` functions manage a reference count, they must do so atomically.
#[derive(Copy, Clone, Debug)]
pub struct RawClockVTable {
    clone: unsafe fn(*const ()) -> RawClock,
    now: unsafe fn(*const ()) -> Ticks,
    drop: unsafe fn(*const ()),
}

#[derive(Debug)]
pub struct RawClock {
    /// The `data` pointer can be used to store arbitrary data as required by the clock implementation.
    data: *const (),
    /// Virtual function pointer table that customizes the behavior of this clock.
    vtable: &'static RawClockVTable,
}

// === impl Clock ===

impl Unpin for Clock {}

// Safety: As part of the safety contract for RawClockVTable, the caller promised RawClock is Send
// therefore Clock is Send too
unsafe impl Send for Clock {}
// Safety: As part of the safety contract for RawClockVTable, the caller promised RawClock is Sync
// therefore Clock is Sync too
unsafe impl Sync for Clock {}

impl Clock {
    /// Creates a new `Clock` from the provided `tick_duration`, `data` pointer and `vtable`.
    ///
    /// The `tick_duration` is the `Duration` of time represented by a single tick of this clock,
    /// in effect its precision.
    ///
    /// The `data` pointer can be used to store arbitrary data as required by the clock
    /// implementation, e.g. a type-erased pointer to an `Arc` that holds private
    /// implementation-specific state. The value of this pointer gets passed to all functions that
    /// are part of the `vtable` as the first parameter.
    ///
    /// # Safety
    ///
    /// The behavior of the returned `Clock` is undefined if the contract defined
    /// in [`RawClockVTable`]'s documentation is not upheld.
    #[inline]
    #[must_use]
    pub const unsafe fn new(
        tick_duration: Duration,
        data: *const (),
        vtable: &'static RawClockVTable,
    ) -> Clock {
        // Safety: ensured by caller
        unsafe { Self::from_raw(tick_duration, RawClock { data, vtable }) }
    }

    /// Creates a new `Clock` from a [`RawClock`].
    ///
    /// # Safety
    ///
    /// The behavior of the returned `Clock` is undefined if the contract defined
    /// in [`RawClock`]'s and [`RawClockVTable`]'s documentation is not upheld.
    #[inline]
    #[must_use]
    pub const unsafe fn from_raw(tick_duration: Duration, clock: RawClock) -> Clock {
        Self {
            clock,
            tick_duration,
            name: "<unnamed mystery clock>",
        }
    }

    /// Add an arbitrary user-defined name to this `Clock`.
    ///
    /// This is generally used to describe the time source used by the
    /// `now()` function for this `Clock`.
    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Returns this `Clock`'s name, if it was given one using the [`Clock::named`]
    /// method.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the [`Duration`] of one tick of this clock.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    #[inline]
    pub fn now(&self) -> Ticks {
        // Safety: This is safe because `Clock::from_raw` is the only way
        // to initialize `vtable` and `data` requiring the user to acknowledge
        // that the contract of `RawClock` is upheld.
        unsafe { (self.clock.vtable.now)(self.clock.data) }
    }

    /// Converts a [`Duration`] into a number of this clock's ticks, rounding
    /// up so that a nonzero duration never becomes a zero-tick deadline.
    #[must_use]
    pub fn ticks_for(&self, duration: Duration) -> Ticks {
        let tick_nanos = self.tick_duration.as_nanos().max(1);
        let nanos = duration.as_nanos();
        let ticks = nanos.div_ceil(tick_nanos);
        Ticks::try_from(ticks).unwrap_or(Ticks::MAX)
    }
}

impl Clone for Clock {
    #[inline]
    fn clone(&self) -> Self {
        Clock {
            // Safety: see Clock::now
            clock: unsafe { (self.clock.vtable.clone)(self.clock.data) },
            tick_duration: self.tick_duration,
            name: self.name,
        }
    }
}

impl Drop for Clock {
    #[inline]
    fn drop(&mut self) {
        // Safety: see Clock::now
        unsafe { (self.clock.vtable.drop)(self.clock.data) }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vtable_ptr: *const RawClockVTable = self.clock.vtable;
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("tick_duration", &self.tick_duration)
            .field("data", &self.clock.data)
            .field("vtable", &vtable_ptr)
            .finish()
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {:?} precision", self.name, self.tick_duration)
    }
}

// === impl RawClock ===

impl RawClock {
    /// Creates a new `RawClock` from the provided `data` pointer and `vtable`.
    ///
    /// The `data` pointer can be used to store arbitrary data as required by the clock
    /// implementation; its value gets passed to all vtable functions as the first parameter.
    ///
    /// It is important to consider that the `data` pointer must point to a
    /// thread safe type such as an `Arc`.
    #[inline]
    #[must_use]
    pub const fn new(data: *const (), vtable: &'static RawClockVTable) -> RawClock {
        Self { data, vtable }
    }
}

// === impl RawClockVTable ===

impl RawClockVTable {
    pub const fn new(
        clone: unsafe fn(*const ()) -> RawClock,
        now: unsafe fn(*const ()) -> Ticks,
        drop: unsafe fn(*const ()),
    ) -> Self {
        Self { clone, now, drop }
    }
}

// === impl StdClock ===

/// A [`Clock`] over [`std::time::Instant`] with microsecond ticks.
#[cfg(feature = "std")]
pub struct StdClock;

#[cfg(feature = "std")]
impl StdClock {
    const VTABLE: RawClockVTable =
        RawClockVTable::new(Self::clone_raw, Self::now_raw, Self::drop_raw);

    /// Returns a new `Clock` anchored at the moment of this call.
    #[expect(clippy::new_ret_no_self, reason = "constructor for the erased handle")]
    #[must_use]
    pub fn new() -> Clock {
        let anchor = std::time::Instant::now();
        let ptr = alloc::sync::Arc::into_raw(alloc::sync::Arc::new(anchor));

        // Safety: the pointer is a valid `Arc<Instant>` and the vtable matches it.
        unsafe { Clock::new(Duration::from_micros(1), ptr.cast(), &Self::VTABLE).named("std") }
    }

    unsafe fn clone_raw(ptr: *const ()) -> RawClock {
        // Safety: ensured by caller
        unsafe { alloc::sync::Arc::increment_strong_count(ptr.cast::<std::time::Instant>()) }
        RawClock::new(ptr, &Self::VTABLE)
    }

    unsafe fn now_raw(ptr: *const ()) -> Ticks {
        // Safety: ensured by caller
        let anchor = unsafe { &*ptr.cast::<std::time::Instant>() };
        let elapsed = anchor.elapsed();
        Ticks::try_from(elapsed.as_micros()).unwrap_or(Ticks::MAX)
    }

    unsafe fn drop_raw(ptr: *const ()) {
        // Safety: ensured by caller
        drop(unsafe { alloc::sync::Arc::from_raw(ptr.cast::<std::time::Instant>()) });
    }
}

// === impl MockClock ===

/// Manually driven clock for deadline and vacuum tests.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::{Clock, RawClock, RawClockVTable, Ticks};
    use crate::loom::sync::Arc;
    use crate::mutex::Mutex;
    use core::time::Duration;

    pub struct MockClock {
        inner: Arc<Inner>,
        tick_duration: Duration,
    }

    struct Inner {
        now: Mutex<Ticks>,
    }

    impl MockClock {
        const VTABLE: RawClockVTable =
            RawClockVTable::new(Self::clone_raw, Self::now_raw, Self::drop_raw);

        #[must_use]
        pub fn new(tick_duration: Duration) -> Self {
            Self {
                inner: Arc::new(Inner {
                    now: Mutex::new(0),
                }),
                tick_duration,
            }
        }

        /// A mock clock ticking in milliseconds.
        #[must_use]
        pub fn new_1ms() -> Self {
            Self::new(Duration::from_millis(1))
        }

        /// Returns an injectable [`Clock`] handle sharing this mock's state.
        #[must_use]
        pub fn clock(&self) -> Clock {
            let ptr = Arc::into_raw(self.inner.clone());

            // Safety: the pointer is a valid `Arc<Inner>` and the vtable matches it.
            unsafe { Clock::new(self.tick_duration, ptr.cast(), &Self::VTABLE).named("mock") }
        }

        /// Advances the mock time by `duration`, rounded down to whole ticks.
        pub fn advance(&self, duration: Duration) {
            let tick_nanos = self.tick_duration.as_nanos().max(1);
            let ticks = Ticks::try_from(duration.as_nanos() / tick_nanos).unwrap_or(Ticks::MAX);
            *self.inner.now.lock() += ticks;
        }

        /// Advances the mock time by `ticks`.
        pub fn advance_ticks(&self, ticks: Ticks) {
            *self.inner.now.lock() += ticks;
        }

        unsafe fn clone_raw(ptr: *const ()) -> RawClock {
            // Safety: ensured by caller
            unsafe { Arc::increment_strong_count(ptr.cast::<Inner>()) }
            RawClock::new(ptr, &Self::VTABLE)
        }

        unsafe fn now_raw(ptr: *const ()) -> Ticks {
            // Safety: ensured by caller
            let inner = unsafe { &*ptr.cast::<Inner>() };
            *inner.now.lock()
        }

        unsafe fn drop_raw(ptr: *const ()) {
            // Safety: ensured by caller
            drop(unsafe { Arc::from_raw(ptr.cast::<Inner>()) });
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::mock::MockClock;
    use super::*;

    #[test]
    fn ticks_for_rounds_up() {
        let mock = MockClock::new_1ms();
        let clock = mock.clock();
        assert_eq!(clock.ticks_for(Duration::from_millis(5)), 5);
        assert_eq!(clock.ticks_for(Duration::from_micros(1)), 1);
        assert_eq!(clock.ticks_for(Duration::ZERO), 0);
    }

    #[test]
    fn mock_advances() {
        let mock = MockClock::new_1ms();
        let clock = mock.clock();
        assert_eq!(clock.now(), 0);
        mock.advance(Duration::from_millis(10));
        assert_eq!(clock.now(), 10);

        let cloned = clock.clone();
        mock.advance_ticks(5);
        assert_eq!(cloned.now(), 15);
        assert_eq!(clock.now(), 15);
    }

    #[cfg(feature = "std")]
    #[test]
    fn std_clock_monotonic() {
        let clock = StdClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
