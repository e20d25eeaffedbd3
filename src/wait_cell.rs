// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::task::{Context, Poll, Waker};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::util::loom_const_fn;

/// An atomically registered [`Waker`].
///
/// This cell stores the [`Waker`] of a single task. A [`Waker`] is stored in
/// the cell by calling [`poll_wait`]; once stored, the task can be woken by
/// calling [`wake`] on the cell. A wakeup that arrives while no waker is
/// registered is stored and consumed by the next [`poll_wait`], so a waiter
/// that registers after its completion races in never sleeps through it.
///
/// This is the result channel of a queued lock request: completing a request
/// publishes the outcome in the request's state word and then wakes this
/// cell.
///
/// # Implementation Notes
///
/// The synchronization strategy is the one used by Tokio's `AtomicWaker` and
/// maitake's `WaitCell`: a `REGISTERING` bit serializes waker replacement
/// against a `WAKING` bit serializing waker consumption, with a `WOKEN` bit
/// recording wakeups that found no registered waker.
///
/// [`poll_wait`]: Self::poll_wait
/// [`wake`]: Self::wake
pub(crate) struct WaitCell {
    state: AtomicUsize,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    struct State: usize {
        const WAITING = 0b000;
        const REGISTERING = 0b001;
        const WAKING = 0b010;
        const WOKEN = 0b100;
    }
}
// WAITING MUST be zero
const_assert_eq!(State::WAITING.bits(), 0);

// === impl WaitCell ===

impl WaitCell {
    loom_const_fn! {
        pub(crate) const fn new() -> Self {
            Self {
                state: AtomicUsize::new(State::WAITING.bits()),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Register the waker from `cx`, or consume a stored wakeup.
    ///
    /// Returns [`Poll::Ready`] when a wakeup was already stored (or arrives
    /// mid-registration); the caller must then re-inspect whatever condition
    /// the wakeup signals. Returns [`Poll::Pending`] once the waker is parked
    /// in the cell.
    pub(crate) fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<()> {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::WOKEN) => {
                // take the wakeup
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(());
            }
            // someone else is waking, so don't wait!
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(());
            }
            Err(_) => {
                // a concurrent registration is in flight; yield and retry once
                // it settled. A request has a single waiter, so this only
                // happens when a waker migrates executors mid-poll.
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Ok(_) => {}
        }

        let waker = cx.waker();
        tracing::trace!(?waker, "registering waker");

        let prev_waker = self.waker.with_mut(|old_waker| {
            // Safety: we hold the REGISTERING bit, no other thread touches the
            // waker slot.
            unsafe {
                match &mut *old_waker {
                    Some(old_waker) if waker.will_wake(old_waker) => None,
                    old => old.replace(waker.clone()),
                }
            }
        });
        drop(prev_waker);

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // A wakeup arrived while we were registering. Un-park the waker we
            // just stored, reset the cell and report the wakeup to the caller.
            debug_assert!(actual.contains(State::WOKEN));

            let waker = self.waker.with_mut(|waker| {
                // Safety: the waker lock is still ours; wakers observing
                // REGISTERING do not touch the slot.
                unsafe { (*waker).take() }
            });
            drop(waker);

            self.state.store(State::WAITING.bits(), Ordering::Release);
            return Poll::Ready(());
        }

        Poll::Pending
    }

    /// Wake the [`Waker`] stored in this cell.
    ///
    /// If no waker is registered, the wakeup is stored and consumed by the
    /// next call to [`poll_wait`](Self::poll_wait).
    pub(crate) fn wake(&self) {
        if let Some(waker) = self.take_waker() {
            waker.wake();
        }
    }

    /// Mark the cell woken and remove the registered [`Waker`], if any,
    /// without invoking it.
    ///
    /// The caller is responsible for waking the returned waker; this exists so
    /// the release dispatcher can batch wakeups outside its CAS loops.
    pub(crate) fn take_waker(&self) -> Option<Waker> {
        // Set the WAKING bit (to indicate that we're touching the waker) and
        // the WOKEN bit (to indicate that we intend to wake it up).
        let state = self.fetch_or(State::WAKING | State::WOKEN, Ordering::AcqRel);

        // Is anyone else touching the waker?
        if !state.intersects(State::WAKING | State::REGISTERING) {
            // Safety: no one else is touching the waker right now, so it is
            // safe to access it mutably.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // Release the lock.
            self.fetch_and(!State::WAKING, Ordering::Release);

            if let Some(waker) = waker {
                tracing::trace!(?waker, "took waker");
                return Some(waker);
            }
        } else {
            // Someone is mid-registration; the WOKEN bit we set makes their
            // registration CAS fail, which reports the wakeup. Drop our WAKING
            // claim again.
            self.fetch_and(!State::WAKING, Ordering::Release);
        }

        None
    }

    /// Clear any stored wakeup and waker so the cell can serve another
    /// request.
    ///
    /// Callers must have exclusive access to the node owning this cell (it is
    /// neither queued nor visible to any waiter).
    pub(crate) fn reset(&self) {
        self.waker.with_mut(|waker| {
            // Safety: exclusive access guaranteed by the caller.
            unsafe { *waker = None };
        });
        self.state.store(State::WAITING.bits(), Ordering::Release);
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: State, new: State, success: Ordering) -> Result<State, State> {
        self.state
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.fetch_or(state.bits(), order))
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.load(Ordering::Acquire))
    }
}

// Safety: `WaitCell` synchronizes all accesses through atomic operations
unsafe impl Send for WaitCell {}
// Safety: `WaitCell` synchronizes all accesses through atomic operations
unsafe impl Sync for WaitCell {}

impl core::fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::task::Poll;
    use futures::task::noop_waker;

    #[test]
    fn stored_wakeup_is_consumed() {
        let cell = WaitCell::new();
        cell.wake();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(()));
        // the stored wakeup is gone now
        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
    }

    #[test]
    fn wake_after_register() {
        let cell = WaitCell::new();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);

        cell.wake();
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(()));
    }

    #[test]
    fn reset_clears_stored_wakeup() {
        let cell = WaitCell::new();
        cell.wake();
        cell.reset();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
    }

    #[test]
    fn take_waker_defers_the_wakeup() {
        let cell = WaitCell::new();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);

        let taken = cell.take_waker();
        assert!(taken.is_some());
        // the cell already counts as woken even before the waker runs
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(()));
    }
}
