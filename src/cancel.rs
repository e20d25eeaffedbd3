// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;
use core::fmt;
use core::task::Waker;

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::mutex::Mutex;

/// The firing side of a cancellation pair.
///
/// A `CancelSource` hands out any number of [`CancelToken`]s; [`cancel`]ing
/// the source wakes every lock request waiting with one of those tokens, and
/// each such request resolves with [`AcquireError::Cancelled`].
///
/// [`cancel`]: Self::cancel
/// [`AcquireError::Cancelled`]: crate::AcquireError::Cancelled
pub struct CancelSource {
    shared: Arc<Shared>,
}

/// Observer half of a [`CancelSource`], passed into the `enter_*` operations.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

struct Shared {
    fired: AtomicBool,
    subscribers: Mutex<Subscribers>,
}

struct Subscribers {
    next_id: u64,
    wakers: Vec<(u64, Waker)>,
}

// === impl CancelSource ===

impl CancelSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                fired: AtomicBool::new(false),
                subscribers: Mutex::new(Subscribers {
                    next_id: 0,
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: self.shared.clone(),
        }
    }

    /// Fires the cancellation, waking every subscribed waiter.
    ///
    /// Firing is idempotent; only the first call wakes anyone.
    #[tracing::instrument(skip(self))]
    pub fn cancel(&self) {
        if self.shared.fired.swap(true, Ordering::SeqCst) {
            return;
        }

        // Take the subscriber list while holding the lock, wake outside it.
        let wakers = {
            let mut subs = self.shared.subscribers.lock();
            core::mem::take(&mut subs.wakers)
        };
        tracing::debug!(subscribers = wakers.len(), "cancellation fired");
        for (_, waker) in wakers {
            waker.wake();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.fired.load(Ordering::SeqCst)
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("fired", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

// === impl CancelToken ===

impl CancelToken {
    /// Returns `true` once the owning [`CancelSource`] has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.fired.load(Ordering::SeqCst)
    }

    /// Registers `waker` to be woken when the source fires, updating the
    /// existing registration if `id` already holds one.
    ///
    /// Returns `true` if the source has already fired, in which case nothing
    /// is registered and the caller should observe the cancellation
    /// immediately.
    pub(crate) fn subscribe(&self, id: &mut Option<u64>, waker: &Waker) -> bool {
        let mut subs = self.shared.subscribers.lock();
        if self.shared.fired.load(Ordering::SeqCst) {
            return true;
        }

        match *id {
            Some(id) => {
                if let Some(entry) = subs.wakers.iter_mut().find(|(eid, _)| *eid == id) {
                    if !entry.1.will_wake(waker) {
                        entry.1 = waker.clone();
                    }
                } else {
                    subs.wakers.push((id, waker.clone()));
                }
            }
            None => {
                let new_id = subs.next_id;
                subs.next_id += 1;
                subs.wakers.push((new_id, waker.clone()));
                *id = Some(new_id);
            }
        }

        false
    }

    /// Drops the registration made under `id`, if any.
    pub(crate) fn unsubscribe(&self, id: Option<u64>) {
        let Some(id) = id else { return };
        let mut subs = self.shared.subscribers.lock();
        if let Some(pos) = subs.wakers.iter().position(|(eid, _)| *eid == id) {
            subs.wakers.swap_remove(pos);
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("fired", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn fires_once() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        source.cancel();
        assert!(token.is_cancelled());
        assert!(source.is_cancelled());

        // idempotent
        source.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn late_subscription_reports_fired() {
        let source = CancelSource::new();
        let token = source.token();
        source.cancel();

        let waker = noop_waker();
        let mut id = None;
        assert!(token.subscribe(&mut id, &waker));
        assert!(id.is_none());
    }

    #[test]
    fn subscription_is_updated_in_place() {
        let source = CancelSource::new();
        let token = source.token();

        let waker = noop_waker();
        let mut id = None;
        assert!(!token.subscribe(&mut id, &waker));
        let first = id;
        assert!(!token.subscribe(&mut id, &waker));
        assert_eq!(first, id);
        assert_eq!(source.shared.subscribers.lock().wakers.len(), 1);

        token.unsubscribe(id);
        assert!(source.shared.subscribers.lock().wakers.is_empty());
    }
}
