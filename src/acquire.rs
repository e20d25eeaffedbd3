// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll};

use pin_project::{pin_project, pinned_drop};

use crate::cancel::CancelToken;
use crate::clock::Ticks;
use crate::error::AcquireError;
use crate::node::{Kind, NodePool, Phase, Waiter};
use crate::raw::{BeginWait, RawRwLock, Timeout};

/// Future returned by the `enter_*` operations on [`RawRwLock`].
///
/// Resolves `Ok(true)` when the lock was entered, `Ok(false)` when the
/// timeout elapsed first, and [`Err`]`(`[`AcquireError`]`)` on cancellation,
/// queue overflow or disposal. The future is fused: once resolved it keeps
/// returning the same result.
///
/// # Cancellation
///
/// Dropping an unresolved `Acquire` abandons the request: its queued node is
/// marked dead and later discarded by a dispatcher or the vacuum scan. If the
/// grant raced ahead of the drop, the grant is released again, so a dropped
/// future never leaks a hold.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Acquire<'lock> {
    lock: &'lock RawRwLock,
    kind: Kind,
    timeout: Timeout,
    cancel: Option<CancelToken>,
    cancel_id: Option<u64>,
    deadline: Ticks,
    node: Option<NonNull<Waiter>>,
    done: Option<Result<bool, AcquireError>>,
}

// Safety: the node pointer is only dereferenced while the future holds the
// caller reference keeping it alive; everything else is `Send`.
unsafe impl Send for Acquire<'_> {}
// Safety: `poll` requires `&mut self`; shared references expose nothing.
unsafe impl Sync for Acquire<'_> {}

// === impl Acquire ===

impl<'lock> Acquire<'lock> {
    pub(crate) fn new(
        lock: &'lock RawRwLock,
        kind: Kind,
        timeout: Timeout,
        cancel: Option<CancelToken>,
    ) -> Self {
        Self {
            lock,
            kind,
            timeout,
            cancel,
            cancel_id: None,
            deadline: Ticks::MAX,
            node: None,
            done: None,
        }
    }
}

/// Resolves the future: detach from the cancellation token, drop the caller
/// reference and remember the result for fused re-polls.
fn finish_waiting(
    pool: &NodePool,
    node: NonNull<Waiter>,
    cancel: &Option<CancelToken>,
    cancel_id: &mut Option<u64>,
    node_slot: &mut Option<NonNull<Waiter>>,
    done: &mut Option<Result<bool, AcquireError>>,
    res: Result<bool, AcquireError>,
) -> Poll<Result<bool, AcquireError>> {
    if let Some(token) = cancel {
        token.unsubscribe(cancel_id.take());
    }
    *node_slot = None;
    Waiter::release_ref(node, pool);
    *done = Some(res);
    Poll::Ready(res)
}

impl Future for Acquire<'_> {
    type Output = Result<bool, AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Some(res) = *this.done {
            return Poll::Ready(res);
        }

        if this.node.is_none() {
            // first poll: cheap exits, then the fast path, then enqueue
            if let Some(token) = this.cancel.as_ref() {
                if token.is_cancelled() {
                    *this.done = Some(Err(AcquireError::Cancelled));
                    return Poll::Ready(Err(AcquireError::Cancelled));
                }
            }
            if this.lock.is_disposed() {
                *this.done = Some(Err(AcquireError::Disposed));
                return Poll::Ready(Err(AcquireError::Disposed));
            }
            if this.lock.try_fast(*this.kind) {
                *this.done = Some(Ok(true));
                return Poll::Ready(Ok(true));
            }
            if *this.timeout == Timeout::Immediate {
                *this.done = Some(Ok(false));
                return Poll::Ready(Ok(false));
            }
            *this.deadline = match this.lock.deadline_for(*this.timeout) {
                Ok(deadline) => deadline,
                Err(err) => {
                    *this.done = Some(Err(err));
                    return Poll::Ready(Err(err));
                }
            };
            this.lock.maybe_vacuum();
            match this.lock.begin_wait(*this.kind, *this.deadline) {
                Err(err) => {
                    *this.done = Some(Err(err));
                    return Poll::Ready(Err(err));
                }
                Ok(BeginWait::Acquired) => {
                    *this.done = Some(Ok(true));
                    return Poll::Ready(Ok(true));
                }
                Ok(BeginWait::Queued(node)) => {
                    *this.node = Some(node);
                }
            }
        }

        let node = this.node.expect("queued node present while pending");
        // Safety: the caller reference keeps the node alive for the lifetime
        // of this future.
        let waiter = unsafe { node.as_ref() };
        loop {
            if let Some(token) = this.cancel.as_ref() {
                if token.is_cancelled() {
                    let res = match waiter.try_transition(Phase::Cancelled) {
                        Ok(()) => Err(AcquireError::Cancelled),
                        Err(Phase::Acquired) => {
                            // the grant raced ahead of the cancellation; give
                            // it back and still report cancelled
                            this.lock.exit_kind(*this.kind);
                            Err(AcquireError::Cancelled)
                        }
                        Err(Phase::TimedOut) => Ok(false),
                        Err(Phase::Disposed) => Err(AcquireError::Disposed),
                        Err(_) => Err(AcquireError::Cancelled),
                    };
                    return finish_waiting(
                        this.lock.pool(),
                        node,
                        this.cancel,
                        this.cancel_id,
                        this.node,
                        this.done,
                        res,
                    );
                }
            }

            match waiter.phase() {
                Phase::Pending => {
                    // the waiter side of the deadline check; dispatchers and
                    // the vacuum scan check it independently
                    if *this.deadline != Ticks::MAX && this.lock.has_clock() {
                        let now = this.lock.now();
                        if now >= *this.deadline {
                            match waiter.try_transition(Phase::TimedOut) {
                                Ok(()) => {
                                    return finish_waiting(
                                        this.lock.pool(),
                                        node,
                                        this.cancel,
                                        this.cancel_id,
                                        this.node,
                                        this.done,
                                        Ok(false),
                                    );
                                }
                                Err(_) => continue,
                            }
                        }
                    }
                    if let Some(token) = this.cancel.as_ref() {
                        if token.subscribe(this.cancel_id, cx.waker()) {
                            // fired while we were registering
                            continue;
                        }
                    }
                    match waiter.cell.poll_wait(cx) {
                        Poll::Ready(()) => continue,
                        Poll::Pending => {
                            // the completion may have slipped in before our
                            // waker was parked
                            if waiter.phase() != Phase::Pending {
                                continue;
                            }
                            return Poll::Pending;
                        }
                    }
                }
                Phase::Acquired => {
                    return finish_waiting(
                        this.lock.pool(),
                        node,
                        this.cancel,
                        this.cancel_id,
                        this.node,
                        this.done,
                        Ok(true),
                    );
                }
                Phase::TimedOut => {
                    return finish_waiting(
                        this.lock.pool(),
                        node,
                        this.cancel,
                        this.cancel_id,
                        this.node,
                        this.done,
                        Ok(false),
                    );
                }
                Phase::Cancelled => {
                    return finish_waiting(
                        this.lock.pool(),
                        node,
                        this.cancel,
                        this.cancel_id,
                        this.node,
                        this.done,
                        Err(AcquireError::Cancelled),
                    );
                }
                Phase::Disposed => {
                    return finish_waiting(
                        this.lock.pool(),
                        node,
                        this.cancel,
                        this.cancel_id,
                        this.node,
                        this.done,
                        Err(AcquireError::Disposed),
                    );
                }
                Phase::Deadborn => {
                    unreachable!("deadborn nodes are never owned by a live future")
                }
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for Acquire<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        let Some(node) = this.node.take() else {
            return;
        };
        // Safety: we still hold the caller reference.
        let waiter = unsafe { node.as_ref() };
        match waiter.try_transition(Phase::Deadborn) {
            Ok(()) => {}
            Err(Phase::Acquired) => {
                // granted but nobody is listening anymore; release the hold
                this.lock.exit_kind(*this.kind);
            }
            Err(_) => {}
        }
        if let Some(token) = this.cancel.as_ref() {
            token.unsubscribe(this.cancel_id.take());
        }
        Waiter::release_ref(node, this.lock.pool());
    }
}

impl fmt::Debug for Acquire<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquire")
            .field("kind", &self.kind)
            .field("timeout", &self.timeout)
            .field("queued", &self.node.is_some())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
