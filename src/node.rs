// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use core::fmt;
use core::ptr::{self, NonNull};

use mycelium_bitfield::{bitfield, enum_from_bits};

use crate::clock::Ticks;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{self, AtomicPtr, AtomicUsize, Ordering};
use crate::queue::WaitQueue;
use crate::wait_cell::WaitCell;

enum_from_bits! {
    /// What a queued waiter is asking for.
    #[derive(Debug, Eq, PartialEq)]
    pub(crate) enum Kind<u8> {
        /// The node is pooled and not attached to any request.
        Unset = 0b000,
        Read = 0b001,
        ReadUpgrade = 0b010,
        Write = 0b011,
        WriteUpgrade = 0b100,
    }
}

enum_from_bits! {
    /// Completion state of a waiter. `Pending` transitions to exactly one of
    /// the other states, decided by compare-and-swap.
    #[derive(Debug, Eq, PartialEq)]
    pub(crate) enum Phase<u8> {
        /// Still waiting; the only state transitions are allowed out of.
        Pending = 0b000,
        /// The lock was granted to this waiter.
        Acquired = 0b001,
        /// The waiter's deadline elapsed before the lock was granted.
        TimedOut = 0b010,
        /// The waiter's cancellation token fired.
        Cancelled = 0b011,
        /// The lock was disposed while the waiter was queued.
        Disposed = 0b100,
        /// The waiter raced back into the lock after enqueueing (or lost
        /// interest); the queue discards the node without consuming it.
        Deadborn = 0b101,
    }
}

bitfield! {
    /// A waiter's packed state word: the completion phase, the request kind,
    /// and the node's reuse generation, all updated through a single atomic
    /// so a phase transition can never tear against the kind it applies to.
    #[derive(Eq, PartialEq)]
    pub(crate) struct NodeState<usize> {
        const PHASE: Phase;
        const KIND: Kind;
        /// Incremented every time the node returns to the pool. A node whose
        /// generation saturates is retired to the allocator instead of
        /// recycled, bounding how long one allocation can keep cycling
        /// through the waiter machinery.
        const GENERATION = ..;
    }
}

/// Generations beyond this retire the node instead of recycling it.
const GENERATION_LIMIT: usize = 0xFFFF;

/// Result of [`Waiter::check_hold`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Hold {
    /// Still pending and within its deadline; may be granted the lock.
    Live,
    /// The deadline elapsed and this call completed the node as
    /// not-acquired; the caller must wake it.
    Expired,
    /// Already completed (cancelled, deadborn, disposed, or timed out by
    /// someone else); just drop the queue reference.
    Dead,
}

// === impl Kind ===

impl Kind {
    #[inline]
    pub(crate) fn is_write(self) -> bool {
        matches!(self, Kind::Write | Kind::WriteUpgrade)
    }

    #[inline]
    pub(crate) fn is_upgrade(self) -> bool {
        matches!(self, Kind::ReadUpgrade | Kind::WriteUpgrade)
    }
}

// === impl Waiter ===

/// A queued lock request.
///
/// Two references keep a `Waiter` alive: the *queue reference*, owned by
/// whichever queue (or dispatcher mid-scan) currently links the node, and the
/// *caller reference*, owned by the [`Acquire`] future that parks on it. The
/// reference count starts at 2 when a node is rented and never rises above
/// that; when it hits zero the node returns to its pool.
///
/// [`Acquire`]: crate::Acquire
pub(crate) struct Waiter {
    /// Queue link. Reused as the admission-batch link while the dispatcher
    /// owns the node, and as the shelf link is *not* needed (the shelf stores
    /// pointers directly).
    pub(crate) next: AtomicPtr<Waiter>,
    /// [`NodeState`] bits.
    state: AtomicUsize,
    refs: AtomicUsize,
    /// Absolute deadline in clock ticks; [`Ticks::MAX`] disables deadline
    /// checks. Written only while the node is unshared (just rented).
    deadline: UnsafeCell<Ticks>,
    /// The result channel: completing the node stores the outcome in
    /// [`NodeState::PHASE`] and wakes this cell.
    pub(crate) cell: WaitCell,
}

// Safety: all shared fields are accessed through atomics (or, for `deadline`,
// only written while unshared); `Waiter` is shared across threads by design.
unsafe impl Send for Waiter {}
// Safety: see above
unsafe impl Sync for Waiter {}

impl Waiter {
    fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicUsize::new(NodeState::new().0),
            refs: AtomicUsize::new(0),
            deadline: UnsafeCell::new(Ticks::MAX),
            cell: WaitCell::new(),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_bits(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn phase(&self) -> Phase {
        self.state().get(NodeState::PHASE)
    }

    #[inline]
    pub(crate) fn kind(&self) -> Kind {
        self.state().get(NodeState::KIND)
    }

    #[inline]
    pub(crate) fn deadline(&self) -> Ticks {
        self.deadline.with(|deadline| {
            // Safety: `deadline` is written only while the node is unshared;
            // every reader observed the node through a queue publication that
            // happened after the write.
            unsafe { *deadline }
        })
    }

    /// Whether a dequeued node may still be granted the lock.
    ///
    /// A node past its deadline is completed as not-acquired right here; the
    /// caller is responsible for waking an [`Hold::Expired`] node (so the
    /// dispatcher can defer the wakeup) and for releasing the queue reference
    /// of anything that is not [`Hold::Live`].
    pub(crate) fn check_hold(&self, now: Ticks) -> Hold {
        if self.phase() != Phase::Pending {
            return Hold::Dead;
        }
        if self.deadline() <= now {
            return match self.try_transition(Phase::TimedOut) {
                Ok(()) => Hold::Expired,
                Err(_) => Hold::Dead,
            };
        }
        Hold::Live
    }

    /// Attempts the one-shot `Pending -> to` transition.
    ///
    /// Exactly one of the grant, timeout, cancellation, disposal, and
    /// deadborn transitions wins; losers learn the winning phase.
    pub(crate) fn try_transition(&self, to: Phase) -> Result<(), Phase> {
        debug_assert_ne!(to, Phase::Pending);
        let mut cur = self.state();
        loop {
            let phase = cur.get(NodeState::PHASE);
            if phase != Phase::Pending {
                return Err(phase);
            }
            let next = cur.with(NodeState::PHASE, to);
            match self
                .state
                .compare_exchange(cur.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    tracing::trace!(node = ?core::ptr::from_ref(self), ?to, "node transitioned");
                    return Ok(());
                }
                Err(actual) => cur = NodeState::from_bits(actual),
            }
        }
    }

    /// Drops one of the node's two references, recycling the node once both
    /// are gone.
    pub(crate) fn release_ref(node: NonNull<Waiter>, pool: &NodePool) {
        // Safety: the caller owns one reference, so the node is alive.
        let prev = unsafe { node.as_ref() }.refs.fetch_sub(1, Ordering::Release);
        debug_assert!(prev >= 1);
        if prev == 1 {
            atomic::fence(Ordering::Acquire);
            pool.recycle(node);
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("phase", &self.phase())
            .field("kind", &self.kind())
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub(crate) fn alloc_node() -> NonNull<Waiter> {
    NonNull::from(Box::leak(Box::new(Waiter::new())))
}

/// # Safety
///
/// The pointer must have come from [`alloc_node`] and have no outstanding
/// references.
pub(crate) unsafe fn free_node(node: NonNull<Waiter>) {
    // Safety: ensured by caller
    drop(unsafe { Box::from_raw(node.as_ptr()) });
}

// === impl NodePool ===

/// Recycles waiter nodes.
///
/// The fast path is a single per-thread spare slot; the fallback is a shared
/// free list reusing the same lock-free [`WaitQueue`] the lock parks waiters
/// in: recycled nodes enqueue wait-free, and renting pops from the consumer
/// side, falling back to a fresh allocation when another renter holds it.
/// Overflowing the free list, or saturating a node's reuse generation, frees
/// the node instead.
pub(crate) struct NodePool {
    shelf: WaitQueue,
}

const SHELF_CAP: usize = 64;

#[cfg(all(feature = "std", not(loom)))]
mod spare {
    use super::{Waiter, free_node};
    use core::cell::Cell;
    use core::ptr::{self, NonNull};

    struct SpareSlot(Cell<*mut Waiter>);

    impl Drop for SpareSlot {
        fn drop(&mut self) {
            if let Some(node) = NonNull::new(self.0.get()) {
                // Safety: the slot exclusively owns the parked node.
                unsafe { free_node(node) };
            }
        }
    }

    std::thread_local! {
        static SPARE: SpareSlot = const { SpareSlot(Cell::new(ptr::null_mut())) };
    }

    pub(super) fn take() -> Option<NonNull<Waiter>> {
        SPARE
            .try_with(|slot| NonNull::new(slot.0.replace(ptr::null_mut())))
            .ok()
            .flatten()
    }

    /// Parks `node` in the current thread's slot; returns it back if the slot
    /// is occupied or the thread is shutting down.
    pub(super) fn put(node: NonNull<Waiter>) -> Option<NonNull<Waiter>> {
        match SPARE.try_with(|slot| {
            if slot.0.get().is_null() {
                slot.0.set(node.as_ptr());
                None
            } else {
                Some(node)
            }
        }) {
            Ok(res) => res,
            Err(_) => Some(node),
        }
    }
}

#[cfg(not(all(feature = "std", not(loom))))]
mod spare {
    use super::Waiter;
    use core::ptr::NonNull;

    pub(super) fn take() -> Option<NonNull<Waiter>> {
        None
    }

    pub(super) fn put(node: NonNull<Waiter>) -> Option<NonNull<Waiter>> {
        Some(node)
    }
}

impl NodePool {
    pub(crate) fn new() -> Self {
        Self {
            shelf: WaitQueue::new(),
        }
    }

    /// Rents a node for a new request. The returned node is pending, carries
    /// `kind` and `deadline`, and holds both the queue and the caller
    /// reference.
    pub(crate) fn rent(&self, kind: Kind, deadline: Ticks) -> NonNull<Waiter> {
        let node = spare::take()
            .or_else(|| {
                self.shelf
                    .try_consume()
                    .and_then(|consumer| consumer.dequeue())
            })
            .unwrap_or_else(alloc_node);

        // Safety: the node just left the pool; we are its only owner.
        let waiter = unsafe { node.as_ref() };
        let generation = waiter.state().get(NodeState::GENERATION);
        waiter.state.store(
            NodeState::new()
                .with(NodeState::PHASE, Phase::Pending)
                .with(NodeState::KIND, kind)
                .with(NodeState::GENERATION, generation)
                .0,
            Ordering::Relaxed,
        );
        waiter.refs.store(2, Ordering::Relaxed);
        waiter.deadline.with_mut(|slot| {
            // Safety: unshared, see above.
            unsafe { *slot = deadline };
        });
        waiter.next.store(ptr::null_mut(), Ordering::Relaxed);

        node
    }

    /// Returns a node whose references are all gone to the pool, bumping its
    /// generation. Saturated nodes and shelf overflow go back to the
    /// allocator.
    pub(crate) fn recycle(&self, node: NonNull<Waiter>) {
        // Safety: refcount reached zero, we are the only owner.
        let waiter = unsafe { node.as_ref() };
        debug_assert_eq!(waiter.refs.load(Ordering::Relaxed), 0);

        let generation = waiter.state().get(NodeState::GENERATION);
        if generation >= GENERATION_LIMIT {
            // Safety: sole owner.
            unsafe { free_node(node) };
            return;
        }

        waiter.state.store(
            NodeState::new()
                .with(NodeState::KIND, Kind::Unset)
                .with(NodeState::GENERATION, generation + 1)
                .0,
            Ordering::Relaxed,
        );
        waiter.cell.reset();
        waiter.next.store(ptr::null_mut(), Ordering::Relaxed);

        let Some(node) = spare::put(node) else { return };

        if self.shelf.len() < SHELF_CAP && self.shelf.reserve_slot() {
            self.shelf.enqueue(node);
        } else {
            // Safety: sole owner.
            unsafe { free_node(node) };
        }
    }
}

impl fmt::Debug for NodePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("shelved", &self.shelf.len())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn transition_is_one_shot() {
        let pool = NodePool::new();
        let node = pool.rent(Kind::Read, Ticks::MAX);
        // Safety: test owns the node.
        let waiter = unsafe { node.as_ref() };

        assert_eq!(waiter.phase(), Phase::Pending);
        assert_eq!(waiter.kind(), Kind::Read);

        assert!(waiter.try_transition(Phase::Acquired).is_ok());
        assert_eq!(
            waiter.try_transition(Phase::Cancelled),
            Err(Phase::Acquired)
        );
        assert_eq!(waiter.phase(), Phase::Acquired);

        Waiter::release_ref(node, &pool);
        Waiter::release_ref(node, &pool);
    }

    #[test]
    fn recycling_bumps_the_generation() {
        let pool = NodePool::new();

        let node = pool.rent(Kind::Write, 10);
        // Safety: test owns the node.
        let first_gen = unsafe { node.as_ref() }.state().get(NodeState::GENERATION);
        Waiter::release_ref(node, &pool);
        Waiter::release_ref(node, &pool);

        let node = pool.rent(Kind::Read, Ticks::MAX);
        // Safety: test owns the node.
        let waiter = unsafe { node.as_ref() };
        assert_eq!(waiter.state().get(NodeState::GENERATION), first_gen + 1);
        assert_eq!(waiter.kind(), Kind::Read);
        assert_eq!(waiter.phase(), Phase::Pending);
        assert_eq!(waiter.deadline(), Ticks::MAX);
        Waiter::release_ref(node, &pool);
        Waiter::release_ref(node, &pool);
    }

    #[test]
    fn deadline_elapse_completes_at_dequeue_time() {
        let pool = NodePool::new();
        let node = pool.rent(Kind::Read, 5);
        // Safety: test owns the node.
        let waiter = unsafe { node.as_ref() };

        assert_eq!(waiter.check_hold(4), Hold::Live);
        assert_eq!(waiter.check_hold(5), Hold::Expired);
        assert_eq!(waiter.phase(), Phase::TimedOut);
        // dead stays dead
        assert_eq!(waiter.check_hold(0), Hold::Dead);

        Waiter::release_ref(node, &pool);
        Waiter::release_ref(node, &pool);
    }
}
