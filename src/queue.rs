// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::{self, NonNull};

use crate::backoff::Backoff;
use crate::clock::Ticks;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crate::node::{Hold, Waiter, alloc_node, free_node};
use crate::state::MAX_SHARED;
use crate::util::{CachePadded, non_null};

/// A lock-free FIFO of [`Waiter`] nodes, implemented as an intrusive
/// singly-linked list based on [Dmitry Vyukov's intrusive MPSC][vyukov].
///
/// Producers (contended acquirers, and the dispatcher putting back a write it
/// cannot admit yet) enqueue wait-free with one atomic swap and one store.
/// Consumption is serialized through the `has_consumer` flag: the release
/// dispatcher, the vacuum scan, and the dispose drain each claim the flag
/// while they walk the list, which also makes node reclamation safe without
/// deferred-reclamation machinery.
///
/// The `len` counter is approximate. It exists to cap how many waiters a
/// queue accepts and to bound dispatcher scans; it plays no role in the
/// queue's correctness.
///
/// The node pool reuses this type as its lock-free free list.
///
/// [vyukov]: http://www.1024cores.net/home/lock-free-algorithms/queues/intrusive-mpsc-node-based-queue
pub(crate) struct WaitQueue {
    /// The producer end. Enqueues swap this pointer.
    head: CachePadded<AtomicPtr<Waiter>>,
    /// The consumer end. Only the `has_consumer` holder touches this.
    tail: CachePadded<UnsafeCell<*mut Waiter>>,
    has_consumer: CachePadded<AtomicBool>,
    len: CachePadded<AtomicUsize>,
    stub: NonNull<Waiter>,
}

// Safety: shared fields are atomics; `tail` is guarded by `has_consumer`.
unsafe impl Send for WaitQueue {}
// Safety: see above
unsafe impl Sync for WaitQueue {}

/// Errors returned by [`Consumer::try_dequeue`].
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum TryDequeueError {
    /// No element was dequeued because the queue was empty.
    Empty,
    /// A producer is mid-enqueue; the queue is in its transient inconsistent
    /// state and the consumer must briefly back off.
    Inconsistent,
}

/// Exclusive permission to consume from a [`WaitQueue`].
pub(crate) struct Consumer<'q> {
    q: &'q WaitQueue,
}

// === impl WaitQueue ===

impl WaitQueue {
    pub(crate) fn new() -> Self {
        let stub = alloc_node();
        Self {
            head: CachePadded(AtomicPtr::new(stub.as_ptr())),
            tail: CachePadded(UnsafeCell::new(stub.as_ptr())),
            has_consumer: CachePadded(AtomicBool::new(false)),
            len: CachePadded(AtomicUsize::new(0)),
            stub,
        }
    }

    /// Claims a waiter slot against the queue's cap. Must be called before
    /// [`enqueue`](Self::enqueue); a `false` return means the queue is full
    /// and the request must fail with an overflow error.
    pub(crate) fn reserve_slot(&self) -> bool {
        let prev = self.len.fetch_add(1, Ordering::Relaxed);
        if prev >= MAX_SHARED {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Re-claims a slot for a node the dispatcher puts back, bypassing the
    /// cap (the node held a slot moments ago).
    fn reoccupy_slot(&self) {
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue at the tail of the FIFO. Wait-free; never fails.
    pub(crate) fn enqueue(&self, node: NonNull<Waiter>) {
        // Safety: the caller transfers the queue reference to us, the node is
        // alive.
        unsafe { node.as_ref() }
            .next
            .store(ptr::null_mut(), Ordering::Relaxed);

        let prev = self.head.swap(node.as_ptr(), Ordering::AcqRel);
        // Safety: `prev` is never null thanks to the stub node, and the node
        // it points to is owned by the queue.
        unsafe {
            (*prev).next.store(node.as_ptr(), Ordering::Release);
        }
    }

    /// Puts a dequeued node back at the tail of the FIFO, restoring its
    /// counter slot.
    pub(crate) fn requeue(&self, node: NonNull<Waiter>) {
        self.reoccupy_slot();
        self.enqueue(node);
    }

    /// Claims the consumer side, spinning while another consumer holds it.
    pub(crate) fn consume(&self) -> Consumer<'_> {
        let mut boff = Backoff::new();
        while self
            .has_consumer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            while self.has_consumer.load(Ordering::Relaxed) {
                boff.spin();
            }
        }
        Consumer { q: self }
    }

    /// Claims the consumer side, or returns `None` when another consumer
    /// holds it. The vacuum scan uses this so it never delays a dispatcher.
    pub(crate) fn try_consume(&self) -> Option<Consumer<'_>> {
        self.has_consumer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Consumer { q: self })
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // Having `&mut self` means no producer or consumer is left; walk the
        // chain from the consumer end and free everything, stub included.
        let mut current = self.tail.with_mut(|tail| {
            // Safety: exclusive access.
            unsafe { *tail }
        });
        while let Some(node) = NonNull::new(current) {
            // Safety: nodes linked into the queue are owned by it; at drop
            // time the queue reference is the only one left.
            unsafe {
                let next = node.as_ref().next.load(Ordering::Relaxed);
                free_node(node);
                current = next;
            }
        }
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("len", &self.len())
            .field("has_consumer", &self.has_consumer.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

// === impl Consumer ===

impl Consumer<'_> {
    /// Try to dequeue the node at the front of the FIFO.
    ///
    /// The returned node carries its queue reference; the caller must either
    /// complete-and-release it, requeue it, or release it as dead.
    pub(crate) fn try_dequeue(&self) -> Result<NonNull<Waiter>, TryDequeueError> {
        let q = self.q;
        q.tail.with_mut(|tail| {
            // Safety: holding the consumer flag makes us the only one
            // touching `tail`, and every pointer reachable from it is owned
            // by the queue.
            unsafe {
                let mut tail_node = non_null(*tail);
                let mut next = tail_node.as_ref().next.load(Ordering::Acquire);

                if tail_node == q.stub {
                    let Some(next_node) = NonNull::new(next) else {
                        return Err(TryDequeueError::Empty);
                    };
                    *tail = next;
                    tail_node = next_node;
                    next = next_node.as_ref().next.load(Ordering::Acquire);
                }

                if !next.is_null() {
                    *tail = next;
                    q.len.fetch_sub(1, Ordering::Relaxed);
                    return Ok(tail_node);
                }

                let head = q.head.load(Ordering::Acquire);
                if tail_node.as_ptr() != head {
                    return Err(TryDequeueError::Inconsistent);
                }

                // The queue holds a single element; push the stub behind it so
                // the element's removal leaves the list non-empty.
                q.stub
                    .as_ref()
                    .next
                    .store(ptr::null_mut(), Ordering::Relaxed);
                let prev = q.head.swap(q.stub.as_ptr(), Ordering::AcqRel);
                (*prev).next.store(q.stub.as_ptr(), Ordering::Release);

                next = tail_node.as_ref().next.load(Ordering::Acquire);
                if next.is_null() {
                    return Err(TryDequeueError::Empty);
                }

                *tail = next;
                q.len.fetch_sub(1, Ordering::Relaxed);
                Ok(tail_node)
            }
        })
    }

    /// Dequeue the node at the front of the FIFO, spinning through the
    /// transient inconsistent state. Returns `None` when the queue is empty.
    pub(crate) fn dequeue(&self) -> Option<NonNull<Waiter>> {
        let mut boff = Backoff::new();
        loop {
            match self.try_dequeue() {
                Ok(node) => return Some(node),
                Err(TryDequeueError::Empty) => return None,
                Err(TryDequeueError::Inconsistent) => boff.spin(),
            }
        }
    }

    /// Walks the queue and unlinks dead interior nodes: waiters whose
    /// deadline has elapsed (completed as not-acquired here) and waiters that
    /// are no longer pending (cancelled, deadborn, disposed).
    ///
    /// Only nodes whose successor is already linked are spliced out; the node
    /// at the producer end may gain a successor at any moment and is left for
    /// a later pass. Each unlinked node is handed to `on_unlinked`, which
    /// must release its queue reference.
    pub(crate) fn vacuum(&self, now: Ticks, mut on_unlinked: impl FnMut(NonNull<Waiter>)) {
        let q = self.q;
        q.tail.with_mut(|tail| {
            // Safety: the consumer flag serializes us against dequeues and
            // other vacuums; interior nodes cannot be reclaimed under us.
            unsafe {
                let mut prev = non_null(*tail);
                loop {
                    let Some(node) = NonNull::new(prev.as_ref().next.load(Ordering::Acquire))
                    else {
                        return;
                    };
                    let next = node.as_ref().next.load(Ordering::Acquire);
                    if next.is_null() {
                        // producer end, a successor may still be linked
                        return;
                    }
                    let hold = if node == q.stub {
                        Hold::Live
                    } else {
                        node.as_ref().check_hold(now)
                    };
                    match hold {
                        Hold::Live => prev = node,
                        Hold::Expired | Hold::Dead => {
                            prev.as_ref().next.store(next, Ordering::Release);
                            q.len.fetch_sub(1, Ordering::Relaxed);
                            tracing::trace!(node = ?node, "vacuumed dead waiter");
                            if hold == Hold::Expired {
                                node.as_ref().cell.wake();
                            }
                            on_unlinked(node);
                        }
                    }
                }
            }
        });
    }
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        self.q.has_consumer.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Consumer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("q", &self.q).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::node::{Kind, NodePool, Phase};

    fn rent(pool: &NodePool, kind: Kind, deadline: Ticks) -> NonNull<Waiter> {
        pool.rent(kind, deadline)
    }

    fn release_both(pool: &NodePool, node: NonNull<Waiter>) {
        Waiter::release_ref(node, pool);
        Waiter::release_ref(node, pool);
    }

    #[test]
    fn fifo_order() {
        let pool = NodePool::new();
        let q = WaitQueue::new();

        let a = rent(&pool, Kind::Read, Ticks::MAX);
        let b = rent(&pool, Kind::Write, Ticks::MAX);
        let c = rent(&pool, Kind::Read, Ticks::MAX);

        assert!(q.reserve_slot());
        q.enqueue(a);
        assert!(q.reserve_slot());
        q.enqueue(b);
        assert!(q.reserve_slot());
        q.enqueue(c);
        assert_eq!(q.len(), 3);

        let consumer = q.consume();
        assert_eq!(consumer.dequeue(), Some(a));
        assert_eq!(consumer.dequeue(), Some(b));
        assert_eq!(consumer.dequeue(), Some(c));
        assert_eq!(consumer.dequeue(), None);
        assert_eq!(q.len(), 0);

        for node in [a, b, c] {
            release_both(&pool, node);
        }
    }

    #[test]
    fn single_consumer_at_a_time() {
        let q = WaitQueue::new();
        let first = q.try_consume();
        assert!(first.is_some());
        assert!(q.try_consume().is_none());
        drop(first);
        assert!(q.try_consume().is_some());
    }

    #[test]
    fn requeue_preserves_the_slot() {
        let pool = NodePool::new();
        let q = WaitQueue::new();

        let a = rent(&pool, Kind::Write, Ticks::MAX);
        assert!(q.reserve_slot());
        q.enqueue(a);

        let consumer = q.consume();
        let node = consumer.dequeue().unwrap();
        assert_eq!(q.len(), 0);
        q.requeue(node);
        assert_eq!(q.len(), 1);
        assert_eq!(consumer.dequeue(), Some(a));
        drop(consumer);

        release_both(&pool, a);
    }

    #[test]
    fn vacuum_splices_dead_interior_nodes() {
        let pool = NodePool::new();
        let q = WaitQueue::new();

        let a = rent(&pool, Kind::Read, Ticks::MAX);
        let b = rent(&pool, Kind::Read, 10);
        let c = rent(&pool, Kind::Read, Ticks::MAX);
        for node in [a, b, c] {
            assert!(q.reserve_slot());
            q.enqueue(node);
        }

        // `b` expires, `c` is abandoned by its caller
        // Safety: test owns the nodes.
        unsafe { c.as_ref() }
            .try_transition(Phase::Deadborn)
            .unwrap();

        let mut unlinked = std::vec::Vec::new();
        let consumer = q.consume();
        consumer.vacuum(20, |node| unlinked.push(node));

        // `b` timed out and was spliced; `c` sits at the producer end and is
        // left for the dispatcher
        assert_eq!(unlinked, [b]);
        // Safety: test owns the node.
        assert_eq!(unsafe { b.as_ref() }.phase(), Phase::TimedOut);
        assert_eq!(q.len(), 2);

        assert_eq!(consumer.dequeue(), Some(a));
        assert_eq!(consumer.dequeue(), Some(c));
        assert_eq!(consumer.dequeue(), None);
        drop(consumer);

        for node in [a, b, c] {
            release_both(&pool, node);
        }
    }

    #[test]
    fn slot_cap_rejects_overflow() {
        let q = WaitQueue::new();
        q.len.store(MAX_SHARED, Ordering::Relaxed);
        assert!(!q.reserve_slot());
        assert_eq!(q.len(), MAX_SHARED);
        q.len.store(0, Ordering::Relaxed);
        assert!(q.reserve_slot());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn drop_frees_queued_nodes() {
        let pool = NodePool::new();
        let q = WaitQueue::new();
        for _ in 0..3 {
            let node = rent(&pool, Kind::Read, Ticks::MAX);
            // drop the caller reference up front; the queue keeps its own
            Waiter::release_ref(node, &pool);
            assert!(q.reserve_slot());
            q.enqueue(node);
        }
        drop(q);
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::{model, thread};
    use crate::node::{Kind, NodePool};

    #[test]
    fn concurrent_enqueue_fifo_per_producer() {
        model(|| {
            let pool = Arc::new(NodePool::new());
            let q = Arc::new(WaitQueue::new());

            let producers: std::vec::Vec<_> = (0..2)
                .map(|_| {
                    let pool = pool.clone();
                    let q = q.clone();
                    thread::spawn(move || {
                        let node = pool.rent(Kind::Read, Ticks::MAX);
                        assert!(q.reserve_slot());
                        q.enqueue(node);
                    })
                })
                .collect();

            for p in producers {
                p.join().unwrap();
            }

            let consumer = q.consume();
            let mut seen = 0;
            while let Some(node) = consumer.dequeue() {
                seen += 1;
                Waiter::release_ref(node, &pool);
                Waiter::release_ref(node, &pool);
            }
            assert_eq!(seen, 2);
        });
    }
}
