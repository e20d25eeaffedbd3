// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cmp;
use core::fmt;
use core::ptr::NonNull;
use core::task::Waker;
use core::time::Duration;

use arrayvec::ArrayVec;

use crate::acquire::Acquire;
use crate::backoff::Backoff;
use crate::cancel::CancelToken;
use crate::clock::{Clock, Ticks};
use crate::error::{AcquireError, OptionsError};
use crate::loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crate::node::{Hold, Kind, NodePool, Phase, Waiter};
use crate::queue::{TryDequeueError, WaitQueue};
use crate::state::{LockState, UPGRADE, WRITE};
use crate::util::CachePadded;

/// How long an `enter_*` operation may wait for the lock.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timeout {
    /// Pure fast path: never enqueue, resolve `Ok(false)` on contention.
    Immediate,
    /// Wait up to the given duration, measured on the lock's clock.
    After(Duration),
    /// Wait until the lock is granted (or the request fails).
    Never,
}

/// Which waiter kinds are routed to the elevated (priority) queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Elevation {
    /// A single FIFO for all waiters.
    Fair,
    /// Queued read and read-upgrade requests take priority over writes.
    Reads,
    /// Queued write and write-upgrade requests take priority over reads.
    Writes,
}

/// Construction-time configuration of a [`RawRwLock`].
#[derive(Debug)]
pub struct Options {
    elevation: Elevation,
    vacuum_interval: Option<Duration>,
    deferred_wakeups: bool,
    clock: Option<Clock>,
}

// === impl Options ===

impl Options {
    /// Default options: fair queueing, no vacuum pacing, inline wakeups and,
    /// with the `std` feature, the standard-library clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            elevation: Elevation::Fair,
            vacuum_interval: None,
            deferred_wakeups: false,
            #[cfg(feature = "std")]
            clock: Some(crate::clock::StdClock::new()),
            #[cfg(not(feature = "std"))]
            clock: None,
        }
    }

    #[must_use]
    pub fn elevation(mut self, elevation: Elevation) -> Self {
        self.elevation = elevation;
        self
    }

    /// Pace the opportunistic vacuum pass: contended acquires run a pass when
    /// at least `interval` has elapsed since the previous one. Must be
    /// nonzero.
    #[must_use]
    pub fn vacuum_interval(mut self, interval: Duration) -> Self {
        self.vacuum_interval = Some(interval);
        self
    }

    /// Collect wakeups produced while the release dispatcher runs and flush
    /// them in batches after the new lock state is published, instead of
    /// waking each task inline.
    #[must_use]
    pub fn deferred_wakeups(mut self, deferred: bool) -> Self {
        self.deferred_wakeups = deferred;
        self
    }

    /// The time source for deadlines and vacuum pacing.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    fn validate(&self) -> Result<(), OptionsError> {
        if let Some(interval) = self.vacuum_interval {
            if interval.is_zero() {
                return Err(OptionsError::ZeroVacuumInterval);
            }
            if self.clock.is_none() {
                return Err(OptionsError::VacuumWithoutClock);
            }
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

/// The lock state machine: a reader-writer lock with upgradable readers and
/// two lock-free waiter queues, usable from async tasks and (through
/// [`blocking`]) from threads.
///
/// `RawRwLock` hands out no guards; it is the raw `enter`/`exit` surface that
/// [`RwLock`] and [`blocking::RwLock`] build on. Callers are responsible for
/// pairing every successful enter with the matching exit.
///
/// All lock state lives in a single atomic word ([`LockState`]); contended
/// requests park on pooled waiter nodes in one of two queues, and whichever
/// holder releases last redistributes the lock to queued waiters.
///
/// [`RwLock`]: crate::RwLock
/// [`blocking`]: crate::blocking
/// [`blocking::RwLock`]: crate::blocking::RwLock
pub struct RawRwLock {
    state: CachePadded<AtomicUsize>,
    default_queue: WaitQueue,
    elevated_queue: WaitQueue,
    pool: NodePool,
    disposed: AtomicBool,
    last_vacuum: AtomicU64,
    vacuum_interval: Option<Ticks>,
    elevation: Elevation,
    deferred_wakeups: bool,
    clock: Option<Clock>,
}

/// State the release dispatcher accumulates across its retries: the batch of
/// readers picked for admission (chained through the nodes' `next` links),
/// whether that batch contains an upgradable reader, and whether a queue was
/// observed non-empty at the point the scan stopped.
struct DispatchState {
    batch_head: *mut Waiter,
    batch_len: usize,
    upgrade_in_batch: bool,
    queue_remaining: bool,
}

impl DispatchState {
    const fn new() -> Self {
        Self {
            batch_head: core::ptr::null_mut(),
            batch_len: 0,
            upgrade_in_batch: false,
            queue_remaining: false,
        }
    }

    fn push(&mut self, node: NonNull<Waiter>) {
        // Safety: the batch owns the node's queue reference; `next` is unused
        // while the node is out of the queue.
        unsafe {
            node.as_ref().next.store(self.batch_head, Ordering::Relaxed);
        }
        self.batch_head = node.as_ptr();
        self.batch_len += 1;
    }
}

/// How many deferred wakeups accumulate before the dispatcher flushes
/// mid-pass anyway.
const DEFERRED_WAKEUPS: usize = 32;

/// The completion side of the dispatcher: applies a waiter's one-shot
/// `Pending -> outcome` transition and delivers the resulting wakeup.
///
/// With [`Options::deferred_wakeups`] set, wakers are pulled out of the
/// waiters' cells and held here until [`flush`](Self::flush), which runs
/// after the post-admission word is published, keeping task wakeups out of
/// the dispatcher's CAS loops. Otherwise each winning transition wakes its
/// waiter inline. Losing a transition delivers nothing; the winning path
/// (timeout, cancellation, disposal) already woke the waiter.
struct Completions {
    deferred: bool,
    pending: ArrayVec<Waker, DEFERRED_WAKEUPS>,
}

impl Completions {
    const fn new(deferred: bool) -> Self {
        Self {
            deferred,
            pending: ArrayVec::new_const(),
        }
    }

    /// CAS `waiter` from pending into `outcome`, delivering its wakeup on
    /// success. Returns whether this call won the transition.
    fn complete(&mut self, waiter: &Waiter, outcome: Phase) -> bool {
        match waiter.try_transition(outcome) {
            Ok(()) => {
                self.deliver(waiter);
                true
            }
            Err(_) => false,
        }
    }

    /// Delivers the wakeup of a waiter whose transition already happened
    /// (e.g. one [`check_hold`] expired during a scan).
    ///
    /// [`check_hold`]: Waiter::check_hold
    fn deliver(&mut self, waiter: &Waiter) {
        if self.deferred {
            if let Some(waker) = waiter.cell.take_waker() {
                if self.pending.is_full() {
                    self.flush();
                }
                self.pending.push(waker);
            }
        } else {
            waiter.cell.wake();
        }
    }

    fn flush(&mut self) {
        for waker in self.pending.drain(..) {
            waker.wake();
        }
    }
}

impl Drop for Completions {
    fn drop(&mut self) {
        self.flush();
    }
}

enum Optimistic {
    Acquired,
    MustWait,
}

pub(crate) enum BeginWait {
    /// The post-enqueue recheck raced back into the lock; no parking needed.
    Acquired,
    /// The request is queued; the caller parks on the node's result channel.
    Queued(NonNull<Waiter>),
}

// === impl RawRwLock ===

impl RawRwLock {
    /// Returns a lock with default [`Options`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(Options::new()).expect("default options are valid")
    }

    /// Returns a lock configured by `opts`.
    ///
    /// # Errors
    ///
    /// Returns an [`OptionsError`] when the options are inconsistent.
    pub fn with_options(opts: Options) -> Result<Self, OptionsError> {
        opts.validate()?;
        let vacuum_interval = match (&opts.clock, opts.vacuum_interval) {
            (Some(clock), Some(interval)) => Some(clock.ticks_for(interval).max(1)),
            _ => None,
        };
        Ok(Self {
            state: CachePadded(AtomicUsize::new(LockState::UNLOCKED.bits())),
            default_queue: WaitQueue::new(),
            elevated_queue: WaitQueue::new(),
            pool: NodePool::new(),
            disposed: AtomicBool::new(false),
            last_vacuum: AtomicU64::new(0),
            vacuum_interval,
            elevation: opts.elevation,
            deferred_wakeups: opts.deferred_wakeups,
            clock: opts.clock,
        })
    }

    /// A snapshot of the packed lock word, for diagnostics and tests.
    #[must_use]
    pub fn state(&self) -> LockState {
        self.load_state()
    }

    /// `true` once [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // --- enter operations ---

    /// Enters the lock shared if that is possible without waiting.
    #[must_use]
    pub fn try_enter_read(&self) -> bool {
        !self.is_disposed() && self.try_fast(Kind::Read)
    }

    /// Enters the lock upgradable-shared if that is possible without waiting.
    #[must_use]
    pub fn try_enter_read_upgrade(&self) -> bool {
        !self.is_disposed() && self.try_fast(Kind::ReadUpgrade)
    }

    /// Enters the lock exclusive if that is possible without waiting.
    #[must_use]
    pub fn try_enter_write(&self) -> bool {
        !self.is_disposed() && self.try_fast(Kind::Write)
    }

    /// Converts the caller's upgradable-shared hold to exclusive if that is
    /// possible without waiting. The caller must hold the upgradable side.
    #[must_use]
    pub fn try_enter_write_upgrade(&self) -> bool {
        !self.is_disposed() && self.try_fast(Kind::WriteUpgrade)
    }

    /// Enters the lock shared, waiting up to `timeout`.
    ///
    /// The returned future resolves `Ok(true)` when the lock was entered,
    /// `Ok(false)` on timeout, and an [`AcquireError`] on cancellation,
    /// overflow or disposal.
    pub fn enter_read(&self, timeout: Timeout, cancel: Option<CancelToken>) -> Acquire<'_> {
        Acquire::new(self, Kind::Read, timeout, cancel)
    }

    /// Enters the lock upgradable-shared, waiting up to `timeout`.
    ///
    /// At most one upgradable holder exists at a time; it shares the lock
    /// with ordinary readers and may later convert itself to exclusive with
    /// [`enter_write_upgrade`](Self::enter_write_upgrade).
    pub fn enter_read_upgrade(&self, timeout: Timeout, cancel: Option<CancelToken>) -> Acquire<'_> {
        Acquire::new(self, Kind::ReadUpgrade, timeout, cancel)
    }

    /// Enters the lock exclusive, waiting up to `timeout`.
    pub fn enter_write(&self, timeout: Timeout, cancel: Option<CancelToken>) -> Acquire<'_> {
        Acquire::new(self, Kind::Write, timeout, cancel)
    }

    /// Converts the caller's upgradable-shared hold to exclusive, waiting up
    /// to `timeout` for sibling readers to leave. The caller must hold the
    /// upgradable side.
    pub fn enter_write_upgrade(&self, timeout: Timeout, cancel: Option<CancelToken>) -> Acquire<'_> {
        Acquire::new(self, Kind::WriteUpgrade, timeout, cancel)
    }

    // --- exit operations ---

    /// Releases one shared hold.
    pub fn exit_read(&self) {
        self.exit_shared(1);
    }

    /// Releases the upgradable-shared hold.
    pub fn exit_read_upgrade(&self) {
        // drop the shared slot first, then the upgrade claim
        let after_sub = self.shared_sub_guarded(1);
        debug_assert!(after_sub.has_upgrade());

        let mut boff = Backoff::new();
        let mut current = after_sub;
        loop {
            if current.is_write() {
                // a dispatcher is redistributing; wait for it to publish
                boff.spin();
                current = self.load_state();
                continue;
            }
            debug_assert!(current.has_upgrade());
            let next = LockState::from_bits(current.bits() & !UPGRADE);
            match self.cas_state(current, next) {
                Ok(_) => {
                    self.after_shared_exit(next);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases the exclusive hold, redistributing the lock to queued
    /// waiters.
    pub fn exit_write(&self) {
        debug_assert!(self.load_state().is_write());
        debug_assert!(!self.load_state().has_upgrade());
        self.dispatch();
    }

    /// Releases the exclusive phase of an upgraded holder, returning it to
    /// its upgradable-shared hold.
    pub fn exit_write_upgrade(&self) {
        debug_assert!(self.load_state().is_write());
        debug_assert!(self.load_state().has_upgrade());
        self.dispatch();
    }

    /// Releases `n` shared holds at once.
    pub(crate) fn exit_shared(&self, n: usize) {
        if n == 0 {
            return;
        }
        let after = self.shared_sub_guarded(n);
        self.after_shared_exit(after);
    }

    pub(crate) fn exit_kind(&self, kind: Kind) {
        match kind {
            Kind::Read => self.exit_read(),
            Kind::ReadUpgrade => self.exit_read_upgrade(),
            Kind::Write => self.exit_write(),
            Kind::WriteUpgrade => self.exit_write_upgrade(),
            Kind::Unset => unreachable!("pooled nodes are never granted"),
        }
    }

    // --- disposal & vacuum ---

    /// Fails every queued waiter with [`AcquireError::Disposed`] and rejects
    /// all future requests. Current holders keep their access and exit
    /// normally.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("lock disposed, failing queued waiters");
        self.drain_disposed();
    }

    /// Runs one vacuum pass over both queues, discarding timed-out and
    /// cancelled waiters without waiting for a release to find them.
    ///
    /// When a [vacuum interval] is configured this runs opportunistically
    /// from the contended acquire path; external timers can simply call it
    /// periodically.
    ///
    /// [vacuum interval]: Options::vacuum_interval
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn vacuum(&self) {
        let now = self.now();
        for queue in [&self.default_queue, &self.elevated_queue] {
            // never delay a dispatcher; dead nodes keep
            let Some(consumer) = queue.try_consume() else {
                continue;
            };
            consumer.vacuum(now, |node| Waiter::release_ref(node, &self.pool));
        }
    }

    pub(crate) fn maybe_vacuum(&self) {
        let Some(interval) = self.vacuum_interval else {
            return;
        };
        let now = self.now();
        let last = self.last_vacuum.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= interval
            && self
                .last_vacuum
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.vacuum();
        }
    }

    // --- acquire internals ---

    pub(crate) fn now(&self) -> Ticks {
        self.clock.as_ref().map_or(0, Clock::now)
    }

    pub(crate) fn deadline_for(&self, timeout: Timeout) -> Result<Ticks, AcquireError> {
        match timeout {
            Timeout::Never => Ok(Ticks::MAX),
            Timeout::Immediate => Ok(0),
            Timeout::After(duration) => {
                let clock = self.clock.as_ref().ok_or(AcquireError::NoClock)?;
                Ok(clock.now().saturating_add(clock.ticks_for(duration)))
            }
        }
    }

    pub(crate) fn has_clock(&self) -> bool {
        self.clock.is_some()
    }

    pub(crate) fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub(crate) fn try_fast(&self, kind: Kind) -> bool {
        matches!(self.optimistic(kind, false), Optimistic::Acquired)
    }

    /// The optimistic entry loop: CAS the state transition for `kind` while
    /// its predicate holds. Once `queued`, a failed predicate instead raises
    /// the queue-changed hint so the next releaser inspects the queues.
    fn optimistic(&self, kind: Kind, queued: bool) -> Optimistic {
        let mut boff = Backoff::new();
        let mut state = self.load_state();
        loop {
            let can_enter = match kind {
                Kind::Read => state.can_enter_read(),
                Kind::ReadUpgrade => state.can_enter_read_upgrade(),
                Kind::Write => state.can_enter_write(),
                Kind::WriteUpgrade => state.can_enter_write_upgrade(),
                Kind::Unset => unreachable!("pooled nodes never enter the lock"),
            };

            if can_enter {
                let next = match kind {
                    Kind::Read => state.with_reader(),
                    Kind::ReadUpgrade => state.with_upgrade_reader(),
                    Kind::Write | Kind::WriteUpgrade => state.with_write(),
                    Kind::Unset => unreachable!(),
                };
                match self.cas_state(state, next) {
                    Ok(_) => return Optimistic::Acquired,
                    Err(actual) => {
                        boff.spin();
                        // under heavy contention re-read instead of chewing on
                        // the snapshot the failed CAS handed back
                        state = if boff.is_saturated() {
                            self.load_state()
                        } else {
                            actual
                        };
                    }
                }
            } else if queued {
                if state.queue_changed() {
                    return Optimistic::MustWait;
                }
                match self.cas_state(state, state.with_queue_changed()) {
                    Ok(_) => return Optimistic::MustWait,
                    Err(actual) => state = actual,
                }
            } else {
                return Optimistic::MustWait;
            }
        }
    }

    /// Enqueues a request after its fast path failed, then closes the
    /// lost-wakeup window with one more optimistic attempt.
    pub(crate) fn begin_wait(&self, kind: Kind, deadline: Ticks) -> Result<BeginWait, AcquireError> {
        let queue = self.route(kind);
        if !queue.reserve_slot() {
            return Err(AcquireError::Overflow);
        }
        let node = self.pool.rent(kind, deadline);
        queue.enqueue(node);

        match self.optimistic(kind, true) {
            Optimistic::Acquired => {
                // we raced back into the lock; the queued node must never be
                // consumed
                // Safety: we hold the caller reference.
                match unsafe { node.as_ref() }.try_transition(Phase::Deadborn) {
                    Ok(()) => {}
                    Err(Phase::Acquired) => {
                        // a dispatcher admitted the node while we also took
                        // the fast path; give one of the two grants back
                        self.exit_kind(kind);
                    }
                    Err(_) => {}
                }
                Waiter::release_ref(node, &self.pool);
                Ok(BeginWait::Acquired)
            }
            Optimistic::MustWait => {
                if self.is_disposed() {
                    // disposal may have drained the queues before our node
                    // became visible; drain again so it cannot be stranded
                    self.drain_disposed();
                }
                Ok(BeginWait::Queued(node))
            }
        }
    }

    fn route(&self, kind: Kind) -> &WaitQueue {
        let elevated = match self.elevation {
            Elevation::Fair => false,
            Elevation::Reads => !kind.is_write(),
            Elevation::Writes => kind.is_write(),
        };
        if elevated {
            &self.elevated_queue
        } else {
            &self.default_queue
        }
    }

    // --- release dispatcher ---

    /// Redistributes the lock to queued waiters.
    ///
    /// Precondition: the state word is at the write sentinel (the caller is
    /// the releasing exclusive holder, or a shared exit that transitioned the
    /// word on its way out). Either completes a single writer, leaving the
    /// word exclusive for the new holder, or publishes a word admitting a
    /// batch of readers (possibly empty, unlocking the lock).
    #[tracing::instrument(level = "trace", skip(self))]
    fn dispatch(&self) {
        let mut ds = DispatchState::new();
        let mut completions = Completions::new(self.deferred_wakeups);
        let now = self.now();
        loop {
            if self.is_disposed() {
                self.drain_disposed();
            }

            let state = self.load_state();
            debug_assert!(
                state.is_write(),
                "dispatcher invoked without the write sentinel: {state:?}"
            );
            // an upgradable holder survives this release (it is the releaser
            // itself, or the sole remaining reader a sibling exit handed off
            // for); it keeps its shared slot and pairs with queued
            // write-upgrades
            let is_upgrade = state.has_upgrade();

            let selected = match self.elevation {
                Elevation::Fair => self.scan(
                    &self.default_queue,
                    &mut ds,
                    true,
                    is_upgrade,
                    now,
                    &mut completions,
                ),
                Elevation::Reads => {
                    let _ = self.scan(
                        &self.elevated_queue,
                        &mut ds,
                        false,
                        is_upgrade,
                        now,
                        &mut completions,
                    );
                    if ds.batch_len == 0 {
                        self.scan(
                            &self.default_queue,
                            &mut ds,
                            true,
                            is_upgrade,
                            now,
                            &mut completions,
                        )
                    } else {
                        if !self.default_queue.is_empty() {
                            ds.queue_remaining = true;
                        }
                        None
                    }
                }
                Elevation::Writes => {
                    if ds.batch_len != 0 {
                        if !self.elevated_queue.is_empty() {
                            ds.queue_remaining = true;
                        }
                        None
                    } else if let Some(writer) = self.scan(
                        &self.elevated_queue,
                        &mut ds,
                        true,
                        is_upgrade,
                        now,
                        &mut completions,
                    ) {
                        Some(writer)
                    } else {
                        self.scan(
                            &self.default_queue,
                            &mut ds,
                            false,
                            is_upgrade,
                            now,
                            &mut completions,
                        )
                    }
                }
            };

            if let Some(node) = selected {
                debug_assert_eq!(ds.batch_len, 0);
                // Safety: we hold the node's queue reference.
                let waiter = unsafe { node.as_ref() };
                if completions.complete(waiter, Phase::Acquired) {
                    // the lock stays exclusive, only the holder changed
                    tracing::trace!(kind = ?waiter.kind(), "admitted writer");
                    Waiter::release_ref(node, &self.pool);
                    completions.flush();
                    return;
                }
                // timed out or cancelled in the race window
                Waiter::release_ref(node, &self.pool);
                continue;
            }

            if state.queue_changed() {
                // collect whatever was enqueued during the scan
                let _ = self.cas_state(state, state.without_queue_changed());
                continue;
            }

            let shared = ds.batch_len + usize::from(is_upgrade);
            let next = LockState::compose(
                shared,
                is_upgrade || ds.upgrade_in_batch,
                ds.queue_remaining,
            );
            if self.cas_state(state, next).is_err() {
                // a waiter raised the queue-changed hint; rescan
                continue;
            }
            tracing::trace!(admitted = ds.batch_len, state = ?next, "published post-admission state");

            // complete the admitted readers now that the word covers them
            let mut phantom = 0;
            let mut cursor = ds.batch_head;
            while let Some(node) = NonNull::new(cursor) {
                // Safety: batch nodes carry their queue reference.
                let waiter = unsafe { node.as_ref() };
                cursor = waiter.next.load(Ordering::Relaxed);
                if !completions.complete(waiter, Phase::Acquired) {
                    // the reader timed out or was cancelled after we batched
                    // it; its reserved slot is refunded below
                    phantom += 1;
                }
                Waiter::release_ref(node, &self.pool);
            }
            completions.flush();
            if phantom > 0 {
                tracing::trace!(phantom, "refunding phantom read slots");
                self.exit_shared(phantom);
            }
            return;
        }
    }

    /// Dequeues a chain of admissible readers into `ds`, or (with
    /// `allow_write`) a single writer of matching upgrade parity.
    ///
    /// Non-admissible waiters go back to the tail. The scan keeps looking for
    /// reads past a parked write only while the batch is empty and the
    /// iteration bound (the larger of the queue's length at scan start and
    /// now) has not been exhausted.
    fn scan(
        &self,
        queue: &WaitQueue,
        ds: &mut DispatchState,
        allow_write: bool,
        is_upgrade: bool,
        now: Ticks,
        completions: &mut Completions,
    ) -> Option<NonNull<Waiter>> {
        let consumer = queue.consume();
        let start_len = queue.len();
        let mut iterations = 0;
        let mut boff = Backoff::new();
        loop {
            let node = match consumer.try_dequeue() {
                Ok(node) => {
                    boff.reset();
                    node
                }
                Err(TryDequeueError::Empty) => return None,
                Err(TryDequeueError::Inconsistent) => {
                    boff.spin();
                    continue;
                }
            };
            iterations += 1;

            // Safety: dequeuing transferred the queue reference to us.
            let waiter = unsafe { node.as_ref() };
            match waiter.check_hold(now) {
                Hold::Live => {}
                Hold::Expired => {
                    completions.deliver(waiter);
                    Waiter::release_ref(node, &self.pool);
                    continue;
                }
                Hold::Dead => {
                    Waiter::release_ref(node, &self.pool);
                    continue;
                }
            }

            let kind = waiter.kind();
            let admissible_read = match kind {
                Kind::Read => true,
                // a second upgradable reader may not join an existing one
                Kind::ReadUpgrade => !is_upgrade && !ds.upgrade_in_batch,
                _ => false,
            };
            if admissible_read {
                if kind == Kind::ReadUpgrade {
                    ds.upgrade_in_batch = true;
                }
                ds.push(node);
                continue;
            }

            // a writer is admissible only before any reader was chosen, and
            // only when its upgrade parity matches the holder situation: an
            // ordinary writer needs the lock to itself, an upgrade writer is
            // the pending conversion of the surviving upgradable holder
            if allow_write && kind.is_write() && ds.batch_len == 0 && kind.is_upgrade() == is_upgrade
            {
                return Some(node);
            }

            // park it back at the tail; keep hunting for reads behind it only
            // while nothing was admitted yet
            queue.requeue(node);
            let bound = cmp::max(queue.len(), start_len);
            if ds.batch_len == 0 && iterations < bound {
                continue;
            }
            ds.queue_remaining = true;
            return None;
        }
    }

    // --- exit internals ---

    /// Subtracts `n` shared holds, spinning while a dispatcher transiently
    /// holds the word at the write sentinel on our behalf.
    fn shared_sub_guarded(&self, n: usize) -> LockState {
        let mut boff = Backoff::new();
        let mut current = self.load_state();
        loop {
            if current.is_write() {
                boff.spin();
                current = self.load_state();
                continue;
            }
            debug_assert!(
                current.shared_count() >= n,
                "released more shared holds than were taken: {current:?} - {n}"
            );
            let next = LockState::from_bits(current.bits() - n);
            match self.cas_state(current, next) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Hands the lock to the dispatcher when a shared exit leaves queued
    /// waiters without anyone responsible for them: either the lock drained
    /// completely, or only the upgradable holder remains (whose pending
    /// conversion, if any, can now be granted).
    fn after_shared_exit(&self, mut current: LockState) {
        loop {
            if !current.queue_changed() || current.is_write() {
                return;
            }
            if current.shared_count() == 0 && !current.has_upgrade() {
                match self.cas_state(current, LockState::from_bits(WRITE)) {
                    Ok(_) => {
                        self.dispatch();
                        return;
                    }
                    Err(actual) => current = actual,
                }
            } else if current.shared_count() == 1 && current.has_upgrade() {
                match self.cas_state(current, LockState::from_bits(WRITE | UPGRADE)) {
                    Ok(_) => {
                        self.dispatch();
                        return;
                    }
                    Err(actual) => current = actual,
                }
            } else {
                return;
            }
        }
    }

    fn drain_disposed(&self) {
        for queue in [&self.default_queue, &self.elevated_queue] {
            let consumer = queue.consume();
            while let Some(node) = consumer.dequeue() {
                // Safety: dequeuing transferred the queue reference to us.
                let waiter = unsafe { node.as_ref() };
                if waiter.try_transition(Phase::Disposed).is_ok() {
                    waiter.cell.wake();
                }
                Waiter::release_ref(node, &self.pool);
            }
        }
    }

    // --- state word plumbing ---

    fn load_state(&self) -> LockState {
        LockState::from_bits(self.state.load(Ordering::Acquire))
    }

    fn cas_state(&self, current: LockState, new: LockState) -> Result<LockState, LockState> {
        self.state
            .compare_exchange(
                current.bits(),
                new.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(LockState::from_bits)
            .map_err(LockState::from_bits)
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRwLock")
            .field("state", &self.load_state())
            .field("default_queue", &self.default_queue)
            .field("elevated_queue", &self.elevated_queue)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::MockClock;
    use crate::cancel::CancelSource;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn trace_init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn uncontended_read_round_trip() {
        trace_init();
        let lock = RawRwLock::new();
        assert_eq!(lock.state().bits(), 0);

        let mut read = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_ready_eq!(read.poll(), Ok(true));
        drop(read);
        assert_eq!(lock.state().shared_count(), 1);

        lock.exit_read();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn readers_share() {
        let lock = RawRwLock::new();
        for _ in 0..3 {
            let mut read = task::spawn(lock.enter_read(Timeout::Never, None));
            assert_ready_eq!(read.poll(), Ok(true));
        }
        assert_eq!(lock.state().shared_count(), 3);

        for _ in 0..3 {
            lock.exit_read();
        }
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn writer_waits_for_reader() {
        let lock = RawRwLock::new();
        assert!(lock.try_enter_read());

        let mut writer = task::spawn(lock.enter_write(Timeout::Never, None));
        assert_pending!(writer.poll());

        lock.exit_read();
        assert!(writer.is_woken());
        assert_ready_eq!(writer.poll(), Ok(true));
        assert!(lock.state().is_write());

        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn upgrade_with_sibling_readers() {
        let lock = RawRwLock::new();

        assert!(lock.try_enter_read_upgrade());
        assert_eq!(lock.state().shared_count(), 1);
        assert!(lock.state().has_upgrade());

        assert!(lock.try_enter_read());
        assert_eq!(lock.state().shared_count(), 2);

        // a sibling reader is inside, the conversion cannot happen eagerly
        assert!(!lock.try_enter_write_upgrade());

        let mut upgrade = task::spawn(lock.enter_write_upgrade(Timeout::Never, None));
        assert_pending!(upgrade.poll());

        // the last sibling leaving hands the lock to the pending conversion
        lock.exit_read();
        assert!(upgrade.is_woken());
        assert_ready_eq!(upgrade.poll(), Ok(true));
        assert!(lock.state().is_write());
        assert!(lock.state().has_upgrade());

        // leaving the exclusive phase restores the upgradable hold
        lock.exit_write_upgrade();
        assert_eq!(lock.state().shared_count(), 1);
        assert!(lock.state().has_upgrade());

        lock.exit_read_upgrade();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn second_upgradable_reader_is_excluded() {
        let lock = RawRwLock::new();
        assert!(lock.try_enter_read_upgrade());
        assert!(!lock.try_enter_read_upgrade());

        let mut second = task::spawn(lock.enter_read_upgrade(Timeout::Never, None));
        assert_pending!(second.poll());

        lock.exit_read_upgrade();
        assert!(second.is_woken());
        assert_ready_eq!(second.poll(), Ok(true));
        assert!(lock.state().has_upgrade());
        lock.exit_read_upgrade();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn cancellation_mid_wait() {
        let lock = RawRwLock::new();
        assert!(lock.try_enter_write());

        let source = CancelSource::new();
        let mut reader = task::spawn(lock.enter_read(Timeout::Never, Some(source.token())));
        assert_pending!(reader.poll());

        source.cancel();
        assert!(reader.is_woken());
        assert_ready_eq!(reader.poll(), Err(AcquireError::Cancelled));

        // the dispatcher skips the cancelled node on release
        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn pre_cancelled_token_fails_fast() {
        let lock = RawRwLock::new();
        let source = CancelSource::new();
        source.cancel();

        let mut read = task::spawn(lock.enter_read(Timeout::Never, Some(source.token())));
        assert_ready_eq!(read.poll(), Err(AcquireError::Cancelled));
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn write_elevation_prefers_the_writer() {
        let lock = RawRwLock::with_options(Options::new().elevation(Elevation::Writes)).unwrap();
        assert!(lock.try_enter_write());

        let mut reader = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(reader.poll());
        let mut writer = task::spawn(lock.enter_write(Timeout::Never, None));
        assert_pending!(writer.poll());

        // the writer enqueued last but sits in the elevated queue
        lock.exit_write();
        assert!(writer.is_woken());
        assert_ready_eq!(writer.poll(), Ok(true));
        assert_pending!(reader.poll());
        assert!(lock.state().is_write());

        lock.exit_write();
        assert!(reader.is_woken());
        assert_ready_eq!(reader.poll(), Ok(true));
        assert_eq!(lock.state().shared_count(), 1);

        lock.exit_read();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn read_elevation_prefers_the_readers() {
        let lock = RawRwLock::with_options(Options::new().elevation(Elevation::Reads)).unwrap();
        assert!(lock.try_enter_write());

        let mut writer = task::spawn(lock.enter_write(Timeout::Never, None));
        assert_pending!(writer.poll());
        let mut reader = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(reader.poll());

        lock.exit_write();
        assert!(reader.is_woken());
        assert_ready_eq!(reader.poll(), Ok(true));
        assert_pending!(writer.poll());
        assert_eq!(lock.state().shared_count(), 1);
        assert!(lock.state().queue_changed());

        lock.exit_read();
        assert!(writer.is_woken());
        assert_ready_eq!(writer.poll(), Ok(true));
        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn fair_order_reads_batch_around_writes() {
        let lock = RawRwLock::new();
        assert!(lock.try_enter_write());

        let mut r1 = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(r1.poll());
        let mut w2 = task::spawn(lock.enter_write(Timeout::Never, None));
        assert_pending!(w2.poll());
        let mut r3 = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(r3.poll());

        // the leading reader is admitted; the writer stops the batch and goes
        // back to the tail, behind the trailing reader
        lock.exit_write();
        assert!(r1.is_woken());
        assert_ready_eq!(r1.poll(), Ok(true));
        assert_pending!(w2.poll());
        assert_pending!(r3.poll());

        lock.exit_read();
        assert!(r3.is_woken());
        assert_ready_eq!(r3.poll(), Ok(true));
        assert_pending!(w2.poll());

        lock.exit_read();
        assert!(w2.is_woken());
        assert_ready_eq!(w2.poll(), Ok(true));
        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn immediate_timeout_never_enqueues() {
        let lock = RawRwLock::new();
        assert!(lock.try_enter_write());

        let mut read = task::spawn(lock.enter_read(Timeout::Immediate, None));
        assert_ready_eq!(read.poll(), Ok(false));
        // nothing was queued, so no queue-changed hint either
        assert!(!lock.state().queue_changed());

        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn deadline_elapses_while_parked() {
        let mock = MockClock::new_1ms();
        let lock = RawRwLock::with_options(Options::new().clock(mock.clock())).unwrap();
        assert!(lock.try_enter_write());

        let mut read = task::spawn(lock.enter_read(
            Timeout::After(core::time::Duration::from_millis(10)),
            None,
        ));
        assert_pending!(read.poll());

        mock.advance(core::time::Duration::from_millis(11));
        assert_ready_eq!(read.poll(), Ok(false));

        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn release_completes_expired_waiters() {
        let mock = MockClock::new_1ms();
        let lock = RawRwLock::with_options(Options::new().clock(mock.clock())).unwrap();
        assert!(lock.try_enter_write());

        let mut expired = task::spawn(lock.enter_read(
            Timeout::After(core::time::Duration::from_millis(5)),
            None,
        ));
        assert_pending!(expired.poll());
        let mut patient = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(patient.poll());

        mock.advance(core::time::Duration::from_millis(10));

        // the dispatcher finds the expired node first and completes it as
        // not-acquired, then admits the live reader
        lock.exit_write();
        assert!(expired.is_woken());
        assert_ready_eq!(expired.poll(), Ok(false));
        assert!(patient.is_woken());
        assert_ready_eq!(patient.poll(), Ok(true));
        assert_eq!(lock.state().shared_count(), 1);

        lock.exit_read();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn vacuum_discards_dead_waiters() {
        trace_init();
        let mock = MockClock::new_1ms();
        let lock = RawRwLock::with_options(Options::new().clock(mock.clock())).unwrap();
        assert!(lock.try_enter_write());

        let mut expired = task::spawn(lock.enter_read(
            Timeout::After(core::time::Duration::from_millis(5)),
            None,
        ));
        assert_pending!(expired.poll());
        let mut patient = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(patient.poll());

        mock.advance(core::time::Duration::from_millis(10));
        lock.vacuum();

        // the expired waiter resolved without any release happening
        assert!(expired.is_woken());
        assert_ready_eq!(expired.poll(), Ok(false));
        assert_pending!(patient.poll());

        lock.exit_write();
        assert_ready_eq!(patient.poll(), Ok(true));
        lock.exit_read();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn dispose_fails_queued_and_future_waiters() {
        let lock = RawRwLock::new();
        assert!(lock.try_enter_write());

        let mut queued = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(queued.poll());

        lock.dispose();
        assert!(queued.is_woken());
        assert_ready_eq!(queued.poll(), Err(AcquireError::Disposed));

        assert!(!lock.try_enter_read());
        let mut late = task::spawn(lock.enter_write(Timeout::Never, None));
        assert_ready_eq!(late.poll(), Err(AcquireError::Disposed));

        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn dropped_future_forfeits_its_place() {
        let lock = RawRwLock::new();
        assert!(lock.try_enter_write());

        let mut reader = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(reader.poll());
        drop(reader);

        // the abandoned node is skipped, the lock unlocks cleanly
        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn queue_hint_is_raised_by_parked_requests() {
        let lock = RawRwLock::new();
        assert!(lock.try_enter_read());

        let mut writer = task::spawn(lock.enter_write(Timeout::Never, None));
        assert_pending!(writer.poll());
        assert!(lock.state().queue_changed());

        // the hint blocks optimistic entry, preserving FIFO fairness
        assert!(!lock.try_enter_read());

        lock.exit_read();
        assert_ready_eq!(writer.poll(), Ok(true));
        lock.exit_write();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn deferred_wakeups_admit_a_full_batch() {
        let lock = RawRwLock::with_options(Options::new().deferred_wakeups(true)).unwrap();
        assert!(lock.try_enter_write());

        let mut r1 = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(r1.poll());
        let mut r2 = task::spawn(lock.enter_read(Timeout::Never, None));
        assert_pending!(r2.poll());

        // both wakeups are batched and flushed after the new word is out
        lock.exit_write();
        assert!(r1.is_woken());
        assert!(r2.is_woken());
        assert_ready_eq!(r1.poll(), Ok(true));
        assert_ready_eq!(r2.poll(), Ok(true));
        assert_eq!(lock.state().shared_count(), 2);

        lock.exit_read();
        lock.exit_read();
        assert_eq!(lock.state().bits(), 0);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let err = RawRwLock::with_options(
            Options::new().vacuum_interval(core::time::Duration::ZERO),
        );
        assert!(matches!(err, Err(OptionsError::ZeroVacuumInterval)));
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::{AtomicUsize, Ordering};
    use crate::loom::{model, thread};
    use loom::future::block_on;

    #[test]
    fn writers_are_mutually_exclusive() {
        model(|| {
            let lock = Arc::new(RawRwLock::new());
            let data = Arc::new(AtomicUsize::new(0));

            let writer = thread::spawn({
                let lock = lock.clone();
                let data = data.clone();
                move || {
                    assert!(block_on(lock.enter_write(Timeout::Never, None)).unwrap());
                    let v = data.load(Ordering::Relaxed);
                    data.store(v + 1, Ordering::Relaxed);
                    lock.exit_write();
                }
            });

            assert!(block_on(lock.enter_write(Timeout::Never, None)).unwrap());
            let v = data.load(Ordering::Relaxed);
            data.store(v + 1, Ordering::Relaxed);
            lock.exit_write();

            writer.join().unwrap();
            assert_eq!(data.load(Ordering::Relaxed), 2);
            assert_eq!(lock.state().bits(), 0);
        });
    }

    #[test]
    fn reader_and_writer_agree() {
        model(|| {
            let lock = Arc::new(RawRwLock::new());

            let reader = thread::spawn({
                let lock = lock.clone();
                move || {
                    assert!(block_on(lock.enter_read(Timeout::Never, None)).unwrap());
                    let state = lock.state();
                    assert!(!state.is_write());
                    assert!(state.shared_count() >= 1);
                    lock.exit_read();
                }
            });

            assert!(block_on(lock.enter_write(Timeout::Never, None)).unwrap());
            assert!(lock.state().is_write());
            lock.exit_write();

            reader.join().unwrap();
            assert_eq!(lock.state().bits(), 0);
        });
    }
}
