// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use static_assertions::const_assert;

/// A waiter was enqueued while the lock was held; the next releaser must
/// inspect the queues before leaving.
pub(crate) const QUEUE_CHANGED: usize = 1 << (usize::BITS - 1);
/// An upgradable reader currently holds the lock (whether or not upgraded).
pub(crate) const UPGRADE: usize = 1 << (usize::BITS - 2);
/// Mask over the shared-count bits.
const SHARED_MASK: usize = UPGRADE - 1;
/// All shared bits set marks the lock exclusive.
pub(crate) const WRITE: usize = SHARED_MASK;

/// The largest representable number of concurrent shared holders. This also
/// caps how many waiters a queue will admit.
pub const MAX_SHARED: usize = WRITE - 1;

const_assert!(MAX_SHARED > 0);

/// Decoded view of the lock's packed state word.
///
/// The entire lock state lives in one pointer-sized atomic so that every
/// transition is a single compare-and-swap: the two high bits carry the
/// [queue-changed] and [upgrade] flags, the remaining low bits count shared
/// holders, with the all-ones pattern as the exclusive sentinel. Keeping the
/// count in the low bits lets shared exits use plain subtraction and lets the
/// upgradable-entry predicate collapse to `word <= MAX_SHARED`.
///
/// [queue-changed]: LockState::queue_changed
/// [upgrade]: LockState::has_upgrade
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct LockState(usize);

// === impl LockState ===

impl LockState {
    pub(crate) const UNLOCKED: Self = Self(0);

    #[inline]
    #[must_use]
    pub(crate) const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    /// The raw state word.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> usize {
        self.0
    }

    /// `true` if the lock is held exclusively.
    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.0 & SHARED_MASK == WRITE
    }

    /// The number of shared holders, zero when the lock is exclusive.
    #[inline]
    #[must_use]
    pub const fn shared_count(self) -> usize {
        if self.is_write() {
            0
        } else {
            self.0 & SHARED_MASK
        }
    }

    /// `true` if an upgradable reader holds the lock.
    #[inline]
    #[must_use]
    pub const fn has_upgrade(self) -> bool {
        self.0 & UPGRADE != 0
    }

    /// `true` if a waiter enqueued while the lock was held.
    #[inline]
    #[must_use]
    pub const fn queue_changed(self) -> bool {
        self.0 & QUEUE_CHANGED != 0
    }

    // --- entry predicates ---

    /// Ordinary readers may enter unless the lock is exclusive, the queue
    /// hint is raised, or the count is saturated. An upgradable holder does
    /// not exclude ordinary readers.
    #[inline]
    #[must_use]
    pub(crate) const fn can_enter_read(self) -> bool {
        !self.is_write() && !self.queue_changed() && self.shared_count() < MAX_SHARED
    }

    /// An upgradable reader may enter only while no other upgradable holder,
    /// no writer, and no queue hint exist, which collapses to a single
    /// comparison against the count bits.
    #[inline]
    #[must_use]
    pub(crate) const fn can_enter_read_upgrade(self) -> bool {
        self.0 <= MAX_SHARED
    }

    /// A writer may enter only a completely free lock.
    #[inline]
    #[must_use]
    pub(crate) const fn can_enter_write(self) -> bool {
        self.0 == 0
    }

    /// The upgradable holder may convert to exclusive once it is the sole
    /// remaining shared holder. The queue hint does not block the
    /// conversion.
    #[inline]
    #[must_use]
    pub(crate) const fn can_enter_write_upgrade(self) -> bool {
        self.has_upgrade() && !self.is_write() && self.shared_count() <= 1
    }

    // --- transitions ---

    #[inline]
    #[must_use]
    pub(crate) const fn with_reader(self) -> Self {
        Self(self.0 + 1)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn with_upgrade_reader(self) -> Self {
        Self((self.0 + 1) | UPGRADE)
    }

    /// Saturates the count bits, retaining the flag bits. This is both the
    /// plain write entry (from zero) and the upgrade conversion (retaining
    /// [`UPGRADE`]).
    #[inline]
    #[must_use]
    pub(crate) const fn with_write(self) -> Self {
        Self(self.0 | WRITE)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn with_queue_changed(self) -> Self {
        Self(self.0 | QUEUE_CHANGED)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn without_queue_changed(self) -> Self {
        Self(self.0 & !QUEUE_CHANGED)
    }

    /// Builds the post-admission word published by the release dispatcher.
    #[inline]
    #[must_use]
    pub(crate) fn compose(shared: usize, upgrade: bool, queue_changed: bool) -> Self {
        debug_assert!(shared <= MAX_SHARED);
        let mut bits = shared;
        if upgrade {
            bits |= UPGRADE;
        }
        if queue_changed {
            bits |= QUEUE_CHANGED;
        }
        Self(bits)
    }
}

impl fmt::Debug for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockState")
            .field("bits", &format_args!("{:#x}", self.0))
            .field("is_write", &self.is_write())
            .field("shared", &self.shared_count())
            .field("upgrade", &self.has_upgrade())
            .field("queue_changed", &self.queue_changed())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn write_and_shared_are_exclusive() {
        let w = LockState::UNLOCKED.with_write();
        assert!(w.is_write());
        assert_eq!(w.shared_count(), 0);

        let r = LockState::UNLOCKED.with_reader();
        assert!(!r.is_write());
        assert_eq!(r.shared_count(), 1);
    }

    #[test]
    fn read_entry_predicate() {
        assert!(LockState::UNLOCKED.can_enter_read());
        // readers coexist with an upgradable holder
        assert!(LockState::UNLOCKED.with_upgrade_reader().can_enter_read());
        assert!(!LockState::UNLOCKED.with_write().can_enter_read());
        assert!(!LockState::UNLOCKED.with_queue_changed().can_enter_read());
        assert!(!LockState::from_bits(MAX_SHARED).can_enter_read());
    }

    #[test]
    fn upgradable_entry_predicate() {
        assert!(LockState::UNLOCKED.can_enter_read_upgrade());
        assert!(LockState::UNLOCKED.with_reader().can_enter_read_upgrade());
        // a second upgradable holder is excluded
        assert!(
            !LockState::UNLOCKED
                .with_upgrade_reader()
                .can_enter_read_upgrade()
        );
        assert!(!LockState::UNLOCKED.with_write().can_enter_read_upgrade());
        assert!(
            !LockState::UNLOCKED
                .with_queue_changed()
                .can_enter_read_upgrade()
        );
    }

    #[test]
    fn write_entry_predicate() {
        assert!(LockState::UNLOCKED.can_enter_write());
        assert!(!LockState::UNLOCKED.with_reader().can_enter_write());
        assert!(!LockState::UNLOCKED.with_upgrade_reader().can_enter_write());
        assert!(!LockState::UNLOCKED.with_queue_changed().can_enter_write());
    }

    #[test]
    fn upgrade_conversion_predicate() {
        let upgradable = LockState::UNLOCKED.with_upgrade_reader();
        assert!(upgradable.can_enter_write_upgrade());
        // the queue hint does not block the conversion
        assert!(upgradable.with_queue_changed().can_enter_write_upgrade());
        // sibling readers do
        assert!(!upgradable.with_reader().can_enter_write_upgrade());
        // and so does an already converted holder
        assert!(!upgradable.with_write().can_enter_write_upgrade());
        // plain readers without an upgradable holder can never convert
        assert!(!LockState::UNLOCKED.with_reader().can_enter_write_upgrade());
    }

    #[test]
    fn upgrade_conversion_retains_the_upgrade_flag() {
        let converted = LockState::UNLOCKED.with_upgrade_reader().with_write();
        assert!(converted.is_write());
        assert!(converted.has_upgrade());
    }

    #[test]
    fn compose_round_trips() {
        let s = LockState::compose(3, true, true);
        assert_eq!(s.shared_count(), 3);
        assert!(s.has_upgrade());
        assert!(s.queue_changed());
        assert!(!s.is_write());

        assert_eq!(LockState::compose(0, false, false), LockState::UNLOCKED);
    }
}
