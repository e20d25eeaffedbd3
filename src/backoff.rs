// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// An [exponential backoff] for spin loops.
///
/// This is a helper struct for spinning in a busy loop, with an exponentially
/// increasing number of spins up to a maximum value.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub(crate) struct Backoff {
    exp: u8,
    max: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The default maximum exponent (2^8).
    pub(crate) const DEFAULT_MAX_EXPONENT: u8 = 8;

    /// Returns a new exponential backoff with the maximum exponent set to
    /// [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Backs off in a spin loop.
    ///
    /// This should be used when an operation needs to be retried because
    /// another thread or core made progress. Depending on the target
    /// architecture, this will generally issue a sequence of `pause`
    /// instructions.
    ///
    /// Each time this function is called, it will issue `2^exp` [spin loop
    /// hints], where `exp` is the current exponent value (starting at 0). If
    /// `exp` is less than the configured maximum exponent, the exponent is
    /// incremented once the spin is complete.
    ///
    /// [spin loop hints]: hint::spin_loop
    #[inline(always)]
    pub(crate) fn spin(&mut self) {
        // Issue 2^exp pause instructions.
        let spins = 1_u32 << self.exp;

        for _ in 0..spins {
            // In tests, especially in loom tests, we need to yield the thread back to the runtime
            // so it can make progress. See https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(any(test, loom))]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1;
        }
    }

    /// Returns `true` once the exponent has reached its maximum, i.e. when the
    /// spinner has been waiting long enough that a retry should re-read shared
    /// state instead of reusing a stale snapshot.
    #[inline(always)]
    pub(crate) fn is_saturated(&self) -> bool {
        self.exp >= self.max
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.exp = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
