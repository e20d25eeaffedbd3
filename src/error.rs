// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error resolved through an [`Acquire`] future when a lock request cannot
/// complete.
///
/// A request that merely runs out of time is not an error; it resolves with
/// `Ok(false)` instead.
///
/// [`Acquire`]: crate::Acquire
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum AcquireError {
    /// The caller's [`CancelToken`] fired while the request was pending.
    ///
    /// [`CancelToken`]: crate::CancelToken
    Cancelled,
    /// More waiters are queued than the lock can account for.
    Overflow,
    /// The lock was [disposed] before or while the request was pending.
    ///
    /// [disposed]: crate::RawRwLock::dispose
    Disposed,
    /// A relative timeout was requested but the lock has no clock to measure
    /// it with.
    NoClock,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::Cancelled => f.write_str("lock request was cancelled"),
            AcquireError::Overflow => f.write_str("too many queued lock requests"),
            AcquireError::Disposed => f.write_str("lock was disposed"),
            AcquireError::NoClock => {
                f.write_str("timeout requested but no clock is configured for this lock")
            }
        }
    }
}

impl core::error::Error for AcquireError {}

/// Error returned when a lock is constructed from invalid [`Options`].
///
/// [`Options`]: crate::Options
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum OptionsError {
    /// The vacuum interval must be greater than zero when set.
    ZeroVacuumInterval,
    /// A vacuum interval was configured but no clock to measure it with.
    VacuumWithoutClock,
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionsError::ZeroVacuumInterval => {
                f.write_str("vacuum interval must be greater than zero")
            }
            OptionsError::VacuumWithoutClock => {
                f.write_str("vacuum interval requires a configured clock")
            }
        }
    }
}

impl core::error::Error for OptionsError {}
