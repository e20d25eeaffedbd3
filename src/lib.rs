// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fair reader-writer lock with upgradable readers, usable from async tasks
//! and blocking threads alike.
//!
//! The lock distinguishes five logical states: free, shared, exclusive,
//! upgradable-shared, and the exclusive phase of an upgraded reader. All of
//! it is packed into a single atomic word, so every transition is one
//! compare-and-swap; contended requests park on pooled waiter nodes in
//! lock-free queues and are redistributed in FIFO order (optionally with
//! readers or writers elevated) by whichever holder releases last.
//!
//! Per-request deadlines and [cancellation tokens](CancelToken) resolve
//! waiters that will never be admitted; a background-friendly
//! [vacuum pass](RawRwLock::vacuum) unlinks such dead waiters without waiting
//! for a release to walk past them.
//!
//! Three surfaces, innermost first:
//!
//! - [`RawRwLock`]: the bare `enter`/`exit` state machine, no guards.
//! - [`RwLock`]: async, data-carrying, RAII guards.
//! - [`blocking::RwLock`] (`std`): the same lock driven by thread parking.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

mod acquire;
mod backoff;
mod cancel;
mod clock;
mod error;
mod loom;
mod mutex;
mod node;
mod queue;
mod raw;
mod rwlock;
mod state;
mod util;
mod wait_cell;

#[cfg(feature = "std")]
pub mod blocking;
#[cfg(feature = "std")]
pub mod park;

pub use acquire::Acquire;
pub use cancel::{CancelSource, CancelToken};
#[cfg(any(test, feature = "test-util"))]
pub use clock::mock::MockClock;
#[cfg(feature = "std")]
pub use clock::StdClock;
pub use clock::{Clock, RawClock, RawClockVTable, Ticks};
pub use error::{AcquireError, OptionsError};
pub use raw::{Elevation, Options, RawRwLock, Timeout};
pub use rwlock::{
    RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockUpgradedWriteGuard, RwLockWriteGuard,
};
pub use state::{LockState, MAX_SHARED};
