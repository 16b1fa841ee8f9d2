//! Thin façades over the operating system's mutexes, counting semaphores and
//! condition variables.
//!
//! The [`sys`] module holds one backend per platform behind a small set of
//! traits; the types re-exported here wrap those backends with ownership
//! tracking, misuse detection and structured errors.

use std::time::Duration;

pub use condvar::Condvar;
pub use error::{Error, Misuse, Result};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Backend, Semaphore};

pub mod semaphore;
pub mod sys;

mod condvar;
mod error;
mod mutex;

/// Timeout sentinel: waits given this duration never time out.
pub const MAX_WAIT: Duration = Duration::MAX;

/// Outcome of a wait that may give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The wait was satisfied by a post or a signal.
    Signaled,
    /// The time budget ran out first. This is not an error.
    TimedOut,
}

impl WaitResult {
    pub fn timed_out(self) -> bool {
        self == WaitResult::TimedOut
    }
}
