//! Counting semaphores.
//!
//! A [`Semaphore`] is backed either by the platform's own counting semaphore
//! or by an emulation built from the native mutex and condition variable.
//! [`Builder`] picks between the two per handle; the `emulated-semaphore`
//! cargo feature changes the default.

use std::fmt;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::sys::{self, RawSemaphore};
use crate::{Result, WaitResult, MAX_WAIT};

/// Which implementation backs a [`Semaphore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The platform's counting semaphore, falling back to [`Backend::Emulated`]
    /// on platforms that lack a usable one.
    Native,
    /// A count guarded by the native mutex, with waiters parked on the
    /// native condition variable.
    Emulated,
}

impl Default for Backend {
    fn default() -> Backend {
        if cfg!(feature = "emulated-semaphore") {
            Backend::Emulated
        } else {
            Backend::Native
        }
    }
}

/// Configures a [`Semaphore`] before creating it.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    initial: u32,
    backend: Backend,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// The count the semaphore starts with. Defaults to zero.
    pub fn initial(mut self, initial: u32) -> Builder {
        self.initial = initial;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Builder {
        self.backend = backend;
        self
    }

    pub fn build(self) -> Result<Semaphore> {
        let native = match self.backend {
            Backend::Native => sys::native_semaphore(self.initial),
            Backend::Emulated => None,
        };
        let (inner, backend) = match native {
            Some(sem) => (sem?, Backend::Native),
            None => (sys::emulated_semaphore(self.initial)?, Backend::Emulated),
        };
        trace!(initial = self.initial, ?backend, "created semaphore");
        Ok(Semaphore { inner, backend })
    }
}

/// A counting semaphore.
///
/// [`post`](Semaphore::post) increments the count and wakes one blocked
/// waiter; the `wait` family decrements it, blocking while it is zero. The
/// order in which blocked waiters are released is up to the OS scheduler.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use native_sync::{Semaphore, WaitResult};
///
/// let sem = Semaphore::new(1).unwrap();
/// sem.wait().unwrap();
/// assert_eq!(sem.wait_timeout(Duration::ZERO).unwrap(), WaitResult::TimedOut);
/// sem.post().unwrap();
/// assert_eq!(sem.value().unwrap(), 1);
/// ```
pub struct Semaphore {
    inner: Box<dyn RawSemaphore>,
    backend: Backend,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` with the default backend.
    pub fn new(initial: u32) -> Result<Semaphore> {
        Builder::new().initial(initial).build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The backend actually in use, after any fallback.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Blocks until the count is positive, then decrements it.
    pub fn wait(&self) -> Result<()> {
        unsafe { self.inner.wait() }
    }

    /// Decrements the count if it is positive. Returns
    /// [`WaitResult::TimedOut`] immediately otherwise.
    pub fn try_wait(&self) -> Result<WaitResult> {
        unsafe { self.inner.try_wait() }
    }

    /// Like [`wait`](Semaphore::wait), giving up once `dur` has elapsed.
    ///
    /// A zero `dur` is the same as [`try_wait`](Semaphore::try_wait) and
    /// [`MAX_WAIT`] is the same as [`wait`](Semaphore::wait).
    ///
    /// The native POSIX backend can only express its deadline on the wall
    /// clock. Expiry is checked against the monotonic clock, so stepping the
    /// wall clock forward cannot end the wait early, but stepping it back
    /// can stretch the wait.
    pub fn wait_timeout(&self, dur: Duration) -> Result<WaitResult> {
        if dur.is_zero() {
            return self.try_wait();
        }
        if dur >= MAX_WAIT {
            return self.wait().map(|()| WaitResult::Signaled);
        }
        let r = unsafe { self.inner.wait_timeout(dur)? };
        if r.timed_out() {
            debug!(?dur, backend = ?self.backend, "semaphore wait timed out");
        }
        Ok(r)
    }

    /// The current count. Concurrent posts and waits can make this stale
    /// before the caller looks at it.
    pub fn value(&self) -> Result<u32> {
        unsafe { self.inner.value() }
    }

    /// Increments the count, releasing one blocked waiter if there is one.
    pub fn post(&self) -> Result<()> {
        unsafe { self.inner.post() }
    }

    /// Deallocates the native objects, reporting any failure.
    pub fn destroy(self) -> Result<()> {
        trace!(backend = ?self.backend, "destroying semaphore");
        // Dropping `self` afterwards finds the handle already destroyed.
        unsafe { self.inner.destroy() }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore").field("backend", &self.backend).finish_non_exhaustive()
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.inner.destroy() } {
            warn!(error = %e, "failed to destroy semaphore");
        }
    }
}
