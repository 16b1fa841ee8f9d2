use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::mutex::{Mutex, MutexGuard};
use crate::sys::{self, RawCondvar, RawMutex};
use crate::{Misuse, Result, WaitResult, MAX_WAIT};

/// A condition variable backed by the native OS condition variable.
///
/// The condition variable does not own a mutex. Every wait is handed the
/// mutex protecting the awaited state, which must be held by the calling
/// thread; it is released for the duration of the wait and held again on
/// return, whatever the outcome. While threads are parked on the condition
/// variable with one mutex, waiting on it with any other is reported as
/// [`Misuse::MixedMutex`]; once they have all returned, any mutex may be
/// used.
///
/// Wakeups may be spurious, so waiters re-check their condition in a loop.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::thread;
/// use native_sync::{Condvar, Mutex};
///
/// let pair = Arc::new((Mutex::new().unwrap(), Condvar::new().unwrap(), AtomicBool::new(false)));
/// let pair2 = pair.clone();
///
/// thread::spawn(move || {
///     let (lock, cvar, ready) = &*pair2;
///     let _g = lock.lock().unwrap();
///     ready.store(true, Ordering::Relaxed);
///     cvar.signal().unwrap();
/// });
///
/// let (lock, cvar, ready) = &*pair;
/// let g = lock.lock().unwrap();
/// while !ready.load(Ordering::Relaxed) {
///     cvar.wait(&g).unwrap();
/// }
/// ```
pub struct Condvar {
    inner: sys::Condvar,
    // Native address of the mutex the parked waiters hold, zero when no
    // thread is waiting.
    mutex: AtomicUsize,
    waiters: AtomicUsize,
}

impl Condvar {
    pub fn new() -> Result<Condvar> {
        let inner = sys::Condvar::new()?;
        trace!("created condition variable");
        Ok(Condvar { inner, mutex: AtomicUsize::new(0), waiters: AtomicUsize::new(0) })
    }

    /// Wakes up at most one thread blocked on this condition variable.
    pub fn signal(&self) -> Result<()> {
        unsafe { self.inner.signal() }
    }

    /// Wakes up every thread currently blocked on this condition variable.
    pub fn broadcast(&self) -> Result<()> {
        unsafe { self.inner.broadcast() }
    }

    /// Blocks until signalled, releasing the guard's mutex while blocked.
    pub fn wait(&self, guard: &MutexGuard<'_>) -> Result<()> {
        self.wait_held(guard.mutex())
    }

    /// Like [`wait`](Condvar::wait), giving up once `dur` has elapsed.
    pub fn wait_timeout(&self, guard: &MutexGuard<'_>, dur: Duration) -> Result<WaitResult> {
        self.wait_held_timeout(guard.mutex(), dur)
    }

    /// Blocks until signalled, for callers holding `mutex` through
    /// [`Mutex::acquire`].
    pub fn wait_held(&self, mutex: &Mutex) -> Result<()> {
        let addr = self.enter(mutex)?;
        mutex.park_owner();
        let r = unsafe { self.inner.wait(mutex.raw()) };
        mutex.restore_owner();
        self.leave(addr);
        r
    }

    /// Like [`wait_held`](Condvar::wait_held), giving up once `dur` has
    /// elapsed. A `dur` of [`MAX_WAIT`] never times out.
    pub fn wait_held_timeout(&self, mutex: &Mutex, dur: Duration) -> Result<WaitResult> {
        if dur >= MAX_WAIT {
            return self.wait_held(mutex).map(|()| WaitResult::Signaled);
        }
        let addr = self.enter(mutex)?;
        mutex.park_owner();
        let r = unsafe { self.inner.wait_timeout(mutex.raw(), dur) };
        mutex.restore_owner();
        self.leave(addr);
        if let Ok(WaitResult::TimedOut) = r {
            debug!(?dur, "condition variable wait timed out");
        }
        r
    }

    /// Deallocates the native condition variable, reporting any failure.
    pub fn destroy(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        trace!("destroying condition variable");
        unsafe { this.inner.destroy() }
    }

    /// Checks the wait preconditions and registers the caller as a waiter
    /// paired with `mutex`, returning the pairing address.
    ///
    /// Every registration and deregistration for a given mutex happens with
    /// that mutex held, so only waiters with a different mutex can race here.
    fn enter(&self, mutex: &Mutex) -> Result<usize> {
        if !mutex.is_held_by_current_thread() {
            return Err(Misuse::NotOwner.into());
        }
        let addr = mutex.raw().addr();
        match self.mutex.compare_exchange(0, addr, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {}
            Err(n) if n == addr => {}
            Err(_) => return Err(Misuse::MixedMutex.into()),
        }
        self.waiters.fetch_add(1, Ordering::SeqCst);
        Ok(addr)
    }

    fn leave(&self, addr: usize) {
        if self.waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.mutex.compare_exchange(addr, 0, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.inner.destroy() } {
            warn!(error = %e, "failed to destroy condition variable");
        }
    }
}
