use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{trace, warn};

use crate::sys::{self, RawMutex};
use crate::{Misuse, Result};

/// Identifies the calling thread. Zero never names a thread.
fn current_thread() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    thread_local!(static TOKEN: usize = NEXT.fetch_add(1, Ordering::Relaxed));
    TOKEN.with(|t| *t)
}

/// A mutual exclusion lock backed by the native OS mutex.
///
/// The mutex guards no data of its own; it orders whatever the caller
/// decides it protects. It can be used in two styles: explicit
/// [`acquire`](Mutex::acquire)/[`release`](Mutex::release) pairs, or the
/// RAII [`lock`](Mutex::lock) which hands back a [`MutexGuard`].
///
/// The lock is not recursive on any platform. Relocking from the owning
/// thread or releasing from another thread is reported as [`Misuse`].
///
/// # Example
///
/// ```rust
/// use native_sync::Mutex;
///
/// let m = Mutex::new().unwrap();
/// let guard = m.lock().unwrap();
/// // do some work
/// guard.unlock().unwrap();
/// ```
pub struct Mutex {
    inner: sys::Mutex,
    // Thread token of the current holder, zero when unlocked.
    owner: AtomicUsize,
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope), the lock will be released.
#[must_use]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    marker: PhantomData<*const ()>,
}

impl Mutex {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new() -> Result<Mutex> {
        let inner = sys::Mutex::new()?;
        trace!(addr = inner.addr(), "created mutex");
        Ok(Mutex { inner, owner: AtomicUsize::new(0) })
    }

    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    pub fn acquire(&self) -> Result<()> {
        let me = current_thread();
        // Only this thread ever stores `me`, so a relaxed read is exact here.
        if self.owner.load(Ordering::Relaxed) == me {
            return Err(Misuse::Relock.into());
        }
        unsafe { self.inner.lock()? };
        self.owner.store(me, Ordering::Relaxed);
        Ok(())
    }

    /// Attempts to acquire the mutex without blocking, returning whether it
    /// was acquired.
    pub fn try_acquire(&self) -> Result<bool> {
        let me = current_thread();
        if self.owner.load(Ordering::Relaxed) == me {
            return Ok(false);
        }
        if unsafe { self.inner.try_lock()? } {
            self.owner.store(me, Ordering::Relaxed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Releases the mutex. Fails if the calling thread does not hold it.
    pub fn release(&self) -> Result<()> {
        let me = current_thread();
        if self.owner.load(Ordering::Relaxed) != me {
            return Err(Misuse::NotOwner.into());
        }
        self.owner.store(0, Ordering::Relaxed);
        if let Err(e) = unsafe { self.inner.unlock() } {
            self.owner.store(me, Ordering::Relaxed);
            return Err(e);
        }
        Ok(())
    }

    /// Acquires the mutex and returns a guard that releases it when dropped.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        self.acquire()?;
        Ok(MutexGuard::new(self))
    }

    /// Attempts to acquire this lock.
    ///
    /// If the lock could not be acquired at this time, then `None` is
    /// returned. This function does not block.
    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_>>> {
        Ok(if self.try_acquire()? { Some(MutexGuard::new(self)) } else { None })
    }

    /// Whether the calling thread currently holds this mutex.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread()
    }

    /// Deallocates the native mutex, reporting any failure.
    ///
    /// A mutex still held through [`acquire`](Mutex::acquire) is reported as
    /// busy and its native object is leaked rather than destroyed.
    pub fn destroy(self) -> Result<()> {
        ManuallyDrop::new(self).destroy_native()
    }

    fn destroy_native(&self) -> Result<()> {
        if self.owner.load(Ordering::Relaxed) != 0 {
            return Err(Misuse::Busy("mutex").into());
        }
        trace!(addr = self.inner.addr(), "destroying mutex");
        unsafe { self.inner.destroy() }
    }

    pub(crate) fn raw(&self) -> &sys::Mutex {
        &self.inner
    }

    /// Bookkeeping around a condition variable wait, which releases the
    /// native lock for its duration.
    pub(crate) fn park_owner(&self) {
        self.owner.store(0, Ordering::Relaxed);
    }

    pub(crate) fn restore_owner(&self) {
        self.owner.store(current_thread(), Ordering::Relaxed);
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_native() {
            warn!(error = %e, "failed to destroy mutex");
        }
    }
}

impl<'a> MutexGuard<'a> {
    fn new(mutex: &'a Mutex) -> MutexGuard<'a> {
        MutexGuard { mutex, marker: PhantomData }
    }

    /// The mutex this guard holds.
    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }

    /// Releases the lock now, reporting any failure instead of logging it.
    pub fn unlock(self) -> Result<()> {
        let mutex = self.mutex;
        mem::forget(self);
        mutex.release()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.release() {
            warn!(error = %e, "failed to release mutex");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Mutex;
    use crate::{Error, Misuse};

    #[test]
    fn smoke() {
        let m = Mutex::new().unwrap();
        drop(m.lock().unwrap());
        drop(m.lock().unwrap());
    }

    #[test]
    fn acquire_release() {
        let m = Mutex::new().unwrap();
        m.acquire().unwrap();
        assert!(m.is_held_by_current_thread());
        m.release().unwrap();
        assert!(!m.is_held_by_current_thread());
    }

    #[test]
    fn destroy_fresh() {
        Mutex::new().unwrap().destroy().unwrap();
    }

    #[test]
    fn lots_and_lots() {
        const J: usize = 1000;
        const K: usize = 3;

        let m = Arc::new(Mutex::new().unwrap());
        // Only touched under `m`; the atomic just keeps the test safe code.
        let cnt = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = channel();
        for _ in 0..K * 2 {
            let (m, cnt, tx) = (m.clone(), cnt.clone(), tx.clone());
            thread::spawn(move || {
                for _ in 0..J {
                    let _g = m.lock().unwrap();
                    let v = cnt.load(Ordering::Relaxed);
                    cnt.store(v + 1, Ordering::Relaxed);
                }
                tx.send(()).unwrap();
            });
        }

        drop(tx);
        for _ in 0..K * 2 {
            rx.recv().unwrap();
        }
        assert_eq!(cnt.load(Ordering::Relaxed), J * K * 2);
    }

    #[test]
    fn try_lock() {
        let m = Mutex::new().unwrap();
        let g = m.try_lock().unwrap();
        assert!(g.is_some());
        assert!(m.try_lock().unwrap().is_none());
        drop(g);
        assert!(m.try_lock().unwrap().is_some());
    }

    #[test]
    fn second_thread_blocks_until_release() {
        let m = Arc::new(Mutex::new().unwrap());
        m.acquire().unwrap();

        let (tx, rx) = channel();
        let m2 = m.clone();
        let t = thread::spawn(move || {
            m2.acquire().unwrap();
            tx.send(()).unwrap();
            m2.release().unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        m.release().unwrap();
        rx.recv().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn relock_is_misuse() {
        let m = Mutex::new().unwrap();
        let _g = m.lock().unwrap();
        assert!(matches!(m.acquire(), Err(Error::Misuse(Misuse::Relock))));
        assert!(m.try_lock().unwrap().is_none());
    }

    #[test]
    fn foreign_release_is_misuse() {
        let m = Arc::new(Mutex::new().unwrap());
        assert!(matches!(m.release(), Err(Error::Misuse(Misuse::NotOwner))));

        m.acquire().unwrap();
        let m2 = m.clone();
        let r = thread::spawn(move || m2.release()).join().unwrap();
        assert!(matches!(r, Err(Error::Misuse(Misuse::NotOwner))));
        m.release().unwrap();
    }

    #[test]
    fn destroy_held_is_busy() {
        let m = Mutex::new().unwrap();
        m.acquire().unwrap();
        assert!(matches!(m.destroy(), Err(Error::Misuse(Misuse::Busy("mutex")))));
    }

    #[test]
    fn guard_unlock_reports() {
        let m = Mutex::new().unwrap();
        let g = m.lock().unwrap();
        assert!(std::ptr::eq(g.mutex(), &m));
        g.unlock().unwrap();
        assert!(!m.is_held_by_current_thread());
    }
}
