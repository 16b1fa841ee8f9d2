//! The thinnest cross-platform layer over OS synchronization objects.
//!
//! Each primitive is described by a trait carrying its fixed operation set.
//! Exactly one platform module implements the traits for the target being
//! built; [`generic`] builds what a platform lacks out of the other two.
//!
//! All operations are unsafe: behavior is undefined if a handle is destroyed
//! while another thread is still using it. A handle that has been destroyed
//! reports [`Error::InvalidHandle`](crate::Error::InvalidHandle) and a second
//! `destroy` is a no-op.

#![allow(non_camel_case_types)]

use std::time::Duration;

use crate::{Result, WaitResult};

pub use self::imp::{Condvar, Mutex};

pub mod generic;

#[cfg(unix)]
#[path = "unix.rs"]
mod imp;
#[cfg(windows)]
#[path = "windows.rs"]
mod imp;

/// An OS-based mutual exclusion lock.
pub trait RawMutex: Sized + Send + Sync {
    /// Creates a new, unlocked mutex.
    fn new() -> Result<Self>;

    /// Locks the mutex, blocking the current thread until it is available.
    unsafe fn lock(&self) -> Result<()>;

    /// Attempts to lock the mutex without blocking, returning whether it was
    /// acquired.
    unsafe fn try_lock(&self) -> Result<bool>;

    /// Unlocks the mutex.
    ///
    /// Behavior is undefined if the current thread does not hold the mutex.
    unsafe fn unlock(&self) -> Result<()>;

    /// Deallocates the native object.
    unsafe fn destroy(&self) -> Result<()>;

    /// A stable identity for the native object, used to detect pairing a
    /// condition variable with more than one mutex.
    fn addr(&self) -> usize;
}

/// An OS-based condition variable paired with [`RawCondvar::Mutex`].
pub trait RawCondvar: Sized + Send + Sync {
    type Mutex: RawMutex;

    fn new() -> Result<Self>;

    /// Wakes at most one waiter.
    unsafe fn signal(&self) -> Result<()>;

    /// Wakes every current waiter.
    unsafe fn broadcast(&self) -> Result<()>;

    /// Atomically releases `mutex` and blocks until signalled. The mutex is
    /// held again on return, including on error.
    ///
    /// Behavior is undefined if the mutex is not locked by the current thread.
    unsafe fn wait(&self, mutex: &Self::Mutex) -> Result<()>;

    /// Same as [`RawCondvar::wait`], giving up once `dur` has elapsed.
    unsafe fn wait_timeout(&self, mutex: &Self::Mutex, dur: Duration) -> Result<WaitResult>;

    unsafe fn destroy(&self) -> Result<()>;
}

/// A counting semaphore.
pub trait RawSemaphore: Send + Sync {
    /// Blocks until the count is positive, then decrements it.
    unsafe fn wait(&self) -> Result<()>;

    /// Decrements the count if it is positive, without blocking.
    unsafe fn try_wait(&self) -> Result<WaitResult>;

    /// Same as [`RawSemaphore::wait`], giving up once `dur` has elapsed.
    unsafe fn wait_timeout(&self, dur: Duration) -> Result<WaitResult>;

    /// The current count. May be stale as soon as it is returned.
    unsafe fn value(&self) -> Result<u32>;

    /// Increments the count, waking one waiter if any.
    unsafe fn post(&self) -> Result<()>;

    unsafe fn destroy(&self) -> Result<()>;
}

/// Semaphore built from this platform's mutex and condition variable.
pub type EmulatedSemaphore = generic::Semaphore<Mutex, Condvar>;

/// Creates the platform's native counting semaphore, or `None` when the
/// platform has no usable one.
pub fn native_semaphore(initial: u32) -> Option<Result<Box<dyn RawSemaphore>>> {
    imp::native_semaphore(initial)
}

/// Creates a semaphore emulated on top of [`Mutex`] and [`Condvar`].
pub fn emulated_semaphore(initial: u32) -> Result<Box<dyn RawSemaphore>> {
    Ok(Box::new(EmulatedSemaphore::new(initial)?))
}
