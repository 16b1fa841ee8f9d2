use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use super::{RawCondvar, RawMutex, RawSemaphore};
use crate::{Error, Misuse, Result, WaitResult};

// Condition variables time out against the monotonic clock where the
// platform lets us pick one.
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// The pthread family returns the error code instead of setting errno.
fn cvt_nz(call: &'static str, r: libc::c_int) -> Result<()> {
    if r == 0 { Ok(()) } else { Err(Error::native(call, r)) }
}

/// Absolute time `dur` from now on `clock`, or `None` if it does not fit in
/// a `timespec`.
fn deadline(clock: libc::clockid_t, dur: Duration) -> Result<Option<libc::timespec>> {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) } != 0 {
        return Err(Error::last_native("clock_gettime"));
    }
    let mut ts = unsafe { ts.assume_init() };

    let secs = match libc::time_t::try_from(dur.as_secs()) {
        Ok(secs) => secs,
        Err(_) => return Ok(None),
    };
    let mut nsec = ts.tv_nsec as i64 + i64::from(dur.subsec_nanos());
    let mut carry = 0;
    if nsec >= 1_000_000_000 {
        nsec -= 1_000_000_000;
        carry = 1;
    }
    match ts.tv_sec.checked_add(secs).and_then(|s| s.checked_add(carry)) {
        Some(sec) => {
            ts.tv_sec = sec;
            ts.tv_nsec = nsec as _;
            Ok(Some(ts))
        }
        None => Ok(None),
    }
}

/// Frees a heap slot whose native object is uninitialized or destroyed.
unsafe fn free_slot<T>(p: *mut T) {
    drop(Box::from_raw(p.cast::<MaybeUninit<T>>()));
}

fn alloc_slot<T>() -> *mut T {
    Box::into_raw(Box::new(MaybeUninit::<T>::uninit())).cast()
}

pub struct Mutex { inner: AtomicPtr<libc::pthread_mutex_t> }

struct MutexAttr(MaybeUninit<libc::pthread_mutexattr_t>);

impl Drop for MutexAttr {
    fn drop(&mut self) {
        unsafe {
            let r = libc::pthread_mutexattr_destroy(self.0.as_mut_ptr());
            debug_assert_eq!(r, 0);
        }
    }
}

impl Mutex {
    fn raw(&self) -> Result<*mut libc::pthread_mutex_t> {
        let p = self.inner.load(Ordering::Acquire);
        if p.is_null() { Err(Error::InvalidHandle("mutex")) } else { Ok(p) }
    }
}

impl RawMutex for Mutex {
    fn new() -> Result<Mutex> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            let r = libc::pthread_mutexattr_init(attr.as_mut_ptr());
            if r != 0 {
                return Err(Error::creation("mutex", "pthread_mutexattr_init", r));
            }
            let mut attr = MutexAttr(attr);
            // Error checking turns relock and foreign unlock into error codes
            // instead of deadlock or undefined behavior.
            let r = libc::pthread_mutexattr_settype(attr.0.as_mut_ptr(),
                                                    libc::PTHREAD_MUTEX_ERRORCHECK);
            cvt_nz("pthread_mutexattr_settype", r)?;

            let slot = alloc_slot::<libc::pthread_mutex_t>();
            let r = libc::pthread_mutex_init(slot, attr.0.as_ptr());
            if r != 0 {
                free_slot(slot);
                return Err(Error::creation("mutex", "pthread_mutex_init", r));
            }
            Ok(Mutex { inner: AtomicPtr::new(slot) })
        }
    }

    unsafe fn lock(&self) -> Result<()> {
        match libc::pthread_mutex_lock(self.raw()?) {
            0 => Ok(()),
            libc::EDEADLK => Err(Misuse::Relock.into()),
            r => Err(Error::native("pthread_mutex_lock", r)),
        }
    }

    unsafe fn try_lock(&self) -> Result<bool> {
        match libc::pthread_mutex_trylock(self.raw()?) {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            r => Err(Error::native("pthread_mutex_trylock", r)),
        }
    }

    unsafe fn unlock(&self) -> Result<()> {
        match libc::pthread_mutex_unlock(self.raw()?) {
            0 => Ok(()),
            libc::EPERM => Err(Misuse::NotOwner.into()),
            r => Err(Error::native("pthread_mutex_unlock", r)),
        }
    }

    unsafe fn destroy(&self) -> Result<()> {
        let p = self.inner.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return Ok(());
        }
        match libc::pthread_mutex_destroy(p) {
            0 => {
                free_slot(p);
                Ok(())
            }
            libc::EBUSY => {
                self.inner.store(p, Ordering::Release);
                Err(Misuse::Busy("mutex").into())
            }
            // The native object is in an unknown state; leak it.
            r => Err(Error::native("pthread_mutex_destroy", r)),
        }
    }

    fn addr(&self) -> usize {
        self.inner.load(Ordering::Relaxed) as usize
    }
}

pub struct Condvar { inner: AtomicPtr<libc::pthread_cond_t> }

impl Condvar {
    fn raw(&self) -> Result<*mut libc::pthread_cond_t> {
        let p = self.inner.load(Ordering::Acquire);
        if p.is_null() { Err(Error::InvalidHandle("condition variable")) } else { Ok(p) }
    }
}

impl RawCondvar for Condvar {
    type Mutex = Mutex;

    fn new() -> Result<Condvar> {
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            let r = libc::pthread_condattr_init(attr.as_mut_ptr());
            if r != 0 {
                return Err(Error::creation("condition variable", "pthread_condattr_init", r));
            }
            #[cfg(not(any(target_os = "macos", target_os = "ios")))]
            {
                let r = libc::pthread_condattr_setclock(attr.as_mut_ptr(), COND_CLOCK);
                if r != 0 {
                    libc::pthread_condattr_destroy(attr.as_mut_ptr());
                    return Err(Error::native("pthread_condattr_setclock", r));
                }
            }

            let slot = alloc_slot::<libc::pthread_cond_t>();
            let r = libc::pthread_cond_init(slot, attr.as_ptr());
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            if r != 0 {
                free_slot(slot);
                return Err(Error::creation("condition variable", "pthread_cond_init", r));
            }
            Ok(Condvar { inner: AtomicPtr::new(slot) })
        }
    }

    unsafe fn signal(&self) -> Result<()> {
        cvt_nz("pthread_cond_signal", libc::pthread_cond_signal(self.raw()?))
    }

    unsafe fn broadcast(&self) -> Result<()> {
        cvt_nz("pthread_cond_broadcast", libc::pthread_cond_broadcast(self.raw()?))
    }

    unsafe fn wait(&self, mutex: &Mutex) -> Result<()> {
        let cond = self.raw()?;
        let r = libc::pthread_cond_wait(cond, mutex.raw()?);
        cvt_nz("pthread_cond_wait", r)
    }

    unsafe fn wait_timeout(&self, mutex: &Mutex, dur: Duration) -> Result<WaitResult> {
        let cond = self.raw()?;
        let lock = mutex.raw()?;
        let abstime = match deadline(COND_CLOCK, dur)? {
            Some(t) => t,
            None => {
                self.wait(mutex)?;
                return Ok(WaitResult::Signaled);
            }
        };
        match libc::pthread_cond_timedwait(cond, lock, &abstime) {
            0 => Ok(WaitResult::Signaled),
            libc::ETIMEDOUT => Ok(WaitResult::TimedOut),
            r => Err(Error::native("pthread_cond_timedwait", r)),
        }
    }

    unsafe fn destroy(&self) -> Result<()> {
        let p = self.inner.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return Ok(());
        }
        match libc::pthread_cond_destroy(p) {
            0 => {
                free_slot(p);
                Ok(())
            }
            libc::EBUSY => {
                self.inner.store(p, Ordering::Release);
                Err(Misuse::Busy("condition variable").into())
            }
            r => Err(Error::native("pthread_cond_destroy", r)),
        }
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub use self::posix::Semaphore;

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub fn native_semaphore(initial: u32) -> Option<Result<Box<dyn RawSemaphore>>> {
    Some(Semaphore::new(initial).map(|s| Box::new(s) as Box<dyn RawSemaphore>))
}

// Unnamed POSIX semaphores are not implemented on Apple platforms.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn native_semaphore(_initial: u32) -> Option<Result<Box<dyn RawSemaphore>>> {
    None
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
mod posix {
    use std::ptr;
    use std::sync::atomic::{AtomicPtr, Ordering};
    use std::time::{Duration, Instant};

    use super::{alloc_slot, deadline, errno, free_slot};
    use crate::sys::RawSemaphore;
    use crate::{Error, Result, WaitResult};

    /// `SEM_VALUE_MAX` on every libc we target.
    pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

    pub struct Semaphore { inner: AtomicPtr<libc::sem_t> }

    impl Semaphore {
        pub fn new(initial: u32) -> Result<Semaphore> {
            if initial > SEM_VALUE_MAX {
                return Err(Error::InvalidArgument("initial value exceeds SEM_VALUE_MAX"));
            }
            unsafe {
                let slot = alloc_slot::<libc::sem_t>();
                if libc::sem_init(slot, 0, initial as libc::c_uint) != 0 {
                    let e = errno();
                    free_slot(slot);
                    return Err(match e {
                        libc::ENOSPC => Error::ResourceExhausted("semaphore"),
                        e => Error::creation("semaphore", "sem_init", e),
                    });
                }
                Ok(Semaphore { inner: AtomicPtr::new(slot) })
            }
        }

        fn raw(&self) -> Result<*mut libc::sem_t> {
            let p = self.inner.load(Ordering::Acquire);
            if p.is_null() { Err(Error::InvalidHandle("semaphore")) } else { Ok(p) }
        }
    }

    impl RawSemaphore for Semaphore {
        unsafe fn wait(&self) -> Result<()> {
            let p = self.raw()?;
            loop {
                if libc::sem_wait(p) == 0 {
                    return Ok(());
                }
                match errno() {
                    libc::EINTR => continue,
                    e => return Err(Error::native("sem_wait", e)),
                }
            }
        }

        unsafe fn try_wait(&self) -> Result<WaitResult> {
            let p = self.raw()?;
            loop {
                if libc::sem_trywait(p) == 0 {
                    return Ok(WaitResult::Signaled);
                }
                match errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN => return Ok(WaitResult::TimedOut),
                    e => return Err(Error::native("sem_trywait", e)),
                }
            }
        }

        unsafe fn wait_timeout(&self, dur: Duration) -> Result<WaitResult> {
            if dur.is_zero() {
                return self.try_wait();
            }
            let p = self.raw()?;
            // sem_timedwait only understands the realtime clock. A forward
            // step of the wall clock would cut the wait short, so expiry is
            // confirmed against the monotonic clock and the deadline re-armed
            // with what is left. A backward step still stretches the wait.
            let start = Instant::now();
            let mut remaining = dur;
            loop {
                let abstime = match deadline(libc::CLOCK_REALTIME, remaining)? {
                    Some(t) => t,
                    None => return self.wait().map(|()| WaitResult::Signaled),
                };
                if libc::sem_timedwait(p, &abstime) == 0 {
                    return Ok(WaitResult::Signaled);
                }
                match errno() {
                    libc::EINTR => {}
                    libc::ETIMEDOUT => {
                        remaining = dur.saturating_sub(start.elapsed());
                        if remaining.is_zero() {
                            return Ok(WaitResult::TimedOut);
                        }
                    }
                    e => return Err(Error::native("sem_timedwait", e)),
                }
            }
        }

        unsafe fn value(&self) -> Result<u32> {
            let mut v: libc::c_int = 0;
            if libc::sem_getvalue(self.raw()?, &mut v) != 0 {
                return Err(Error::last_native("sem_getvalue"));
            }
            // Some platforms report waiters as a negative count.
            Ok(v.max(0) as u32)
        }

        unsafe fn post(&self) -> Result<()> {
            if libc::sem_post(self.raw()?) == 0 {
                return Ok(());
            }
            match errno() {
                libc::EOVERFLOW => Err(Error::Overflow),
                e => Err(Error::native("sem_post", e)),
            }
        }

        unsafe fn destroy(&self) -> Result<()> {
            let p = self.inner.swap(ptr::null_mut(), Ordering::AcqRel);
            if p.is_null() {
                return Ok(());
            }
            if libc::sem_destroy(p) != 0 {
                let e = errno();
                if e == libc::EBUSY {
                    self.inner.store(p, Ordering::Release);
                    return Err(crate::Misuse::Busy("semaphore").into());
                }
                return Err(Error::native("sem_destroy", e));
            }
            free_slot(p);
            Ok(())
        }
    }
}
