//! Counting semaphore emulated with a mutex and a condition variable.
//!
//! The count lives under the mutex and is the only record of the semaphore's
//! state. Timed waits use the condition variable's native timed wait and
//! re-arm it with whatever budget is left after a wakeup, so a waiter never
//! polls and no helper thread is involved.

use std::cell::UnsafeCell;
use std::time::{Duration, Instant};

use super::{RawCondvar, RawMutex, RawSemaphore};
use crate::{Error, Result, WaitResult};

pub struct Semaphore<M, C> {
    lock: M,
    cond: C,
    count: UnsafeCell<u32>,
}

unsafe impl<M: Send, C: Send> Send for Semaphore<M, C> {}
unsafe impl<M: Sync, C: Sync> Sync for Semaphore<M, C> {}

impl<M, C> Semaphore<M, C>
where
    M: RawMutex,
    C: RawCondvar<Mutex = M>,
{
    pub fn new(initial: u32) -> Result<Self> {
        let lock = M::new()?;
        let cond = match C::new() {
            Ok(cond) => cond,
            Err(e) => {
                unsafe {
                    let _ = lock.destroy();
                }
                return Err(e);
            }
        };
        Ok(Semaphore { lock, cond, count: UnsafeCell::new(initial) })
    }

    /// Runs `f` with the lock held. The lock is released on every path out,
    /// and an error from `f` wins over an error from the unlock.
    unsafe fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.lock.lock()?;
        let r = f();
        let unlocked = self.lock.unlock();
        let v = r?;
        unlocked.map(|()| v)
    }
}

impl<M, C> RawSemaphore for Semaphore<M, C>
where
    M: RawMutex,
    C: RawCondvar<Mutex = M>,
{
    unsafe fn wait(&self) -> Result<()> {
        self.locked(|| {
            let count = self.count.get();
            while *count == 0 {
                self.cond.wait(&self.lock)?;
            }
            *count -= 1;
            Ok(())
        })
    }

    unsafe fn try_wait(&self) -> Result<WaitResult> {
        self.locked(|| {
            let count = self.count.get();
            if *count == 0 {
                return Ok(WaitResult::TimedOut);
            }
            *count -= 1;
            Ok(WaitResult::Signaled)
        })
    }

    unsafe fn wait_timeout(&self, dur: Duration) -> Result<WaitResult> {
        if dur.is_zero() {
            return self.try_wait();
        }
        let deadline = match Instant::now().checked_add(dur) {
            Some(deadline) => deadline,
            None => return self.wait().map(|()| WaitResult::Signaled),
        };
        self.locked(|| {
            let count = self.count.get();
            loop {
                if *count > 0 {
                    *count -= 1;
                    return Ok(WaitResult::Signaled);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(WaitResult::TimedOut);
                }
                self.cond.wait_timeout(&self.lock, remaining)?;
            }
        })
    }

    unsafe fn value(&self) -> Result<u32> {
        self.locked(|| Ok(*self.count.get()))
    }

    unsafe fn post(&self) -> Result<()> {
        self.locked(|| {
            let count = self.count.get();
            *count = (*count).checked_add(1).ok_or(Error::Overflow)?;
            self.cond.signal()
        })
    }

    unsafe fn destroy(&self) -> Result<()> {
        let cond = self.cond.destroy();
        let lock = self.lock.destroy();
        cond.and(lock)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::sys::{EmulatedSemaphore, RawSemaphore};
    use crate::{Error, WaitResult};

    #[test]
    fn smoke() {
        let s = EmulatedSemaphore::new(1).unwrap();
        unsafe {
            s.wait().unwrap();
            assert_eq!(s.try_wait().unwrap(), WaitResult::TimedOut);
            s.post().unwrap();
            assert_eq!(s.value().unwrap(), 1);
            assert_eq!(s.try_wait().unwrap(), WaitResult::Signaled);
            s.destroy().unwrap();
        }
    }

    #[test]
    fn timeout_expires_without_post() {
        let s = EmulatedSemaphore::new(0).unwrap();
        let start = Instant::now();
        let r = unsafe { s.wait_timeout(Duration::from_millis(30)).unwrap() };
        assert_eq!(r, WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(unsafe { s.value().unwrap() }, 0);
    }

    #[test]
    fn post_wakes_blocked_waiter() {
        let s = Arc::new(EmulatedSemaphore::new(0).unwrap());
        let (tx, rx) = channel();
        let s2 = s.clone();
        let t = thread::spawn(move || {
            let r = unsafe { s2.wait_timeout(Duration::from_secs(30)).unwrap() };
            tx.send(r).unwrap();
        });
        thread::sleep(Duration::from_millis(20));
        unsafe { s.post().unwrap() };
        assert_eq!(rx.recv().unwrap(), WaitResult::Signaled);
        t.join().unwrap();
        assert_eq!(unsafe { s.value().unwrap() }, 0);
    }

    #[test]
    fn post_past_max_overflows() {
        let s = EmulatedSemaphore::new(u32::MAX).unwrap();
        unsafe {
            assert!(matches!(s.post(), Err(Error::Overflow)));
            assert_eq!(s.value().unwrap(), u32::MAX);
        }
    }

    #[test]
    fn destroyed_handle_is_invalid() {
        let s = EmulatedSemaphore::new(0).unwrap();
        unsafe {
            s.destroy().unwrap();
            s.destroy().unwrap();
            assert!(matches!(s.post(), Err(Error::InvalidHandle("mutex"))));
        }
    }
}
