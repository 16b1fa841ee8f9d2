use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use super::{RawCondvar, RawMutex, RawSemaphore};
use crate::{Error, Result, WaitResult};

use self::ffi::{CONDITION_VARIABLE, CRITICAL_SECTION};

const SPIN_COUNT: ffi::DWORD = 4000;

#[allow(non_snake_case)]
mod ffi {
    use libc::c_void;

    pub type BOOL = i32;
    pub type DWORD = u32;
    pub type LPCRITICAL_SECTION = *mut CRITICAL_SECTION;
    pub type LPCONDITION_VARIABLE = *mut CONDITION_VARIABLE;

    pub const INFINITE: DWORD = 0xFFFF_FFFF;
    pub const ERROR_TIMEOUT: i32 = 0x5B4;

    #[cfg(target_pointer_width = "32")]
    const CRITICAL_SECTION_SIZE: usize = 24;
    #[cfg(target_pointer_width = "64")]
    const CRITICAL_SECTION_SIZE: usize = 40;

    #[repr(C, align(8))]
    pub struct CRITICAL_SECTION { _opaque: [u8; CRITICAL_SECTION_SIZE] }

    #[repr(C)]
    pub struct CONDITION_VARIABLE { pub ptr: *mut c_void }

    extern "system" {
        pub fn InitializeCriticalSectionAndSpinCount(lpCriticalSection: LPCRITICAL_SECTION,
                                                     dwSpinCount: DWORD) -> BOOL;
        pub fn DeleteCriticalSection(lpCriticalSection: LPCRITICAL_SECTION);
        pub fn EnterCriticalSection(lpCriticalSection: LPCRITICAL_SECTION);
        pub fn LeaveCriticalSection(lpCriticalSection: LPCRITICAL_SECTION);
        pub fn TryEnterCriticalSection(lpCriticalSection: LPCRITICAL_SECTION) -> BOOL;

        pub fn InitializeConditionVariable(ConditionVariable: LPCONDITION_VARIABLE);
        pub fn SleepConditionVariableCS(ConditionVariable: LPCONDITION_VARIABLE,
                                        CriticalSection: LPCRITICAL_SECTION,
                                        dwMilliseconds: DWORD) -> BOOL;
        pub fn WakeConditionVariable(ConditionVariable: LPCONDITION_VARIABLE);
        pub fn WakeAllConditionVariable(ConditionVariable: LPCONDITION_VARIABLE);
    }
}

/// Milliseconds for a native wait, rounded up so a wait never ends before
/// `dur`, and capped just below `INFINITE`.
fn millis(dur: Duration) -> ffi::DWORD {
    let ms = dur.as_nanos().div_ceil(1_000_000);
    ms.min(u128::from(ffi::INFINITE - 1)) as ffi::DWORD
}

unsafe fn free_slot<T>(p: *mut T) {
    drop(Box::from_raw(p.cast::<MaybeUninit<T>>()));
}

fn alloc_slot<T>() -> *mut T {
    Box::into_raw(Box::new(MaybeUninit::<T>::uninit())).cast()
}

/// A critical section. Critical sections are recursive, so the façade layer
/// enforces exclusive ownership on top of this type.
pub struct Mutex { inner: AtomicPtr<CRITICAL_SECTION> }

impl Mutex {
    fn raw(&self) -> Result<ffi::LPCRITICAL_SECTION> {
        let p = self.inner.load(Ordering::Acquire);
        if p.is_null() { Err(Error::InvalidHandle("mutex")) } else { Ok(p) }
    }
}

impl RawMutex for Mutex {
    fn new() -> Result<Mutex> {
        let slot = alloc_slot::<CRITICAL_SECTION>();
        // Cannot fail on any supported Windows version.
        unsafe { ffi::InitializeCriticalSectionAndSpinCount(slot, SPIN_COUNT) };
        Ok(Mutex { inner: AtomicPtr::new(slot) })
    }

    unsafe fn lock(&self) -> Result<()> {
        ffi::EnterCriticalSection(self.raw()?);
        Ok(())
    }

    unsafe fn try_lock(&self) -> Result<bool> {
        Ok(ffi::TryEnterCriticalSection(self.raw()?) != 0)
    }

    unsafe fn unlock(&self) -> Result<()> {
        ffi::LeaveCriticalSection(self.raw()?);
        Ok(())
    }

    unsafe fn destroy(&self) -> Result<()> {
        let p = self.inner.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            ffi::DeleteCriticalSection(p);
            free_slot(p);
        }
        Ok(())
    }

    fn addr(&self) -> usize {
        self.inner.load(Ordering::Relaxed) as usize
    }
}

pub struct Condvar { inner: AtomicPtr<CONDITION_VARIABLE> }

impl Condvar {
    fn raw(&self) -> Result<ffi::LPCONDITION_VARIABLE> {
        let p = self.inner.load(Ordering::Acquire);
        if p.is_null() { Err(Error::InvalidHandle("condition variable")) } else { Ok(p) }
    }
}

impl RawCondvar for Condvar {
    type Mutex = Mutex;

    fn new() -> Result<Condvar> {
        let slot = alloc_slot::<CONDITION_VARIABLE>();
        unsafe { ffi::InitializeConditionVariable(slot) };
        Ok(Condvar { inner: AtomicPtr::new(slot) })
    }

    unsafe fn signal(&self) -> Result<()> {
        ffi::WakeConditionVariable(self.raw()?);
        Ok(())
    }

    unsafe fn broadcast(&self) -> Result<()> {
        ffi::WakeAllConditionVariable(self.raw()?);
        Ok(())
    }

    unsafe fn wait(&self, mutex: &Mutex) -> Result<()> {
        let cond = self.raw()?;
        if ffi::SleepConditionVariableCS(cond, mutex.raw()?, ffi::INFINITE) == 0 {
            return Err(Error::last_native("SleepConditionVariableCS"));
        }
        Ok(())
    }

    unsafe fn wait_timeout(&self, mutex: &Mutex, dur: Duration) -> Result<WaitResult> {
        let cond = self.raw()?;
        let lock = mutex.raw()?;
        if ffi::SleepConditionVariableCS(cond, lock, millis(dur)) != 0 {
            return Ok(WaitResult::Signaled);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(ffi::ERROR_TIMEOUT) {
            Ok(WaitResult::TimedOut)
        } else {
            Err(Error::Native { call: "SleepConditionVariableCS", source: err })
        }
    }

    unsafe fn destroy(&self) -> Result<()> {
        // Windows condition variables own no kernel resources.
        let p = self.inner.swap(ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            free_slot(p);
        }
        Ok(())
    }
}

// Windows semaphores cannot report their count, so counting semaphores are
// always emulated here.
pub fn native_semaphore(_initial: u32) -> Option<Result<Box<dyn RawSemaphore>>> {
    None
}
