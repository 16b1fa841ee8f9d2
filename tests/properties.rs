//! Behavioral properties shared by every backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use native_sync::semaphore::Backend;
use native_sync::{Condvar, Error, Misuse, Mutex, Semaphore, WaitResult};
use proptest::prelude::*;

const BACKENDS: [Backend; 2] = [Backend::Native, Backend::Emulated];

fn sem(backend: Backend, initial: u32) -> Semaphore {
    Semaphore::builder().initial(initial).backend(backend).build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// `n` waits on a semaphore created with `n` never block, and the next
    /// one finds the count exhausted.
    #[test]
    fn n_waits_on_n(n in 0u32..64, emulated in any::<bool>()) {
        let backend = if emulated { Backend::Emulated } else { Backend::Native };
        let s = sem(backend, n);
        prop_assert_eq!(s.value().unwrap(), n);
        for _ in 0..n {
            s.wait().unwrap();
        }
        prop_assert_eq!(s.value().unwrap(), 0);
        prop_assert_eq!(s.try_wait().unwrap(), WaitResult::TimedOut);
    }
}

#[test]
fn wait_past_count_blocks_until_post() {
    for backend in BACKENDS {
        let s = Arc::new(sem(backend, 2));
        s.wait().unwrap();
        s.wait().unwrap();

        let (tx, rx) = channel();
        let s2 = s.clone();
        let t = thread::spawn(move || {
            s2.wait().unwrap();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        s.post().unwrap();
        rx.recv().unwrap();
        t.join().unwrap();
    }
}

#[test]
fn timed_wait_returns_after_duration() {
    for backend in BACKENDS {
        let s = sem(backend, 0);
        let start = Instant::now();
        assert_eq!(s.wait_timeout(Duration::from_millis(40)).unwrap(), WaitResult::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(35), "{backend:?} returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{backend:?} returned after {elapsed:?}");
    }
}

#[test]
fn mutex_hands_over_between_threads() {
    let m = Arc::new(Mutex::new().unwrap());
    let inside = Arc::new(AtomicBool::new(false));
    m.acquire().unwrap();

    let (m2, inside2) = (m.clone(), inside.clone());
    let t = thread::spawn(move || {
        let _g = m2.lock().unwrap();
        inside2.store(true, Ordering::SeqCst);
    });
    thread::sleep(Duration::from_millis(30));
    assert!(!inside.load(Ordering::SeqCst));
    m.release().unwrap();
    t.join().unwrap();
    assert!(inside.load(Ordering::SeqCst));
}

#[test]
fn signalled_waiter_sees_mutation() {
    let m = Arc::new(Mutex::new().unwrap());
    let c = Arc::new(Condvar::new().unwrap());
    let value = Arc::new(AtomicUsize::new(0));

    let g = m.lock().unwrap();
    let (m2, c2, value2) = (m.clone(), c.clone(), value.clone());
    let t = thread::spawn(move || {
        let _g = m2.lock().unwrap();
        value2.store(42, Ordering::Relaxed);
        c2.signal().unwrap();
    });
    while value.load(Ordering::Relaxed) != 42 {
        c.wait(&g).unwrap();
    }
    assert!(m.is_held_by_current_thread());
    assert_eq!(value.load(Ordering::Relaxed), 42);
    drop(g);
    t.join().unwrap();
}

#[test]
fn broadcast_releases_all_waiters() {
    const N: usize = 8;

    let m = Arc::new(Mutex::new().unwrap());
    let c = Arc::new(Condvar::new().unwrap());
    let generation = Arc::new(AtomicUsize::new(0));
    let parked = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..N)
        .map(|_| {
            let (m, c, generation, parked) =
                (m.clone(), c.clone(), generation.clone(), parked.clone());
            thread::spawn(move || {
                m.acquire().unwrap();
                parked.fetch_add(1, Ordering::Relaxed);
                while generation.load(Ordering::Relaxed) == 0 {
                    c.wait_held(&m).unwrap();
                }
                m.release().unwrap();
            })
        })
        .collect();

    while parked.load(Ordering::Relaxed) < N {
        thread::yield_now();
    }
    m.acquire().unwrap();
    generation.store(1, Ordering::Relaxed);
    c.broadcast().unwrap();
    m.release().unwrap();

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn fresh_mutex_destroys_cleanly() {
    for _ in 0..16 {
        Mutex::new().unwrap().destroy().unwrap();
    }
}

#[test]
fn condvar_wait_requires_the_mutex() {
    let m = Mutex::new().unwrap();
    let c = Condvar::new().unwrap();
    let err = c.wait_held(&m).unwrap_err();
    assert!(err.is_misuse());
    assert!(matches!(err, Error::Misuse(Misuse::NotOwner)));
}
