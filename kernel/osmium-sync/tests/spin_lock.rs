use std::sync::Arc;
use std::thread;

use osmium_sync::SpinLock;

#[test]
fn uncontended_lock_and_mutate() {
    let lock = SpinLock::new(41);
    {
        let mut g = lock.lock();
        *g += 1;
    }
    assert_eq!(*lock.lock(), 42);
}

#[test]
fn try_lock_fails_while_held() {
    let lock = SpinLock::new(());
    let g = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(g);
    assert!(lock.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_result() {
    let lock = SpinLock::new(String::from("page"));
    let len = lock.with_lock(|s| {
        s.push_str(" stack");
        s.len()
    });
    assert_eq!(len, 10);
    assert_eq!(&*lock.lock(), "page stack");
}

#[test]
fn get_mut_needs_no_guard() {
    let mut lock = SpinLock::new(7);
    *lock.get_mut() = 11;
    assert_eq!(lock.into_inner(), 11);
}

#[test]
fn contended_increments_are_exact() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 10_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let lock = Arc::clone(&lock);
        handles.push(thread::spawn(move || {
            for _ in 0..PER_THREAD {
                *lock.lock() += 1;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*lock.lock(), THREADS * PER_THREAD);
}

#[test]
fn lock_is_released_when_a_holder_panics() {
    let lock = Arc::new(SpinLock::new(0));
    let poisoned = Arc::clone(&lock);
    let result = thread::spawn(move || {
        let _g = poisoned.lock();
        panic!("holder dies");
    })
    .join();
    assert!(result.is_err());
    // The guard's drop ran during unwind, so the lock is free again.
    assert!(lock.try_lock().is_some());
}
