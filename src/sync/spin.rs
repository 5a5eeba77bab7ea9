//! Spin lock which yields running fiber on contention.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use static_assertions::assert_impl_all;

use crate::fiber;

/// Exclusive lock that never blocks OS threads.
///
/// A contending fiber gives its worker thread back to its pool through [fiber::yield_now] before
/// retrying, so the holder gets a chance to run even on a single worker. Outside fibers, it
/// busy spins. There is no waiter queue, hence no fairness.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: SpinLock hands out exclusive access to its value to one holder at a time.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

assert_impl_all!(SpinLock<Vec<u8>>: Send, Sync);

/// RAII guard for [SpinLock]. The lock is released when the guard drops.
///
/// It is fine to hold a guard across suspension points. The guard could be released on a
/// different thread than the one acquired it.
#[must_use = "if unused the SpinLock will immediately unlock"]
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock { locked: AtomicBool::new(false), value: UnsafeCell::new(value) }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    fn acquire(&self) -> bool {
        self.locked.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    /// Acquires this lock, yielding current fiber until it is able to do so.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while !self.acquire() {
            if !fiber::try_yield() {
                std::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.acquire().then(|| SpinLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock").field("locked", &self.is_locked()).finish_non_exhaustive()
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::pool::ThreadPool;

    #[test]
    fn try_lock() {
        let lock = SpinLock::new(1);
        let guard = lock.try_lock().unwrap();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        *lock.lock() += 1;
        assert_eq!(lock.into_inner(), 2);
    }

    #[test]
    fn mutual_exclusion_threads() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 5000;
        let counter = Arc::new(SpinLock::new(0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let mut guard = counter.lock();
                        let value = *guard;
                        std::hint::black_box(&value);
                        *guard = value + 1;
                    }
                })
            })
            .collect();
        handles.into_iter().for_each(|handle| handle.join().unwrap());
        assert_eq!(*counter.lock(), THREADS * ITERATIONS);
    }

    #[test]
    fn mutual_exclusion_fibers() {
        const FIBERS: usize = 16;
        const ITERATIONS: usize = 200;
        let pool = ThreadPool::new(4);
        let counter = Arc::new(SpinLock::new(0usize));
        for _ in 0..FIBERS {
            let counter = counter.clone();
            pool.spawn(move || {
                for _ in 0..ITERATIONS {
                    let mut guard = counter.lock();
                    let value = *guard;
                    // Hold the lock across a suspension point to force contention.
                    fiber::yield_now();
                    *guard = value + 1;
                }
            });
        }
        pool.wait();
        assert_eq!(*counter.lock(), FIBERS * ITERATIONS);
    }

    #[test]
    fn contention_on_single_worker() {
        let pool = ThreadPool::new(1);
        let lock = Arc::new(SpinLock::new(()));
        let entered = Arc::new(AtomicUsize::new(0));
        let holder = pool.spawn({
            let lock = lock.clone();
            let entered = entered.clone();
            move || {
                let _guard = lock.lock();
                entered.fetch_add(1, Ordering::SeqCst);
                // Contender runs on the only worker while we are holding the lock.
                while entered.load(Ordering::SeqCst) < 2 {
                    fiber::yield_now();
                }
            }
        });
        let contender = pool.spawn({
            let lock = lock.clone();
            let entered = entered.clone();
            move || {
                while entered.load(Ordering::SeqCst) == 0 {
                    fiber::yield_now();
                }
                entered.fetch_add(1, Ordering::SeqCst);
                drop(lock.lock());
            }
        });
        holder.join().unwrap();
        contender.join().unwrap();
        assert!(!lock.is_locked());
    }
}
