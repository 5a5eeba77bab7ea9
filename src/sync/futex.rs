//! Mutex built directly on atomic compare-exchange plus futex wait and wake.
//!
//! This mutex blocks OS threads, not fibers. Locking it from a fiber stalls the worker thread the
//! fiber runs on until the lock is acquired.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use static_assertions::assert_impl_all;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
// Locked, and there are or were waiters.
const CONTENDED: u32 = 2;

/// Sleeps if `*futex == expected`. It could return spuriously.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn wait(futex: &AtomicU32, expected: u32) {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
        )
    };
    if rc == -1 {
        let errno = errno::errno().0;
        debug_assert!(errno == libc::EAGAIN || errno == libc::EINTR, "futex wait failed: errno {}", errno);
    }
}

/// Wakes at most one thread sleeping on `futex`.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn wake_one(futex: &AtomicU32) {
    unsafe { libc::syscall(libc::SYS_futex, futex as *const AtomicU32, libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG, 1) };
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn wait(futex: &AtomicU32, expected: u32) {
    if futex.load(Ordering::Relaxed) == expected {
        std::thread::yield_now();
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn wake_one(_futex: &AtomicU32) {}

/// Mutual exclusion lock with three states: unlocked, locked, and locked with waiters.
///
/// Unlocking an uncontended mutex costs no syscall. Waiters provide no fairness.
pub struct Mutex<T: ?Sized> {
    state: AtomicU32,
    value: UnsafeCell<T>,
}

// SAFETY: Mutex hands out exclusive access to its value to one thread at a time.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

assert_impl_all!(Mutex<Vec<u8>>: Send, Sync);

/// RAII guard for [Mutex]. The mutex is unlocked when the guard drops.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

// SAFETY: Guard grants `&T` through `Deref`.
unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<T> Mutex<T> {
    /// Constructs an unlocked mutex.
    pub const fn new(value: T) -> Self {
        Mutex { state: AtomicU32::new(UNLOCKED), value: UnsafeCell::new(value) }
    }

    /// Consumes this mutex and returns underlying value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    // Returns old value like what C `atomic_compare_exchange_strong` leaves in `expected`.
    fn compare_exchange(&self, current: u32, new: u32) -> u32 {
        match self.state.compare_exchange(current, new, Ordering::Acquire, Ordering::Relaxed) {
            Ok(old) => old,
            Err(old) => old,
        }
    }

    /// Acquires this mutex, blocking current thread until it is able to do so.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut state = self.compare_exchange(UNLOCKED, LOCKED);
        if state != UNLOCKED {
            crate::fiber::note_blocking("Mutex::lock");
        }
        while state != UNLOCKED {
            // Announce that we are going to sleep, unless someone else has done it. If the mutex
            // is released in between, skip sleep and contend again.
            if state == CONTENDED || self.compare_exchange(LOCKED, CONTENDED) != UNLOCKED {
                wait(&self.state, CONTENDED);
            }
            // Wakeup does not imply ownership. Retry with CONTENDED as there could be other sleepers.
            state = self.compare_exchange(UNLOCKED, CONTENDED);
        }
        MutexGuard { mutex: self }
    }

    /// Attempts to acquire this mutex without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.compare_exchange(UNLOCKED, LOCKED) {
            UNLOCKED => Some(MutexGuard { mutex: self }),
            _ => None,
        }
    }

    /// Returns true if this mutex is held by someone.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Returns mutable reference to underlying value, no locking is needed as we own `&mut self`.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn unlock(&self) {
        if self.state.fetch_sub(1, Ordering::Release) != LOCKED {
            self.state.store(UNLOCKED, Ordering::Release);
            wake_one(&self.state);
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("locked", &self.is_locked()).finish_non_exhaustive()
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
