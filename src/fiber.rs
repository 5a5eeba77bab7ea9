//! Cooperative fibers which could hop between worker threads of a [ThreadPool].
//!
//! A fiber is a routine running on its own stack. It runs until it completes or suspends itself
//! through [yield_now], and could be resumed later, possibly on a different thread. A fiber bound
//! to a pool is resubmitted to that pool every time it yields, so it gets resumed by whichever
//! worker picks up the continuation. A fiber waiting on [Future] is parked instead, and resubmitted
//! only after it is woken.

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use derive_where::derive_where;
use num_enum::{IntoPrimitive, UnsafeFromPrimitive};
use static_assertions::assert_impl_all;

use crate::coroutine::{Coroutine, Status};
use crate::error::JoinError;
use crate::future::{self, Future};
use crate::pool::{self, ThreadPool};
use crate::StackSize;

static FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Fiber running on this thread. It is valid only while its `Fiber::resume` is on stack.
    static FIBER: Cell<Option<NonNull<Inner>>> = Cell::new(None);
}

// Thread locals are read through non inlined functions as a fiber could migrate to another thread
// across a suspension. Otherwise, compiler could reuse thread local address from before suspension.
#[inline(never)]
fn running() -> Option<NonNull<Inner>> {
    FIBER.with(|cell| cell.get())
}

struct Scope {
    previous: Option<NonNull<Inner>>,
}

impl Scope {
    #[inline(never)]
    fn enter(inner: &Inner) -> Scope {
        let previous = FIBER.with(|cell| cell.replace(Some(NonNull::from(inner))));
        Scope { previous }
    }
}

impl Drop for Scope {
    #[inline(never)]
    fn drop(&mut self) {
        FIBER.with(|cell| cell.set(self.previous));
    }
}

/// Lifecycle state of a [Fiber].
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, UnsafeFromPrimitive, strum::Display)]
pub enum State {
    /// Constructed but never resumed.
    Runnable = 0,
    /// Running on some thread.
    Running = 1,
    /// Suspended and waiting for next resume.
    Suspended = 2,
    /// Routine completed or panicked. This is terminal.
    Dead = 3,
}

// Wakeup handshake of a parked fiber between its resumer and its waker.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, UnsafeFromPrimitive)]
enum Wakeup {
    Idle = 0,
    // Fiber is suspending to park. Its resumer has not settled it yet.
    Parking = 1,
    // Suspended without continuation. Waker owns resumption.
    Parked = 2,
    // Woken before its resumer settles.
    Notified = 3,
}

struct Inner {
    id: u64,
    state: AtomicU8,
    wakeup: AtomicU8,
    pool: Option<pool::Handle>,
    // Accessed only by the thread that has claimed `State::Running`.
    coroutine: Box<Coroutine>,
}

// SAFETY: Coroutine is driven exclusively by the resumer that won the transition to running.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn state(&self) -> State {
        unsafe { State::from_unchecked(self.state.load(Ordering::Acquire)) }
    }

    fn publish(&self, state: State) {
        self.state.store(state.into(), Ordering::Release);
    }

    fn wakeup(&self) -> Wakeup {
        unsafe { Wakeup::from_unchecked(self.wakeup.load(Ordering::Acquire)) }
    }

    fn transit(&self, from: Wakeup, to: Wakeup) -> Result<(), Wakeup> {
        match self.wakeup.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(bits) => Err(unsafe { Wakeup::from_unchecked(bits) }),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Frames on a suspended stack are never unwound, values living there are leaked.
        if self.state() == State::Suspended {
            tracing::warn!(fiber = self.id, "fiber dropped while suspended, releasing its stack without unwinding");
        }
    }
}

/// Shared handle to a fiber.
///
/// A fiber lives as long as someone holds a handle to it. A pool bound fiber is held by its pool
/// while it is queued for resumption.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

assert_impl_all!(Fiber: Send, Sync);

impl Fiber {
    fn new(routine: Box<dyn FnOnce() + Send + 'static>, pool: Option<pool::Handle>, stack_size: StackSize) -> Fiber {
        let id = FIBER_ID.fetch_add(1, Ordering::Relaxed);
        let coroutine = Coroutine::new(routine, stack_size);
        let inner = Inner {
            id,
            state: AtomicU8::new(State::Runnable.into()),
            wakeup: AtomicU8::new(Wakeup::Idle.into()),
            pool,
            coroutine,
        };
        tracing::trace!(fiber = id, "fiber spawned");
        Fiber { inner: Arc::new(inner) }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Pool to which this fiber resubmits itself after suspension.
    pub fn pool(&self) -> Option<&pool::Handle> {
        self.inner.pool.as_ref()
    }

    fn claim(&self) -> bool {
        // Only its waker resumes a parked fiber.
        if self.inner.wakeup() == Wakeup::Parked {
            return false;
        }
        let mut state = self.inner.state();
        loop {
            match state {
                State::Dead => return false,
                State::Running => panic!("resume: fiber is already running"),
                State::Runnable | State::Suspended => {},
            }
            match self.inner.state.compare_exchange(
                state.into(),
                State::Running.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(bits) => state = unsafe { State::from_unchecked(bits) },
            }
        }
    }

    /// Runs this fiber on current thread until it suspends or completes.
    ///
    /// It is a no-op if this fiber is dead or parked on a [Future]. A pool bound fiber resubmits
    /// itself to its pool if it yields.
    ///
    /// # Panics
    /// Panics if this fiber is running.
    pub fn resume(&self) {
        if !self.claim() {
            return;
        }
        loop {
            let status = {
                let _scope = Scope::enter(&self.inner);
                self.inner.coroutine.resume()
            };
            match status {
                Status::Suspended => {
                    if self.settle() {
                        return;
                    }
                },
                Status::Completed => {
                    self.inner.publish(State::Dead);
                    tracing::trace!(fiber = self.id(), "fiber finished");
                    return;
                },
                Status::Created | Status::Running => unreachable!("fiber returned with coroutine status {:?}", status),
            }
        }
    }

    // Publishes suspension of this fiber. Returns false if this resumer should continue running it.
    fn settle(&self) -> bool {
        self.inner.publish(State::Suspended);
        if self.inner.wakeup() != Wakeup::Parking {
            self.reschedule();
            return true;
        }
        if self.inner.transit(Wakeup::Parking, Wakeup::Parked).is_ok() {
            tracing::trace!(fiber = self.id(), "fiber parked");
            return true;
        }
        // Notified while parking.
        self.inner.wakeup.store(Wakeup::Idle.into(), Ordering::Release);
        if self.pool().is_some() {
            self.reschedule();
            return true;
        }
        self.inner
            .state
            .compare_exchange(State::Suspended.into(), State::Running.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    }

    // Wakes this fiber from `park`. It is resumed on current thread if it has no pool.
    pub(crate) fn unpark(&self) {
        let previous = self.inner.wakeup.swap(Wakeup::Notified.into(), Ordering::AcqRel);
        if unsafe { Wakeup::from_unchecked(previous) } != Wakeup::Parked {
            return;
        }
        self.inner.wakeup.store(Wakeup::Idle.into(), Ordering::Release);
        tracing::trace!(fiber = self.id(), "fiber unparked");
        match self.pool() {
            Some(_) => self.reschedule(),
            None => self.resume(),
        }
    }

    fn reschedule(&self) {
        let Some(pool) = self.pool() else {
            return;
        };
        let fiber = self.clone();
        match pool.try_submit(Box::new(move || fiber.resume())) {
            Ok(()) => tracing::trace!(fiber = self.id(), pool = pool.id(), "fiber rescheduled"),
            Err(_) => tracing::warn!(fiber = self.id(), pool = pool.id(), "fiber continuation rejected by closed pool"),
        }
    }

    /// Suspends this fiber, returning control to its resumer.
    ///
    /// Returns after next resume, which could happen on a different thread.
    ///
    /// The handle this is called through stays on the fiber's stack while it is suspended. If it is
    /// the fiber's own handle, as from [current], the fiber keeps itself alive and is leaked silently
    /// should its pool close before the continuation runs. Prefer [yield_now] inside fibers.
    ///
    /// # Panics
    /// Panics if this fiber is not the one running on current thread.
    pub fn suspend(&self) {
        let this = NonNull::from(self.inner.as_ref());
        assert!(running() == Some(this), "suspend: fiber is not running on this thread");
        self.inner.coroutine.suspend();
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id()).field("state", &self.state()).finish()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Fiber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fiber {}

/// Builder for fibers.
#[derive(Default)]
pub struct Builder {
    stack_size: StackSize,
    pool: Option<pool::Handle>,
}

assert_impl_all!(Builder: Send);

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Specifies stack size for new fiber.
    pub fn stack_size(&mut self, stack_size: StackSize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    /// Binds new fiber to given pool.
    pub fn pool(&mut self, pool: pool::Handle) -> &mut Self {
        self.pool = Some(pool);
        self
    }

    /// Constructs a runnable fiber without running it. Caller resumes it through [Fiber::resume].
    ///
    /// Unlike [Builder::spawn], new fiber is bound only to explicitly specified pool.
    pub fn build<F>(&mut self, f: F) -> Fiber
    where
        F: FnOnce(),
        F: Send + 'static,
    {
        Fiber::new(Box::new(f), self.pool.clone(), self.stack_size)
    }

    /// Spawns a fiber and returns a [JoinHandle] for it.
    ///
    /// See [spawn] for more details.
    ///
    /// # Panics
    /// Panics if the bound pool is closed.
    pub fn spawn<F, T>(&mut self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone().or_else(ThreadPool::current);
        let (result, promise) = future::tied();
        let routine = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            promise.set_value(result.map_err(JoinError::new));
        });
        let fiber = Fiber::new(routine, pool, self.stack_size);
        match fiber.pool() {
            None => fiber.resume(),
            Some(pool) => {
                let first = fiber.clone();
                let accepted = pool.try_submit(Box::new(move || first.resume())).is_ok();
                assert!(accepted, "spawn: pool is closed");
            },
        }
        JoinHandle { fiber, result }
    }
}

/// JoinHandle provides method to retrieve result of associated fiber.
#[derive_where(Debug)]
pub struct JoinHandle<T> {
    fiber: Fiber,
    #[derive_where(skip)]
    result: Future<Result<T, JoinError>>,
}

assert_impl_all!(JoinHandle<()>: Send, Sync);

impl<T> JoinHandle<T> {
    /// Waits for result of associated fiber.
    ///
    /// The fiber could still be on its way to [State::Dead] after this returns. It suspends calling
    /// fiber if called inside a fiber, blocks calling thread otherwise.
    pub fn join(self) -> Result<T, JoinError> {
        self.result.get()
    }

    pub fn is_finished(&self) -> bool {
        self.fiber.state() == State::Dead
    }

    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }
}

/// Spawns a fiber and returns a [JoinHandle] for it.
///
/// When called from a worker thread of a [ThreadPool], new fiber is bound to that pool and queued
/// for running. Otherwise, it runs synchronously on calling thread until it completes or suspends,
/// after which it is up to the caller to resume it through [JoinHandle::fiber].
///
/// Panic from the fiber is caught and delivered through [JoinHandle::join].
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f)
}

/// Returns the fiber running on current thread.
#[inline(never)]
pub fn current() -> Option<Fiber> {
    let inner = running()?;
    // SAFETY: The pointer comes from a live `Arc` held by the resumer.
    unsafe {
        Arc::increment_strong_count(inner.as_ptr());
        Some(Fiber { inner: Arc::from_raw(inner.as_ptr()) })
    }
}

/// Suspends running fiber if any. It is a no-op outside fibers.
///
/// A pool bound fiber gets requeued to its pool, so other fibers and tasks get a chance to run.
pub fn yield_now() {
    try_yield();
}

// Suspends through raw pointer. A suspended fiber must not hold a reference to itself on its own
// stack, otherwise it could never be released.
#[inline(never)]
pub(crate) fn try_yield() -> bool {
    let Some(inner) = running() else {
        return false;
    };
    unsafe { inner.as_ref() }.coroutine.suspend();
    true
}

// Suspends running fiber without continuation until someone calls `Fiber::unpark`. A notification
// that arrives before the resumer settles the suspension is not lost. Returns false outside fibers.
#[inline(never)]
pub(crate) fn park() -> bool {
    let Some(inner) = running() else {
        return false;
    };
    let inner = unsafe { inner.as_ref() };
    match inner.transit(Wakeup::Idle, Wakeup::Parking) {
        Ok(()) => inner.coroutine.suspend(),
        Err(_) => inner.wakeup.store(Wakeup::Idle.into(), Ordering::Release),
    }
    true
}

pub(crate) fn in_fiber() -> bool {
    running().is_some()
}

/// Reports a wait that blocks the OS thread from inside a fiber.
pub(crate) fn note_blocking(operation: &'static str) {
    if let Some(inner) = running() {
        let id = unsafe { inner.as_ref() }.id;
        tracing::debug!(fiber = id, operation, "blocking OS thread from fiber");
    }
}
