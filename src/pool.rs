//! Fixed size thread pool which serves tasks and fibers.

use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use ignore_result::Ignore;
use static_assertions::assert_impl_all;

use crate::error::panic_message;
use crate::fiber::{self, JoinHandle};
use crate::sync::{ClosableQueue, WaitGroup};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

static POOL_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_NAME: &str = "spindle-worker";

thread_local! {
    static POOL: RefCell<Option<Handle>> = RefCell::new(None);
}

struct Scope {}

impl Scope {
    fn enter(handle: Handle) -> Scope {
        POOL.with(|cell| {
            let mut current = cell.borrow_mut();
            assert!(current.is_none(), "thread pool existed");
            *current = Some(handle);
        });
        Scope {}
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        POOL.with(|cell| {
            assert!(cell.borrow_mut().take().is_some(), "thread pool does not exist");
        });
    }
}

/// Builder for [ThreadPool].
#[derive(Default)]
pub struct Builder {
    parallelism: Option<usize>,
    name: Option<String>,
}

impl Builder {
    /// Specifies the number of worker threads.
    pub fn parallelism(&mut self, n: usize) -> &mut Self {
        assert!(n > 0, "parallelism must not be zero");
        self.parallelism = Some(n);
        self
    }

    /// Specifies name prefix for worker threads.
    pub fn name(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.name = Some(prefix.into());
        self
    }

    /// Constructs a [ThreadPool] with all its workers started.
    pub fn build(&mut self) -> ThreadPool {
        let parallelism = self
            .parallelism
            .unwrap_or_else(|| thread::available_parallelism().map_or(4, NonZeroUsize::get));
        let prefix = self.name.as_deref().unwrap_or(DEFAULT_NAME);
        let shared = Arc::new(Shared {
            id: POOL_ID.fetch_add(1, Ordering::Relaxed),
            parallelism,
            tasks: ClosableQueue::new(),
            pending: WaitGroup::new(),
        });
        let workers = (0..parallelism)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", prefix, index))
                    .spawn(move || shared.serve(index))
                    .unwrap_or_else(|err| panic!("fail to spawn pool worker: {}", err))
            })
            .collect();
        tracing::debug!(pool = shared.id, parallelism, "thread pool started");
        ThreadPool { handle: Handle { shared }, workers }
    }
}

struct Shared {
    id: u64,
    parallelism: usize,
    tasks: ClosableQueue<Task>,
    // Submitted but not yet completed tasks.
    pending: WaitGroup,
}

impl Shared {
    fn serve(self: Arc<Shared>, index: usize) {
        let _scope = Scope::enter(Handle { shared: self.clone() });
        tracing::debug!(pool = self.id, worker = index, "worker started");
        while let Some(task) = self.tasks.pop() {
            if let Err(err) = panic::catch_unwind(AssertUnwindSafe(task)) {
                tracing::error!(pool = self.id, worker = index, "task panicked: {}", panic_message(&err).unwrap_or(".."));
            }
            self.pending.done();
        }
        tracing::debug!(pool = self.id, worker = index, "worker stopped");
    }
}

/// Shared handle to a [ThreadPool] to submit tasks and wait for them.
///
/// It does not keep the pool running. Tasks submitted after the pool is shut down are dropped.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

assert_impl_all!(Handle: Send, Sync);

impl Handle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn parallelism(&self) -> usize {
        self.shared.parallelism
    }

    pub(crate) fn try_submit(&self, task: Task) -> Result<(), Task> {
        self.shared.pending.add(1);
        self.shared.tasks.try_push(task).map_err(|task| {
            self.shared.pending.done();
            task
        })
    }

    /// Submits a task to run on some worker thread.
    ///
    /// It is safe to call from anywhere. The task is dropped silently if the pool is closed.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(),
        F: Send + 'static,
    {
        if let Err(task) = self.try_submit(Box::new(task)) {
            drop(task);
            tracing::debug!(pool = self.id(), "task dropped by closed pool");
        }
    }

    /// Spawns a fiber bound to this pool and returns a [JoinHandle] for it.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        fiber::Builder::new().pool(self.clone()).spawn(f)
    }

    /// Blocks until all tasks submitted so far have completed, including tasks they submit.
    ///
    /// Fibers bound to this pool count as pending tasks until they complete.
    ///
    /// # Panics
    /// Panics if called from a worker of this pool, as it would wait for itself.
    pub fn wait(&self) {
        let current = ThreadPool::current();
        assert!(
            !current.is_some_and(|pool| Arc::ptr_eq(&pool.shared, &self.shared)),
            "wait: called from a worker of the same pool"
        );
        self.shared.pending.wait();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tasks.is_closed()
    }
}

/// Fixed set of worker threads consuming tasks from a shared queue.
///
/// Dropping it closes the task queue, lets workers drain queued tasks and joins them. Fibers which
/// suspend after that are never resumed.
pub struct ThreadPool {
    handle: Handle,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Constructs a pool with given number of workers.
    pub fn new(parallelism: usize) -> ThreadPool {
        Builder::default().parallelism(parallelism).build()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Returns the pool whose worker is the calling thread.
    #[inline(never)]
    pub fn current() -> Option<Handle> {
        POOL.with(|cell| cell.borrow().clone())
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn parallelism(&self) -> usize {
        self.handle.parallelism()
    }

    /// See [Handle::submit].
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(),
        F: Send + 'static,
    {
        self.handle.submit(task)
    }

    /// See [Handle::spawn].
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn(f)
    }

    /// See [Handle::wait].
    pub fn wait(&self) {
        self.handle.wait()
    }

    /// Closes this pool and joins all its workers after queued tasks drained.
    pub fn shutdown(self) {
        drop(self)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.handle.shared.tasks.close();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // Pool could be dropped by its own task.
            if worker.thread().id() != current {
                worker.join().ignore();
            }
        }
        tracing::debug!(pool = self.handle.id(), "thread pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use pretty_assertions::{assert_eq, assert_ne};

    use super::*;

    thread_local! {
        static LOCAL_SECRET: Cell<usize> = Cell::new(0);
    }

    #[test]
    #[should_panic(expected = "parallelism must not be zero")]
    fn builder_parallelism_zero() {
        Builder::default().parallelism(0).build();
    }

    #[test]
    fn builder_parallelism_one() {
        let pool = Builder::default().parallelism(1).build();
        let secret = 333;
        let set_secret = pool.spawn(move || {
            thread::sleep(Duration::from_millis(200));
            LOCAL_SECRET.with(|cell| cell.set(secret));
        });
        let get_secret = pool.spawn(move || LOCAL_SECRET.with(|cell| cell.get()));
        set_secret.join().unwrap();
        assert_eq!(secret, get_secret.join().unwrap());
    }

    #[test]
    fn builder_parallelism_multiple() {
        let pool = Builder::default().parallelism(2).build();
        let secret = 111;
        let set_secret = pool.spawn(move || {
            thread::sleep(Duration::from_millis(200));
            LOCAL_SECRET.with(|cell| cell.set(secret));
        });
        let get_secret = pool.spawn(move || LOCAL_SECRET.with(|cell| cell.get()));
        set_secret.join().unwrap();
        assert_ne!(secret, get_secret.join().unwrap());
    }

    #[test]
    fn builder_name() {
        let pool = ThreadPool::builder().parallelism(2).name("named").build();
        assert_eq!(pool.parallelism(), 2);
        let names = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..20 {
            let names = names.clone();
            pool.submit(move || {
                let name = thread::current().name().map(ToString::to_string);
                names.lock().unwrap().push(name);
            });
        }
        pool.wait();
        for name in names.lock().unwrap().iter() {
            let name = name.as_deref().unwrap();
            assert!(name == "named-0" || name == "named-1", "unexpected worker name {}", name);
        }
    }

    #[test]
    fn current() {
        assert!(ThreadPool::current().is_none());
        let pool = ThreadPool::new(2);
        let id = pool.handle().id();
        let (sender, receiver) = std::sync::mpsc::channel();
        pool.submit(move || {
            let current = ThreadPool::current().map(|pool| pool.id());
            sender.send(current).unwrap();
        });
        assert_eq!(receiver.recv().unwrap(), Some(id));
        assert!(ThreadPool::current().is_none());
    }

    #[test]
    fn submit_transitively() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(move || {
                let current = ThreadPool::current().unwrap();
                for _ in 0..10 {
                    let counter = counter.clone();
                    current.submit(move || {
                        thread::sleep(Duration::from_millis(1));
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn submit_after_close() {
        let pool = ThreadPool::new(1);
        let handle = pool.handle();
        let value = Arc::new(());
        pool.shutdown();
        assert!(handle.is_closed());
        handle.submit({
            let value = value.clone();
            move || drop(value)
        });
        assert_eq!(Arc::strong_count(&value), 1);
        handle.wait();
    }

    #[test]
    fn task_panic() {
        let pool = ThreadPool::new(1);
        pool.submit(|| panic!("oooooops"));
        let (sender, receiver) = std::sync::mpsc::channel();
        pool.submit(move || sender.send(5).unwrap());
        pool.wait();
        assert_eq!(receiver.recv().unwrap(), 5);
    }

    #[test]
    #[should_panic(expected = "wait: called from a worker of the same pool")]
    fn wait_from_worker() {
        let pool = ThreadPool::new(1);
        let (sender, receiver) = std::sync::mpsc::channel();
        pool.submit(move || {
            let result = panic::catch_unwind(|| ThreadPool::current().unwrap().wait());
            sender.send(result.map_err(|err| panic_message(&err).map(ToString::to_string))).unwrap();
        });
        if let Err(Some(message)) = receiver.recv().unwrap() {
            panic!("{}", message);
        }
    }

    #[test]
    fn drop_from_own_worker() {
        let pool = ThreadPool::new(2);
        let (sender, receiver) = std::sync::mpsc::channel();
        let pool = Arc::new(Mutex::new(Some(pool)));
        let task = {
            let pool = pool.clone();
            move || {
                let pool = pool.lock().unwrap().take();
                drop(pool);
                sender.send(()).unwrap();
            }
        };
        pool.lock().unwrap().as_ref().unwrap().submit(task);
        receiver.recv().unwrap();
        assert!(pool.lock().unwrap().is_none());
    }

    #[test]
    fn fibers_yield_on_workers() {
        let pool = ThreadPool::new(4);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                pool.spawn(|| {
                    let mut threads = Vec::new();
                    for _ in 0..50 {
                        threads.push(thread_id());
                        fiber::yield_now();
                    }
                    threads
                })
            })
            .collect();
        let fibers: Vec<_> = handles.iter().map(|handle| handle.fiber().clone()).collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().len(), 50);
        }
        pool.wait();
        for fiber in fibers {
            assert_eq!(fiber.state(), fiber::State::Dead);
            assert_eq!(fiber.pool().map(Handle::id), Some(pool.handle().id()));
        }
    }

    #[inline(never)]
    fn thread_id() -> thread::ThreadId {
        thread::current().id()
    }
}
