#![allow(clippy::needless_doctest_main)]

//! # Cooperative fibers multiplexed onto a thread pool
//! `spindle` runs lightweight stackful fibers on a fixed set of worker threads. A fiber that
//! suspends is requeued to its pool and could be resumed by any worker, so fibers hop between
//! threads across suspension points.
//!
//! ## Usage
//! Construct a [pool::ThreadPool] to [pool::ThreadPool::spawn] initial fiber, or mark `main` with
//! `#[spindle::main]` to run it as a fiber.
//!
//! ### Fiber
//! * Use [fiber::spawn] to spawn new fiber. Inside a pool, the new fiber is bound to that pool.
//! * Use [fiber::yield_now] to give the worker thread to other fibers.
//! * Use [fiber::JoinHandle] to join fiber result.
//!
//! ### Synchronization
//! Only [sync::SpinLock], [future::Future::get] and [fiber::JoinHandle::join] suspend fibers while
//! waiting. [sync::Mutex], [sync::WaitGroup], [sync::BlockingQueue], [sync::ClosableQueue],
//! [channel::Rendezvous] and [pool::ThreadPool::wait] block the OS thread they are called from. A
//! pool needs spare workers if fibers wait on each other through them.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//!
//! use spindle::fiber;
//! use spindle::sync::SpinLock;
//!
//! #[spindle::main(parallelism = 2)]
//! fn main() {
//!     let steps = Arc::new(SpinLock::new(Vec::new()));
//!     let fibers: Vec<_> = (0..2)
//!         .map(|i| {
//!             let steps = steps.clone();
//!             fiber::spawn(move || {
//!                 for _ in 0..3 {
//!                     steps.lock().push(i);
//!                     fiber::yield_now();
//!                 }
//!             })
//!         })
//!         .collect();
//!     for fiber in fibers {
//!         fiber.join().unwrap();
//!     }
//!     assert_eq!(steps.lock().len(), 6);
//! }
//! ```

pub mod channel;
mod coroutine;
mod error;
pub mod fiber;
pub mod future;
pub mod pool;
pub mod sync;

pub use coroutine::StackSize;
pub use error::{JoinError, PushError};
#[cfg(not(test))]
pub use spindle_macros::main;
pub use spindle_macros::test;
