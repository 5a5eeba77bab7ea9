//! Synchronization primitives.
//!
//! Only [SpinLock] cooperates with fibers. All others block the OS thread they are called from,
//! which stalls the calling fiber together with its worker thread.

mod futex;
mod queue;
mod spin;
mod wait_group;

pub use self::futex::{Mutex, MutexGuard};
pub use self::queue::{BlockingQueue, ClosableQueue};
pub use self::spin::{SpinLock, SpinLockGuard};
pub use self::wait_group::WaitGroup;
