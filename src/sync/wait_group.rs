use std::sync::{Condvar, Mutex};

use static_assertions::assert_impl_all;

use crate::fiber;

/// Counter of outstanding work. [WaitGroup::wait] blocks current thread until it drops to zero.
///
/// Waiting on a zero counter returns immediately.
#[derive(Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    zero: Condvar,
}

assert_impl_all!(WaitGroup: Send, Sync);

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup::default()
    }

    /// Adds `n` to outstanding count.
    pub fn add(&self, n: usize) {
        *self.count.lock().unwrap() += n;
    }

    /// Decrements outstanding count by one, waking all waiters if it drops to zero.
    ///
    /// # Panics
    /// Panics if there is no outstanding count.
    pub fn done(&self) {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            drop(count);
            panic!("wait group: done called more times than add");
        }
        *count -= 1;
        let zero = *count == 0;
        drop(count);
        if zero {
            self.zero.notify_all();
        }
    }

    /// Blocks until outstanding count becomes zero.
    pub fn wait(&self) {
        fiber::note_blocking("WaitGroup::wait");
        let count = self.count.lock().unwrap();
        drop(self.zero.wait_while(count, |count| *count != 0).unwrap());
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }
}
