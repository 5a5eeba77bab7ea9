//! Single assignment value cell split into a read once [Future] and a write once [Promise].
//!
//! Both endpoints share the cell and never touch each other, so either one could be dropped before
//! the other without invalidating it.

use std::sync::{Arc, Condvar, Mutex};
use std::{fmt, mem, ptr};

use static_assertions::assert_impl_all;

use crate::fiber::{self, Fiber};

enum Slot<T> {
    Empty,
    Value(T),
    // Promise dropped without value.
    Broken,
}

struct Shared<T> {
    slot: Slot<T>,
    // Fiber parked in `Future::get`.
    waiter: Option<Fiber>,
}

struct Cell<T> {
    shared: Mutex<Shared<T>>,
    ready: Condvar,
}

impl<T> Cell<T> {
    fn fill(&self, slot: Slot<T>) {
        let mut shared = self.shared.lock().unwrap();
        if !matches!(shared.slot, Slot::Empty) {
            return;
        }
        shared.slot = slot;
        let waiter = shared.waiter.take();
        self.ready.notify_all();
        drop(shared);
        if let Some(fiber) = waiter {
            fiber.unpark();
        }
    }

    fn take_slot(slot: &mut Slot<T>) -> Option<T> {
        match mem::replace(slot, Slot::Empty) {
            Slot::Empty => None,
            Slot::Value(value) => Some(value),
            Slot::Broken => panic!("future: promise dropped without value"),
        }
    }
}

/// Read side of a tied pair.
pub struct Future<T> {
    cell: Arc<Cell<T>>,
}

/// Write side of a tied pair.
///
/// Dropping it without [Promise::set_value] breaks the pair.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

assert_impl_all!(Future<Vec<u8>>: Send, Sync);
assert_impl_all!(Promise<Vec<u8>>: Send, Sync);

/// Constructs a tied future and promise pair.
pub fn tied<T>() -> (Future<T>, Promise<T>) {
    let shared = Shared { slot: Slot::Empty, waiter: None };
    let cell = Arc::new(Cell { shared: Mutex::new(shared), ready: Condvar::new() });
    (Future { cell: cell.clone() }, Promise { cell })
}

impl<T> Future<T> {
    /// Returns true if [Future::get] will not wait.
    pub fn is_ready(&self) -> bool {
        !matches!(self.cell.shared.lock().unwrap().slot, Slot::Empty)
    }

    /// Waits for the value and takes it.
    ///
    /// It parks calling fiber if called inside a fiber, blocks calling thread otherwise. A parked
    /// fiber is not rescheduled until paired promise is fulfilled or dropped.
    ///
    /// # Panics
    /// Panics if paired promise was dropped without value.
    pub fn get(self) -> T {
        if fiber::in_fiber() {
            loop {
                let mut shared = self.cell.shared.lock().unwrap();
                if let Some(value) = Cell::take_slot(&mut shared.slot) {
                    return value;
                }
                // Registered per round so the fiber holds no handle to itself while parked.
                shared.waiter = fiber::current();
                drop(shared);
                fiber::park();
            }
        }
        let mut shared = self.cell.shared.lock().unwrap();
        loop {
            if let Some(value) = Cell::take_slot(&mut shared.slot) {
                return value;
            }
            shared = self.cell.ready.wait(shared).unwrap();
        }
    }
}

impl<T> Promise<T> {
    unsafe fn into_cell(self) -> Arc<Cell<T>> {
        let cell = ptr::read(&self.cell);
        mem::forget(self);
        cell
    }

    /// Fulfills paired future. The value is dropped unobserved if the future is gone.
    pub fn set_value(self, value: T) {
        let cell = unsafe { self.into_cell() };
        cell.fill(Slot::Value(value));
    }

    /// Returns true if paired future has been dropped.
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.cell) == 1
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.cell.fill(Slot::Broken);
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").field("ready", &self.is_ready()).finish()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("abandoned", &self.is_abandoned()).finish()
    }
}
