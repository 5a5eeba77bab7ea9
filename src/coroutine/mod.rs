//! Stackful coroutine primitive which fibers drive.
//!
//! A coroutine only knows how to transfer control: [Coroutine::resume] switches from the calling
//! execution into the coroutine, [Coroutine::suspend] switches back to whoever resumed it. Every
//! coroutine remembers its own resumer, so coroutines can resume each other in a nested fashion
//! and may be resumed from a different thread after each suspension.

mod context;
pub(crate) mod stack;

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use self::context::{Context, Entry};
pub use self::stack::StackSize;
use crate::error::JoinError;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum Status {
    Created,
    Running,
    Suspended,
    Completed,
}

pub(crate) type Routine = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Coroutine {
    status: Cell<Status>,
    routine: Cell<Option<Routine>>,
    // Execution of this coroutine.
    context: ptr::NonNull<Context>,
    // Execution of last resumer.
    caller: ptr::NonNull<Context>,
}

// SAFETY: Contexts are exclusively owned. Callers guarantee that at most one thread resumes a
// coroutine at a time.
unsafe impl Send for Coroutine {}

impl Coroutine {
    pub fn new(routine: Routine, stack_size: StackSize) -> Box<Coroutine> {
        let mut co = Box::new(Coroutine {
            status: Cell::new(Status::Created),
            routine: Cell::new(Some(routine)),
            context: ptr::NonNull::from(Box::leak(Context::blank())),
            caller: ptr::NonNull::from(Box::leak(Context::blank())),
        });
        let entry = Entry { f: Self::main, arg: (co.as_mut() as *mut Coroutine) as *mut libc::c_void, stack_size };
        let blank = std::mem::replace(&mut co.context, ptr::NonNull::from(Box::leak(Context::with_entry(&entry))));
        drop(unsafe { Box::from_raw(blank.as_ptr()) });
        co
    }

    extern "C" fn main(arg: *mut libc::c_void) {
        let co = unsafe { &*(arg as *const Coroutine) };
        co.run();
        co.status.set(Status::Completed);
        unsafe { Context::jump(co.caller) }
    }

    fn run(&self) {
        let Some(routine) = self.routine.take() else {
            return;
        };
        // Unwinding must never cross the context entry frame.
        if let Err(err) = panic::catch_unwind(AssertUnwindSafe(routine)) {
            tracing::warn!("fiber routine panicked: {}", JoinError::new(err));
        }
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Runs this coroutine until it suspends or completes.
    pub fn resume(&self) -> Status {
        assert!(self.status.get() != Status::Completed, "resume: coroutine completed");
        assert!(self.status.get() != Status::Running, "resume: coroutine running");
        self.status.set(Status::Running);
        unsafe { Context::swap(self.caller, self.context) };
        self.status.get()
    }

    /// Transfers control back to last resumer. Returns after next [Coroutine::resume].
    ///
    /// Must be called from inside this coroutine.
    pub fn suspend(&self) {
        debug_assert_eq!(self.status.get(), Status::Running, "suspend: coroutine not running");
        self.status.set(Status::Suspended);
        unsafe { Context::swap(self.context, self.caller) };
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.context.as_ptr()) });
        drop(unsafe { Box::from_raw(self.caller.as_ptr()) });
    }
}
