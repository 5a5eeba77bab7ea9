use std::{mem, ptr};

use super::stack::{Stack, StackSize};

#[allow(improper_ctypes)] // suppress "`extern` block uses type `u128`, which is not FFI-safe"
extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn setcontext(ucp: *const libc::ucontext_t) -> libc::c_int;
    fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> libc::c_int;
    fn makecontext(ucp: *mut libc::ucontext_t, func: extern "C" fn(*mut libc::c_void), argc: libc::c_int, ...);
}

/// Saved machine context plus the stack it executes on, if it owns one.
///
/// A context must not move after it has been captured: glibc stores pointers into the context
/// itself. Hence every context lives behind a [Box].
#[repr(C, align(16))]
pub(crate) struct Context {
    stack: Option<Stack>,
    context: libc::ucontext_t,
    // libc crate does not embed mcontext into ucontext for apple targets.
    //
    // * https://github.com/rust-lang/libc/issues/2812
    // * https://github.com/rust-lang/libc/pull/3312
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
    _mcontext: libc::__darwin_mcontext64,
}

/// Entry point of a fresh context.
#[derive(Debug)]
pub(crate) struct Entry {
    pub f: extern "C" fn(*mut libc::c_void),
    pub arg: *mut libc::c_void,
    pub stack_size: StackSize,
}

impl Context {
    /// Constructs a blank context to be filled by [Context::swap].
    pub fn blank() -> Box<Context> {
        // SAFETY: ucontext_t and mcontext are plain old data.
        Box::new(Context {
            stack: None,
            context: unsafe { mem::zeroed() },
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
            _mcontext: unsafe { mem::zeroed() },
        })
    }

    /// Constructs a context which starts executing `entry` on its own stack once switched to.
    pub fn with_entry(entry: &Entry) -> Box<Context> {
        let mut ctx = Context::blank();
        let rc = unsafe { getcontext(&mut ctx.context) };
        if rc != 0 {
            panic!("getcontext returns {}, errno {}", rc, errno::errno());
        }
        let stack = Stack::alloc(entry.stack_size);
        ctx.context.uc_stack.ss_sp = stack.base() as *mut libc::c_void;
        ctx.context.uc_stack.ss_size = stack.size();
        ctx.context.uc_link = ptr::null_mut();
        ctx.stack = Some(stack);
        unsafe { makecontext(&mut ctx.context, entry.f, 1, entry.arg) };
        ctx
    }

    /// Saves current execution to `save` and continues execution from `load`.
    ///
    /// # Safety
    /// Both pointers must point to live boxed contexts, and `load` must hold either a fresh entry
    /// context or one saved by an earlier switch whose stack is still alive.
    pub unsafe fn swap(save: ptr::NonNull<Context>, load: ptr::NonNull<Context>) {
        let rc = swapcontext(ptr::addr_of_mut!((*save.as_ptr()).context), ptr::addr_of!((*load.as_ptr()).context));
        if rc != 0 {
            panic!("swapcontext returns {}, errno {}", rc, errno::errno());
        }
    }

    /// Continues execution from `load` without saving current execution.
    ///
    /// # Safety
    /// Same as [Context::swap]. Frames on current stack are abandoned without unwinding.
    pub unsafe fn jump(load: ptr::NonNull<Context>) -> ! {
        let rc = setcontext(ptr::addr_of!((*load.as_ptr()).context));
        panic!("setcontext returns {}, errno {}", rc, errno::errno());
    }
}
