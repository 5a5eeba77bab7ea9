use std::alloc;

use lazy_static::lazy_static;

lazy_static! {
    static ref PAGE_SIZE: usize = {
        let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if rc == -1 {
            panic!("fail to evaluate sysconf(_SC_PAGESIZE), got errno {}", errno::errno());
        }
        rc as usize
    };
}

// Pages of a default fiber stack.
const DEFAULT_PAGES: usize = 32;

/// Returns page size which is a non zero power of 2 integer.
fn page_size() -> usize {
    *PAGE_SIZE
}

/// StackSize specifies desired stack size for new fiber.
///
/// It defaults to `32` times page size or [libc::MINSIGSTKSZ] depending on which one is bigger.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct StackSize {
    // 0: default, +n: default plus n bytes, -n: n bytes
    size: isize,
}

impl StackSize {
    fn align_to_page_size(size: usize) -> usize {
        let mask = page_size() - 1;
        (size + mask) & !mask
    }

    fn default_size() -> usize {
        DEFAULT_PAGES * page_size()
    }

    /// Stack size in bytes after page alignment, excluding guard pages.
    pub(crate) fn bytes(&self) -> usize {
        let size = match self.size {
            0 => Self::default_size(),
            1.. => Self::default_size() + Self::align_to_page_size(self.size as usize),
            _ => Self::align_to_page_size(self.size.unsigned_abs()),
        };
        size.max(libc::MINSIGSTKSZ)
    }

    /// Specifies extra stack size in addition to default.
    pub fn with_extra_size(size: usize) -> StackSize {
        assert!(size <= isize::MAX as usize, "stack size is too large");
        StackSize { size: size as isize }
    }

    /// Specifies desired stack size.
    pub fn with_size(size: usize) -> StackSize {
        assert!(size <= isize::MAX as usize, "stack size is too large");
        StackSize { size: -(size.max(1) as isize) }
    }
}

/// Heap allocated stack fenced by one inaccessible guard page on each side.
pub(crate) struct Stack {
    base: *mut u8,
    size: usize,
}

impl Stack {
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn layout(size: usize) -> alloc::Layout {
        let page_size = page_size();
        alloc::Layout::from_size_align(size + 2 * page_size, page_size).expect("invalid stack layout")
    }

    fn protect(low: *mut u8, high: *mut u8, prot: libc::c_int) {
        let page_size = page_size();
        unsafe { libc::mprotect(low as *mut libc::c_void, page_size, prot) };
        unsafe { libc::mprotect(high as *mut libc::c_void, page_size, prot) };
    }

    pub fn alloc(size: StackSize) -> Stack {
        let page_size = page_size();
        let stack_size = size.bytes();
        let layout = Self::layout(stack_size);
        let stack_low = unsafe { alloc::alloc(layout) };
        if stack_low.is_null() {
            alloc::handle_alloc_error(layout);
        }
        let stack_base = unsafe { stack_low.add(page_size) };
        let stack_high = unsafe { stack_base.add(stack_size) };
        Self::protect(stack_low, stack_high, libc::PROT_NONE);
        Stack { base: stack_base, size: stack_size }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let page_size = page_size();
        let low = unsafe { self.base.sub(page_size) };
        let high = unsafe { self.base.add(self.size) };
        Self::protect(low, high, libc::PROT_READ | libc::PROT_WRITE);
        unsafe { alloc::dealloc(low, Self::layout(self.size)) };
    }
}

// SAFETY: Stack is an exclusively owned allocation.
unsafe impl Send for Stack {}
