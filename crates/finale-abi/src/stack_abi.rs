//! Stack memory: mmap'd fiber stacks and discovery of thread stacks.
//!
//! ## Fiber stack layout
//!
//! ```text
//! mapping                bottom                          top
//!    | guard (PROT_NONE) |  usable stack, grows downward  |
//!    |<- GUARD_ZONE_SIZE ->|<---------- size ------------->|
//! ```
//!
//! The guard zone is exactly the band the stack registry classifies as
//! overflow for the owning fiber.

use std::num::NonZeroUsize;
use std::ptr;

use corosensei::stack::{Stack, StackPointer};
use finale_core::config::MIN_FIBER_STACK_SIZE;
use finale_core::{GUARD_ZONE_SIZE, OwnerId, StackRegion};

use crate::{AbiError, last_os_error};

/// System page size, falling back to 4 KiB if `sysconf` refuses.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align).saturating_mul(align)
}

/// An anonymous mapping holding one fiber's stack and its guard zone.
#[derive(Debug)]
pub struct FiberStack {
    mapping: NonZeroUsize,
    total: usize,
    bottom: NonZeroUsize,
    top: NonZeroUsize,
}

impl FiberStack {
    /// Map `size` usable bytes (rounded up to whole pages) plus the guard zone.
    pub fn new(size: usize) -> Result<Self, AbiError> {
        let page = page_size();
        let size = round_up(size.max(MIN_FIBER_STACK_SIZE), page);
        let guard = round_up(GUARD_ZONE_SIZE, page);
        let total = guard.saturating_add(size);

        // SAFETY: anonymous private mapping with no fd, valid parameters.
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(AbiError::Map {
                size: total,
                source: last_os_error(),
            });
        }

        // SAFETY: `mapping` is a fresh page-aligned mapping of `total >= guard` bytes.
        if unsafe { libc::mprotect(mapping, guard, libc::PROT_NONE) } != 0 {
            let source = last_os_error();
            // SAFETY: unmapping the region created above.
            unsafe { libc::munmap(mapping, total) };
            return Err(AbiError::Protect { source });
        }

        let addr = mapping as usize;
        match (
            NonZeroUsize::new(addr),
            NonZeroUsize::new(addr + guard),
            NonZeroUsize::new(addr + total),
        ) {
            (Some(mapping), Some(bottom), Some(top)) => Ok(Self {
                mapping,
                total,
                bottom,
                top,
            }),
            _ => {
                // SAFETY: unmapping the region created above.
                unsafe { libc::munmap(addr as *mut libc::c_void, total) };
                Err(AbiError::Map {
                    size: total,
                    source: std::io::Error::other("mapping wraps the address space"),
                })
            }
        }
    }

    /// Lowest usable address.
    #[must_use]
    pub fn bottom(&self) -> usize {
        self.bottom.get()
    }

    /// One past the highest usable address; execution starts here.
    #[must_use]
    pub fn top(&self) -> usize {
        self.top.get()
    }

    #[must_use]
    pub fn usable_size(&self) -> usize {
        self.top() - self.bottom()
    }

    /// The registry entry describing this stack for `owner`.
    #[must_use]
    pub fn region(&self, owner: OwnerId) -> StackRegion {
        StackRegion::new(owner, self.bottom(), self.usable_size())
            .with_guard(self.mapping.get(), self.bottom())
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        // SAFETY: mapping/total describe the region returned by mmap in `new`.
        unsafe { libc::munmap(self.mapping.get() as *mut libc::c_void, self.total) };
    }
}

// SAFETY: base/limit bound a mapping owned by this value and alive until drop;
// the range below `limit` is PROT_NONE.
unsafe impl Stack for FiberStack {
    fn base(&self) -> StackPointer {
        self.top
    }

    fn limit(&self) -> StackPointer {
        self.bottom
    }
}

/// Usable bounds of an OS thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStack {
    pub bottom: usize,
    pub size: usize,
}

impl ThreadStack {
    /// Registry entry for this thread. The guard band also reaches one page
    /// above `bottom`: for the primary thread `bottom` is derived from the
    /// stack rlimit and the kernel may fault a little inside it.
    #[must_use]
    pub fn region(&self, owner: OwnerId) -> StackRegion {
        let region = StackRegion::new(owner, self.bottom, self.size);
        region.with_guard(region.guard_lo, self.bottom.saturating_add(page_size()))
    }
}

/// Bounds of the calling thread's stack.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_thread_stack() -> Result<ThreadStack, AbiError> {
    // SAFETY: zeroed attr is a valid out-parameter for pthread_getattr_np.
    let mut attr: libc::pthread_attr_t = unsafe { std::mem::zeroed() };
    // SAFETY: pthread_self() is always valid for the calling thread.
    let rc = unsafe { libc::pthread_getattr_np(libc::pthread_self(), &raw mut attr) };
    if rc != 0 {
        return Err(AbiError::ThreadAttr { code: rc });
    }

    let mut addr: *mut libc::c_void = ptr::null_mut();
    let mut size: libc::size_t = 0;
    // SAFETY: attr was initialized by pthread_getattr_np above.
    let rc = unsafe { libc::pthread_attr_getstack(&raw const attr, &raw mut addr, &raw mut size) };
    // SAFETY: attr was initialized by pthread_getattr_np and is destroyed once.
    unsafe { libc::pthread_attr_destroy(&raw mut attr) };
    if rc != 0 {
        return Err(AbiError::ThreadAttr { code: rc });
    }

    Ok(ThreadStack {
        bottom: addr as usize,
        size,
    })
}

/// Bounds of the calling thread's stack.
#[cfg(target_os = "macos")]
pub fn current_thread_stack() -> Result<ThreadStack, AbiError> {
    // SAFETY: both calls only read the calling thread's descriptor.
    let (top, size) = unsafe {
        let this = libc::pthread_self();
        (
            libc::pthread_get_stackaddr_np(this) as usize,
            libc::pthread_get_stacksize_np(this),
        )
    };
    Ok(ThreadStack {
        bottom: top - size,
        size,
    })
}
