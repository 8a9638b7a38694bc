// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A global allocator that takes its memory from the host.
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: HostHeap = HostHeap::new(AllocHooks {
//!     allocate: host_allocate,
//!     reallocate: host_reallocate,
//!     free: host_free,
//! });
//! ```

use std::alloc::GlobalAlloc;
use std::alloc::Layout;

/// Alignment every host allocation is assumed to have, as with `malloc`.
pub const HOST_ALIGN: usize = 16;

/// The host's `malloc`, `realloc` and `free`.
#[derive(Debug, Copy, Clone)]
pub struct AllocHooks {
    pub allocate: fn(usize) -> *mut u8,
    pub reallocate: fn(*mut u8, usize) -> *mut u8,
    pub free: fn(*mut u8),
}

/// Routes Rust allocations to [`AllocHooks`].
///
/// Layouts with an alignment above [`HOST_ALIGN`] are over-allocated and the
/// host's pointer is stashed in the word just below the one handed out.
#[derive(Debug)]
pub struct HostHeap {
    hooks: AllocHooks,
}

impl HostHeap {
    pub const fn new(hooks: AllocHooks) -> Self {
        Self { hooks }
    }

    fn over_aligned(layout: Layout) -> bool {
        layout.align() > HOST_ALIGN
    }

    unsafe fn alloc_over_aligned(&self, layout: Layout) -> *mut u8 {
        let Some(total) = layout.size().checked_add(layout.align()) else {
            return std::ptr::null_mut();
        };
        let base = (self.hooks.allocate)(total);
        if base.is_null() {
            return base;
        }
        // `base` is HOST_ALIGN aligned, so the padding is at least HOST_ALIGN
        // bytes, which leaves room for the stashed pointer.
        let pad = layout.align() - (base as usize & (layout.align() - 1));
        // SAFETY: `pad <= align`, which is within the `size + align` bytes
        // allocated.
        let ptr = unsafe { base.add(pad) };
        // SAFETY: `ptr` is at least `HOST_ALIGN` bytes past `base`, and is
        // aligned to at least a word.
        unsafe { ptr.cast::<*mut u8>().sub(1).write(base) };
        ptr
    }

    unsafe fn base_of(ptr: *mut u8) -> *mut u8 {
        // SAFETY: written by `alloc_over_aligned`.
        unsafe { ptr.cast::<*mut u8>().sub(1).read() }
    }
}

// SAFETY: the hooks behave like malloc/realloc/free; over-aligned layouts are
// padded and the original pointer is recovered before freeing.
unsafe impl GlobalAlloc for HostHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if Self::over_aligned(layout) {
            // SAFETY: forwarded from the caller.
            unsafe { self.alloc_over_aligned(layout) }
        } else {
            (self.hooks.allocate)(layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if Self::over_aligned(layout) {
            // SAFETY: `ptr` came from `alloc` with the same layout.
            (self.hooks.free)(unsafe { Self::base_of(ptr) })
        } else {
            (self.hooks.free)(ptr)
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !Self::over_aligned(layout) {
            return (self.hooks.reallocate)(ptr, new_size);
        }
        // SAFETY: the caller guarantees `new_size` with `layout.align()` is a
        // valid layout.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        // SAFETY: forwarded from the caller.
        let new = unsafe { self.alloc_over_aligned(new_layout) };
        if !new.is_null() {
            // SAFETY: both blocks are live and at least `min` bytes long.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new
    }
}
