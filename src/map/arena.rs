use std::cell::Cell;
use std::io::Result;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::ffi::syscall::{mmap_anon, munmap};

/// Bump allocator backing the recipe map.
///
/// Records and interval chains live here for the life of the process;
/// nothing is ever handed back. Evicted record headers are recycled by the
/// map's free list, not by this allocator.
///
/// Allocation requires the map lock; published allocations are read
/// lock-free afterwards. `used` is a plain cell for that reason.
pub(crate) struct Arena {
    ptr: NonNull<u8>,
    cap: usize,
    used: Cell<usize>,
}

// All mutation happens under the map spinlock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(cap: usize) -> Result<Self> {
        let ptr = mmap_anon(cap)?;
        Ok(Self { ptr, cap, used: Cell::new(0) })
    }

    /// Bumps off `size` bytes at `align`. `None` means the arena is full,
    /// which the map treats as fatal.
    pub fn alloc_raw(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let used = self.used.get();
        let at = used.checked_add(align - 1)? & !(align - 1);
        let next = at.checked_add(size)?;
        if next > self.cap {
            return None;
        }
        self.used.set(next);
        // In-bounds offset from a non-null mapping.
        Some(unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(at)) })
    }

    /// Moves `val` into the arena.
    pub fn alloc<T>(&self, val: T) -> Option<NonNull<T>> {
        let ptr = self.alloc_raw(size_of::<T>(), align_of::<T>())?.cast::<T>();
        unsafe { ptr.as_ptr().write(val) };
        Some(ptr)
    }

    /// Reserves an uninitialized `[T; len]`.
    pub fn alloc_slice<T>(&self, len: usize) -> Option<NonNull<T>> {
        let size = size_of::<T>().checked_mul(len)?;
        Some(self.alloc_raw(size, align_of::<T>())?.cast::<T>())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        match unsafe { munmap(self.ptr.as_ptr(), self.cap) } {
            Ok(()) => (),
            Err(e) => panic!("failed to unmap recipe arena: {}", e),
        }
    }
}
