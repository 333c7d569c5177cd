use core::alloc::Layout;
use core::ptr::NonNull;

/// The memory capability a [`HashTable`](crate::HashTable) draws from.
///
/// Every bucket array and every entry record the table owns is obtained from,
/// resized through, and returned to the allocator it was created with. This
/// allows arena or pool allocators to back a table, and lets tests inject
/// allocation failures.
///
/// Allocators take `&self`. An allocator shared by several tables (through
/// the blanket `&A` implementation) must tolerate whatever interleaving of
/// calls those tables produce; the table itself never calls the allocator
/// from more than one thread at a time.
///
/// # Safety
///
/// Implementors must return blocks that are valid for reads and writes of
/// `layout.size()` bytes and aligned to `layout.align()`, and that stay valid
/// until passed to [`deallocate`](Allocator::deallocate) or successfully
/// [`reallocate`](Allocator::reallocate)d. Returning `None` must leave any
/// block passed in untouched.
pub unsafe trait Allocator {
    /// Allocates a block for `layout`, or returns `None` on failure.
    ///
    /// `layout` always has a non-zero size.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Resizes the block at `ptr` to `new_size` bytes, keeping the alignment
    /// of `old_layout`.
    ///
    /// The first `min(old_layout.size(), new_size)` bytes are preserved. On
    /// failure `None` is returned and `ptr` remains valid with its old size.
    ///
    /// The default implementation allocates a fresh block, copies, and frees
    /// the old one.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this allocator with `old_layout`, and
    /// `new_size` rounded up to `old_layout.align()` must not overflow
    /// `isize::MAX`.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: The caller guarantees the new size is representable with the
        // old alignment.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, old_layout.align()) };
        let new_ptr = self.allocate(new_layout)?;
        // SAFETY: Both blocks are live and distinct, and each is at least
        // `min(old, new)` bytes long.
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_layout.size().min(new_size),
            );
            self.deallocate(ptr, old_layout);
        }
        Some(new_ptr)
    }

    /// Returns the block at `ptr` to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this allocator with `layout` and not
    /// freed since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

// SAFETY: Forwards to `A`, which upholds the contract.
unsafe impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Requirements forwarded from the caller.
        unsafe { (**self).reallocate(ptr, old_layout, new_size) }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Requirements forwarded from the caller.
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

/// The global allocator registered with `#[global_allocator]`, or the system
/// allocator when none is.
#[derive(Clone, Copy, Debug, Default)]
pub struct Global;

// SAFETY: `alloc::alloc` upholds the block validity requirements, and a null
// return maps to `None`.
unsafe impl Allocator for Global {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() != 0);
        // SAFETY: The table never requests zero-sized layouts.
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    #[inline]
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: Requirements forwarded from the caller.
        NonNull::new(unsafe { alloc::alloc::realloc(ptr.as_ptr(), old_layout, new_size) })
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Requirements forwarded from the caller.
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
