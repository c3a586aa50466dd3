use core::{alloc::Layout, ptr::NonNull};

use allocator_api2::alloc::{AllocError, Allocator};

use crate::{
    alloc::{secure_alloc_with, secure_free_with},
    caps::Capabilities,
};

/// Stateless allocator handing out guarded regions.
///
/// Every instance is equal to every other and values can be rebuilt
/// freely, since there is no state to carry over. Each allocation is its
/// own guarded region, fenced by canary pages and wiped on release per
/// [`Capabilities::current`].
///
/// Alignments up to [`Capabilities::user_align`] are honored; anything
/// larger fails with [`AllocError`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GuardedAlloc;

unsafe impl Allocator for GuardedAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(dangling_slice(layout));
        }

        let caps = Capabilities::current();
        if layout.align() > caps.user_align() {
            return Err(AllocError);
        }

        let ptr = secure_alloc_with(caps, layout.size()).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        // Fresh regions are zero-filled already.
        self.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        unsafe { secure_free_with(Capabilities::current(), ptr, layout.size()) };
    }
}

// Zero-sized allocations carry no region; a well-aligned dangling pointer
// is all the contract asks for.
fn dangling_slice(layout: Layout) -> NonNull<[u8]> {
    // Alignments are nonzero powers of two.
    let ptr = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
    NonNull::slice_from_raw_parts(ptr, 0)
}
