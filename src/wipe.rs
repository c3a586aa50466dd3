use core::{
    ptr::{self, NonNull},
    sync::atomic::{self, Ordering},
};

use zeroize::Zeroize;

/// Overwrites `len` bytes at `ptr` with `byte` in a way the optimizer is
/// not allowed to elide, even when the memory is unmapped right after.
///
/// # Safety
///
/// `ptr` must be valid for writes of `len` bytes.
pub(crate) unsafe fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
    if len == 0 {
        return;
    }

    if byte == 0 {
        Zeroize::zeroize({
            let bytes_slice = ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len);
            unsafe { &mut *bytes_slice }
        });
        return;
    }

    let mut cursor = ptr.as_ptr();
    for _ in 0..len {
        unsafe {
            ptr::write_volatile(cursor, byte);
            cursor = cursor.add(1);
        }
    }
    atomic::compiler_fence(Ordering::SeqCst);
}
