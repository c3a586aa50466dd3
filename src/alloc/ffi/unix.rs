use core::ptr::{self, NonNull};
use std::io;

/// Maps an anonymous memory region into the process's address space.
///
/// Wraps the `mmap` system call.
///
/// # Arguments
///
/// * `len` - The length of the memory region.
/// * `prot` - Memory protection flags.
/// * `flags` - Mapping flags.
///
/// # Returns
///
/// * A result containing a non-null pointer to the memory region on success,
///   or an I/O error on failure.
pub fn mmap(len: usize, prot: i32, flags: i32) -> io::Result<NonNull<[u8]>> {
    match unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) } {
        libc::MAP_FAILED => Err(io::Error::last_os_error()),
        ptr => {
            let ptr = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
            Ok(NonNull::slice_from_raw_parts(ptr, len))
        }
    }
}

/// Changes the access protection of a memory region.
///
/// Wraps the `mprotect` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null, page-aligned pointer to the memory region.
/// * `len` - The length of the memory region.
/// * `prot` - The new protection flags.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn mprotect(ptr: NonNull<u8>, len: usize, prot: i32) -> io::Result<()> {
    match unsafe { libc::mprotect(ptr.as_ptr() as _, len, prot) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Provides advice about the use of memory.
///
/// Wraps the `madvise` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
/// * `advice` - The advice to be given.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn madvise(ptr: NonNull<u8>, len: usize, advice: i32) -> io::Result<()> {
    match unsafe { libc::madvise(ptr.as_ptr() as _, len, advice) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Locks a memory region, preventing it from being paged out to swap.
///
/// Wraps the `mlock` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn mlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::mlock(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unlocks a memory region, allowing it to be paged out to swap.
///
/// Wraps the `munlock` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn munlock(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munlock(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Unmaps a memory region within the process's address space.
///
/// Wraps the `munmap` system call.
///
/// # Arguments
///
/// * `ptr` - A non-null pointer to the memory region.
/// * `len` - The length of the memory region.
///
/// # Returns
///
/// * A result indicating success or an I/O error on failure.
pub fn munmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    match unsafe { libc::munmap(ptr.as_ptr() as _, len) } {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Retrieves the system's page size.
///
/// Wraps the `sysconf` system call on Unix-like systems
/// and `vm_page_size` on macOS.
///
/// # Returns
///
/// * The size of a memory page in bytes.
#[inline]
pub(crate) fn page_size() -> usize {
    #[cfg(target_os = "macos")]
    unsafe {
        libc::vm_page_size as usize
    }
    #[cfg(not(target_os = "macos"))]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
}
