pub mod ffi;

use core::{alloc::Layout, ptr::NonNull, slice};
use std::io;

use crate::{
    caps::{Capabilities, HEAP_FALLBACK_ALIGN},
    geometry::RegionGeometry,
    wipe,
};

/// Byte written over every region on acquisition and release.
pub const GARBAGE_BYTE: u8 = 0x00;

/// Byte filling the canary pages on both ends of a region.
pub const CANARY_BYTE: u8 = 0xFF;

const LEADING_CANARY_MSG: &str = "guardalloc: leading canary corrupted, aborting\n";
const TRAILING_CANARY_MSG: &str = "guardalloc: trailing canary corrupted, aborting\n";

/// Allocates a guarded region able to hold `len` caller bytes.
///
/// The region is laid out as `[canary page][user data][padding][canary page]`
/// and the returned pointer addresses the user span, which is zero-filled.
/// Depending on [`Capabilities::current`], the region is locked against
/// swapping and excluded from core dumps, and the canary pages are sealed
/// against every access. Locking and dump exclusion are best-effort; their
/// failure does not fail the allocation.
///
/// A `len` of zero is valid and yields a region made of the two canary
/// pages alone. Returns `None` when no memory can be obtained or the total
/// region length would overflow.
pub fn secure_alloc(len: usize) -> Option<NonNull<u8>> {
    secure_alloc_with(Capabilities::current(), len)
}

/// Same as [`secure_alloc`], with an explicit capability descriptor.
///
/// The region must later be verified and released with the same
/// descriptor. Requesting features the running platform cannot provide
/// makes the allocation fail.
pub fn secure_alloc_with(caps: Capabilities, len: usize) -> Option<NonNull<u8>> {
    let geom = RegionGeometry::for_len(len, caps)?;
    let total = geom.total_len();

    let base = if caps.page_aligned() {
        sys::map_pages(total)?
    } else {
        heap_alloc(total)?
    };

    if caps.locks_memory() {
        let _ = sys::lock_region(base, total);
    }
    if caps.excludes_from_dumps() {
        let _ = sys::exclude_from_dumps(base, total);
    }

    unsafe {
        wipe::fill(base, total, GARBAGE_BYTE);
        wipe::fill(base, geom.canary_len(), CANARY_BYTE);
        wipe::fill(
            geom.trailing_canary_ptr(base),
            geom.canary_len(),
            CANARY_BYTE,
        );
    }

    if caps.seals_guards() && seal_canaries(base, &geom).is_err() {
        unsafe { destroy_region(caps, base, &geom) };
        return None;
    }

    Some(unsafe { geom.user_ptr(base) })
}

/// Verifies the canary pages of a live region, aborting on corruption.
///
/// Sealed canaries are made readable for the comparison and sealed again
/// afterwards. Any byte differing from [`CANARY_BYTE`] means something
/// wrote past the region bounds; the process prints a diagnostic to stderr
/// and aborts, since the same overwrite may have clobbered arbitrary other
/// memory.
///
/// # Safety
///
/// `ptr` must come from [`secure_alloc`] and `len` must be the exact
/// length it was allocated with; the region must not have been released.
pub unsafe fn check_canary(ptr: NonNull<u8>, len: usize) {
    unsafe { check_canary_with(Capabilities::current(), ptr, len) }
}

/// Same as [`check_canary`], with an explicit capability descriptor.
///
/// # Safety
///
/// As [`check_canary`], and `caps` must be the descriptor the region was
/// allocated with.
pub unsafe fn check_canary_with(caps: Capabilities, ptr: NonNull<u8>, len: usize) {
    let geom = region_geometry(caps, len);
    let base = unsafe { geom.base_ptr(ptr) };

    unsafe { check_canaries_impl(caps, base, &geom) };
}

/// Releases a guarded region, verifying and wiping it first.
///
/// The canary pages are checked exactly as by [`check_canary`], so a
/// corrupted region aborts the process instead of being recycled. Every
/// byte of the region is then overwritten with [`GARBAGE_BYTE`] before the
/// lock is dropped and the memory is returned to the OS.
///
/// # Safety
///
/// `ptr` must come from [`secure_alloc`] and `len` must be the exact
/// length it was allocated with. The region must not have been released
/// before, and no pointer into it may be used afterwards.
pub unsafe fn secure_free(ptr: NonNull<u8>, len: usize) {
    unsafe { secure_free_with(Capabilities::current(), ptr, len) }
}

/// Same as [`secure_free`], with an explicit capability descriptor.
///
/// # Safety
///
/// As [`secure_free`], and `caps` must be the descriptor the region was
/// allocated with.
pub unsafe fn secure_free_with(caps: Capabilities, ptr: NonNull<u8>, len: usize) {
    let geom = region_geometry(caps, len);
    let base = unsafe { geom.base_ptr(ptr) };

    unsafe {
        check_canaries_impl(caps, base, &geom);
        destroy_region(caps, base, &geom);
    }
}

// A live region was allocated through this very computation, so it cannot
// fail for any (caps, len) pair naming one.
fn region_geometry(caps: Capabilities, len: usize) -> RegionGeometry {
    match RegionGeometry::for_len(len, caps) {
        Some(geom) => geom,
        None => unreachable!(),
    }
}

fn seal_canaries(base: NonNull<u8>, geom: &RegionGeometry) -> io::Result<()> {
    sys::seal(base, geom.canary_len())?;
    sys::seal(
        unsafe { geom.trailing_canary_ptr(base) },
        geom.canary_len(),
    )
}

unsafe fn check_canaries_impl(caps: Capabilities, base: NonNull<u8>, geom: &RegionGeometry) {
    unsafe {
        check_canary_span(caps, base, geom.canary_len(), LEADING_CANARY_MSG);
        check_canary_span(
            caps,
            geom.trailing_canary_ptr(base),
            geom.canary_len(),
            TRAILING_CANARY_MSG,
        );
    }
}

unsafe fn check_canary_span(caps: Capabilities, ptr: NonNull<u8>, len: usize, msg: &str) {
    // Unreadable counts as unverifiable.
    if caps.seals_guards() && sys::unseal_readable(ptr, len).is_err() {
        abort_with_message(msg);
    }

    let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
    if bytes.iter().any(|&b| b != CANARY_BYTE) {
        abort_with_message(msg);
    }

    if caps.seals_guards() {
        let _ = sys::seal(ptr, len);
    }
}

/// Wipes a region and returns it to the OS. The canaries must already have
/// been verified, or be beyond saving as on the allocation failure path.
unsafe fn destroy_region(caps: Capabilities, base: NonNull<u8>, geom: &RegionGeometry) {
    let total = geom.total_len();

    if caps.seals_guards() {
        let _ = sys::unseal_writable(base, geom.canary_len());
        let _ = sys::unseal_writable(
            unsafe { geom.trailing_canary_ptr(base) },
            geom.canary_len(),
        );
    }

    unsafe { wipe::fill(base, total, GARBAGE_BYTE) };

    if caps.excludes_from_dumps() {
        let _ = sys::readmit_to_dumps(base, total);
    }
    if caps.locks_memory() {
        let _ = sys::unlock_region(base, total);
    }

    if caps.page_aligned() {
        let _ = sys::unmap_pages(base, total);
    } else {
        unsafe { heap_free(base, total) };
    }
}

fn heap_alloc(total: usize) -> Option<NonNull<u8>> {
    let layout = Layout::from_size_align(total, HEAP_FALLBACK_ALIGN).ok()?;
    NonNull::new(unsafe { std::alloc::alloc(layout) })
}

/// # Safety
///
/// `base` must come from `heap_alloc` with the same `total`.
unsafe fn heap_free(base: NonNull<u8>, total: usize) {
    // The layout the region was allocated with; validated back then.
    let layout = unsafe { Layout::from_size_align_unchecked(total, HEAP_FALLBACK_ALIGN) };
    unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
}

/// Writes `msg` to stderr without allocating, then aborts the process.
#[cold]
#[inline(never)]
fn abort_with_message(msg: &str) -> ! {
    #[cfg(target_family = "unix")]
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
    #[cfg(not(target_family = "unix"))]
    {
        use std::io::Write;

        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(msg.as_bytes());
        let _ = stderr.flush();
        std::process::abort();
    }
}

#[cfg(target_family = "unix")]
mod sys {
    use core::ptr::NonNull;
    use std::io;

    use super::ffi;

    pub fn map_pages(len: usize) -> Option<NonNull<u8>> {
        use libc::{MAP_ANON, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        ffi::unix::mmap(len, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANON)
            .ok()
            .map(|ptr| ptr.cast())
    }

    pub fn unmap_pages(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::unix::munmap(ptr, len)
    }

    pub fn seal(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::unix::mprotect(ptr, len, libc::PROT_NONE)
    }

    pub fn unseal_readable(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::unix::mprotect(ptr, len, libc::PROT_READ)
    }

    pub fn unseal_writable(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::unix::mprotect(ptr, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    pub fn lock_region(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::unix::mlock(ptr, len)
    }

    pub fn unlock_region(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::unix::munlock(ptr, len)
    }

    pub fn exclude_from_dumps(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        return ffi::unix::madvise(ptr, len, libc::MADV_DONTDUMP);
        #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
        return ffi::unix::madvise(ptr, len, libc::MADV_NOCORE);
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "dragonfly"
        )))]
        {
            let _ = (ptr, len);
            Ok(())
        }
    }

    pub fn readmit_to_dumps(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        return ffi::unix::madvise(ptr, len, libc::MADV_DODUMP);
        #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
        return ffi::unix::madvise(ptr, len, libc::MADV_CORE);
        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "dragonfly"
        )))]
        {
            let _ = (ptr, len);
            Ok(())
        }
    }
}

#[cfg(target_family = "windows")]
mod sys {
    use core::ptr::NonNull;
    use std::io;

    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };

    use super::ffi;

    pub fn map_pages(len: usize) -> Option<NonNull<u8>> {
        ffi::windows::virtual_alloc(len, PAGE_READWRITE, MEM_COMMIT | MEM_RESERVE)
            .ok()
            .map(|ptr| ptr.cast())
    }

    pub fn unmap_pages(ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        ffi::windows::virtual_free(ptr)
    }

    pub fn seal(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::windows::virtual_protect(ptr, len, PAGE_NOACCESS).map(|_| ())
    }

    pub fn unseal_readable(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::windows::virtual_protect(ptr, len, PAGE_READONLY).map(|_| ())
    }

    pub fn unseal_writable(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::windows::virtual_protect(ptr, len, PAGE_READWRITE).map(|_| ())
    }

    pub fn lock_region(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::windows::virtual_lock(ptr, len)
    }

    pub fn unlock_region(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        ffi::windows::virtual_unlock(ptr, len)
    }

    pub fn exclude_from_dumps(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn readmit_to_dumps(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
mod sys {
    use core::ptr::NonNull;
    use std::io;

    pub fn map_pages(_len: usize) -> Option<NonNull<u8>> {
        None
    }

    pub fn unmap_pages(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn seal(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn unseal_readable(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn unseal_writable(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn lock_region(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn unlock_region(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn exclude_from_dumps(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub fn readmit_to_dumps(_ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }
}

// Tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::page_size;

    #[test]
    fn test_alloc_returns_zero_filled_memory() {
        let ptr = secure_alloc(512).expect("Failed to allocate region");

        let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), 512) };
        assert!(bytes.iter().all(|&b| b == GARBAGE_BYTE));

        unsafe { secure_free(ptr, 512) };
    }

    #[test]
    fn test_write_and_read_back() {
        let ptr = secure_alloc(64).expect("Failed to allocate region");

        unsafe {
            let bytes = slice::from_raw_parts_mut(ptr.as_ptr(), 64);
            bytes.fill(0xAB);
            assert!(bytes.iter().all(|&b| b == 0xAB));

            secure_free(ptr, 64);
        }
    }

    #[test]
    fn test_zero_len_round_trip() {
        let ptr = secure_alloc(0).expect("Failed to allocate empty region");

        unsafe {
            check_canary(ptr, 0);
            secure_free(ptr, 0);
        }
    }

    #[test]
    fn test_check_canary_passes_on_intact_region() {
        let ptr = secure_alloc(4096).expect("Failed to allocate region");

        unsafe {
            check_canary(ptr, 4096);
            // Writes within the user span never touch the canaries.
            let bytes = slice::from_raw_parts_mut(ptr.as_ptr(), 4096);
            bytes.fill(0x55);
            check_canary(ptr, 4096);

            secure_free(ptr, 4096);
        }
    }

    #[test]
    fn test_various_sizes_round_trip() {
        let page = page_size();

        for len in [0, 1, page - 1, page, page + 1, 10 * page] {
            let ptr = secure_alloc(len).expect("Failed to allocate region");

            if len > 0 {
                unsafe {
                    ptr.as_ptr().write(0x5A);
                    assert_eq!(ptr.as_ptr().read(), 0x5A);

                    // At len == 1 this lands on the same byte and wins.
                    ptr.as_ptr().add(len - 1).write(0xA5);
                    assert_eq!(ptr.as_ptr().add(len - 1).read(), 0xA5);
                }
            }

            unsafe { secure_free(ptr, len) };
        }
    }

    #[test]
    fn test_overflowing_len_fails() {
        assert!(secure_alloc(usize::MAX).is_none());
        assert!(secure_alloc_with(Capabilities::PLAIN_HEAP, usize::MAX).is_none());
    }

    #[test]
    fn test_unsealed_tier_keeps_canaries_readable() {
        let caps = Capabilities::ZERO_FILL_ONLY;
        let ptr = secure_alloc_with(caps, 64).expect("Failed to allocate region");
        let geom = RegionGeometry::for_len(64, caps).expect("Failed to compute geometry");

        unsafe {
            let base = geom.base_ptr(ptr);
            let leading = slice::from_raw_parts(base.as_ptr(), geom.canary_len());
            assert!(leading.iter().all(|&b| b == CANARY_BYTE));

            let trailing = slice::from_raw_parts(
                geom.trailing_canary_ptr(base).as_ptr(),
                geom.canary_len(),
            );
            assert!(trailing.iter().all(|&b| b == CANARY_BYTE));

            secure_free_with(caps, ptr, 64);
        }
    }

    #[test]
    fn test_plain_heap_tier_round_trip() {
        let caps = Capabilities::PLAIN_HEAP;
        let ptr = secure_alloc_with(caps, 100).expect("Failed to allocate region");

        unsafe {
            let bytes = slice::from_raw_parts_mut(ptr.as_ptr(), 100);
            assert!(bytes.iter().all(|&b| b == GARBAGE_BYTE));
            bytes.fill(0x77);

            check_canary_with(caps, ptr, 100);
            secure_free_with(caps, ptr, 100);
        }
    }
}
