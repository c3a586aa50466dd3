use core::ptr::NonNull;
use std::sync::OnceLock;

use crate::caps::Capabilities;

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Retrieves the system's page size.
///
/// The operating system is queried once per process; every later call
/// returns the cached value.
///
/// # Platform-specific behavior
/// - **Unix-based systems (Linux, macOS, etc.):**
///   - On macOS, this function uses `libc::vm_page_size` to determine the page size.
///   - On other Unix systems, it uses `libc::sysconf` to get the page size.
///
/// - **Windows:** The function retrieves the page size by calling `GetSystemInfo`
///   and extracting the `dwPageSize` field from the `SYSTEM_INFO` structure.
///
/// - **Other targets:** A fixed 4096 bytes is assumed.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    #[cfg(target_family = "unix")]
    {
        *PAGE_SIZE.get_or_init(crate::alloc::ffi::unix::page_size)
    }
    #[cfg(target_family = "windows")]
    {
        *PAGE_SIZE.get_or_init(crate::alloc::ffi::windows::page_size)
    }
    #[cfg(not(any(target_family = "unix", target_family = "windows")))]
    {
        *PAGE_SIZE.get_or_init(|| FALLBACK_PAGE_SIZE)
    }
}

/// Smallest number of bytes that rounds `len` up to a whole number of
/// pages, or zero when the process's tier has no page-aligned allocation.
pub fn padding_for(len: usize) -> usize {
    if Capabilities::current().page_aligned() {
        pad_to(len, page_size())
    } else {
        0
    }
}

fn pad_to(len: usize, page: usize) -> usize {
    match len % page {
        0 => 0,
        rem => page - rem,
    }
}

/// Byte layout of one guarded region.
///
/// A region is laid out as `[canary page][user data][padding][canary page]`.
/// Each canary spans exactly one page; the padding rounds the user span up
/// to a page multiple so the trailing canary starts on a page boundary.
/// Every length is recomputable from the user length alone, so regions
/// carry no header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionGeometry {
    canary_len: usize,
    user_len: usize,
    padding_len: usize,
}

impl RegionGeometry {
    /// Computes the geometry of a region holding `user_len` caller bytes.
    ///
    /// Returns `None` when the total region length would overflow `usize`.
    /// On capability tiers without page-aligned allocation the padding is
    /// dropped; the canary spans stay one page long.
    pub fn for_len(user_len: usize, caps: Capabilities) -> Option<Self> {
        let page = page_size();
        let padding_len = if caps.page_aligned() {
            pad_to(user_len, page)
        } else {
            0
        };

        // Reject overflowing totals here, so the accessors below can use
        // plain arithmetic.
        user_len
            .checked_add(padding_len)?
            .checked_add(page.checked_mul(2)?)?;

        Some(Self {
            canary_len: page,
            user_len,
            padding_len,
        })
    }

    /// Length of one canary span (one page).
    pub fn canary_len(&self) -> usize {
        self.canary_len
    }

    /// Length of the caller-visible span.
    pub fn user_len(&self) -> usize {
        self.user_len
    }

    /// Length of the padding between the user span and the trailing canary.
    pub fn padding_len(&self) -> usize {
        self.padding_len
    }

    /// Total length of the region, canaries and padding included.
    pub fn total_len(&self) -> usize {
        self.canary_len * 2 + self.user_len + self.padding_len
    }

    /// Offset of the user span from the region base.
    pub fn user_offset(&self) -> usize {
        self.canary_len
    }

    /// Offset of the trailing canary from the region base.
    pub fn trailing_canary_offset(&self) -> usize {
        self.canary_len + self.user_len + self.padding_len
    }

    /// Derives the user pointer from the region base.
    ///
    /// # Safety
    ///
    /// `base` must point to a live region laid out with this geometry.
    pub unsafe fn user_ptr(&self, base: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(base.as_ptr().add(self.user_offset())) }
    }

    /// Derives the region base from the user pointer.
    ///
    /// # Safety
    ///
    /// `user` must have been derived through [`Self::user_ptr`] on a live
    /// region laid out with this geometry.
    pub unsafe fn base_ptr(&self, user: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(user.as_ptr().sub(self.user_offset())) }
    }

    /// Derives the trailing canary pointer from the region base.
    ///
    /// # Safety
    ///
    /// `base` must point to a live region laid out with this geometry.
    pub unsafe fn trailing_canary_ptr(&self, base: NonNull<u8>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(base.as_ptr().add(self.trailing_canary_offset())) }
    }
}
