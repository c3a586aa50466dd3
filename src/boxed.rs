use core::{
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};

use crate::{
    alloc::{check_canary_with, secure_alloc_with, secure_free_with},
    caps::Capabilities,
};

/// Moves `value` into its own guarded region.
///
/// Returns the pointer to the value inside the region's user span, or
/// `None` when no region can be obtained; the value is dropped in that
/// case. Types more aligned than [`Capabilities::user_align`] are refused.
pub fn secure_new<T>(value: T) -> Option<NonNull<T>> {
    let caps = Capabilities::current();
    if mem::align_of::<T>() > caps.user_align() {
        return None;
    }

    let raw = secure_alloc_with(caps, mem::size_of::<T>())?;
    let ptr = raw.cast::<T>();
    unsafe { ptr.as_ptr().write(value) };

    Some(ptr)
}

/// Drops the value and releases its guarded region.
///
/// The destructor runs while the value still sits in guarded memory; the
/// region is verified and wiped afterwards.
///
/// # Safety
///
/// `ptr` must come from [`secure_new`] and not have been deleted before.
pub unsafe fn secure_delete<T>(ptr: NonNull<T>) {
    unsafe {
        ptr::drop_in_place(ptr.as_ptr());
        secure_free_with(Capabilities::current(), ptr.cast(), mem::size_of::<T>());
    }
}

/// Allocates a guarded region for `count` values of `T` without
/// constructing any of them.
///
/// The buffer is zero-filled raw storage; reading an element is only
/// defined once it has been written. Returns `None` on allocation
/// failure, on byte-length overflow, or for types more aligned than
/// [`Capabilities::user_align`].
pub fn secure_new_array<T>(count: usize) -> Option<NonNull<T>> {
    let caps = Capabilities::current();
    if mem::align_of::<T>() > caps.user_align() {
        return None;
    }

    let len = mem::size_of::<T>().checked_mul(count)?;
    let raw = secure_alloc_with(caps, len)?;

    Some(raw.cast())
}

/// Releases an array region without dropping any element.
///
/// Elements the caller initialized must be dropped beforehand where that
/// matters; this call only verifies the canaries and releases the wiped
/// storage.
///
/// # Safety
///
/// `ptr` must come from [`secure_new_array`] with this exact `count`, and
/// the region must not have been released before.
pub unsafe fn secure_delete_array<T>(ptr: NonNull<T>, count: usize) {
    let len = match mem::size_of::<T>().checked_mul(count) {
        Some(len) => len,
        // secure_new_array vetted the same product when the array was made.
        None => unreachable!(),
    };
    unsafe { secure_free_with(Capabilities::current(), ptr.cast(), len) };
}

/// A single value owned by its own guarded region.
///
/// The value lives in the user span of a canary-fenced region and is
/// reachable only through this handle. Dropping the box runs the value's
/// destructor inside the region, then verifies the canaries and wipes the
/// memory.
pub struct GuardedBox<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<T> GuardedBox<T> {
    /// Moves `value` into a fresh guarded region.
    ///
    /// Returns `None` when no region can be obtained; the value is
    /// dropped in that case.
    pub fn new(value: T) -> Option<Self> {
        let ptr = secure_new(value)?;
        Some(Self {
            ptr,
            _marker: PhantomData,
        })
    }

    /// Asserts the canaries of the backing region, aborting on corruption.
    pub fn check_canary(&self) {
        unsafe {
            check_canary_with(
                Capabilities::current(),
                self.ptr.cast(),
                mem::size_of::<T>(),
            )
        };
    }

    /// Moves the value out of guarded memory and releases the region.
    pub fn into_inner(self) -> T {
        let this = ManuallyDrop::new(self);

        unsafe {
            let value = this.ptr.as_ptr().read();
            secure_free_with(
                Capabilities::current(),
                this.ptr.cast(),
                mem::size_of::<T>(),
            );
            value
        }
    }
}

impl<T> Deref for GuardedBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for GuardedBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for GuardedBox<T> {
    fn drop(&mut self) {
        unsafe { secure_delete(self.ptr) };
    }
}

impl<T> fmt::Debug for GuardedBox<T> {
    // Contents stay out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuardedBox(..)")
    }
}

unsafe impl<T: Send> Send for GuardedBox<T> {}
unsafe impl<T: Sync> Sync for GuardedBox<T> {}
