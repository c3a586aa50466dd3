//! Guarded allocation for secret-holding memory.
//!
//! Every allocation is an isolated region between two canary pages. The
//! region is locked against swapping and excluded from core dumps where
//! the platform allows, and the canaries are sealed so any touch faults
//! immediately. Memory arrives zero-filled and is verified and wiped on
//! release; a corrupted canary aborts the process rather than letting an
//! overwrite travel further.
//!
//! ```
//! let mut secret = guardalloc::GuardedBox::new([0u8; 32]).expect("no guarded memory");
//! secret[..7].copy_from_slice(b"hunter2");
//! secret.check_canary();
//! drop(secret); // verified, wiped, unmapped
//! ```

mod adapter;
mod alloc;
mod boxed;
mod caps;
mod collections;
mod geometry;
mod wipe;

pub use adapter::GuardedAlloc;
pub use alloc::{
    check_canary, check_canary_with, secure_alloc, secure_alloc_with, secure_free,
    secure_free_with, CANARY_BYTE, GARBAGE_BYTE,
};
pub use boxed::{secure_delete, secure_delete_array, secure_new, secure_new_array, GuardedBox};
pub use caps::{Capabilities, HEAP_FALLBACK_ALIGN, TIER_ENV_VAR};
pub use collections::{GuardedMap, GuardedString, GuardedVec};
pub use geometry::{padding_for, page_size, RegionGeometry};
