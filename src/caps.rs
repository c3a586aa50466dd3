use std::{env, sync::OnceLock};

use crate::geometry::page_size;

/// Environment variable that lowers the detected protection tier.
pub const TIER_ENV_VAR: &str = "GUARDALLOC_TIER";

/// Alignment guaranteed for the user span on the plain-heap tier.
pub const HEAP_FALLBACK_ALIGN: usize = 16;

/// Protection features available for guarded regions.
///
/// The descriptor is threaded through every acquisition, verification and
/// release, so a region is always torn down with the same features it was
/// built with. [`Capabilities::current`] is the descriptor detected once
/// for this process; the `*_with` entry points of the allocation functions
/// accept an explicit one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    page_aligned: bool,
    seal_guards: bool,
    lock_memory: bool,
    exclude_dumps: bool,
}

impl Capabilities {
    /// Page-aligned mappings, sealed canary pages, memory locking and core
    /// dump exclusion.
    pub const FULL: Self = Self {
        page_aligned: true,
        seal_guards: true,
        lock_memory: true,
        exclude_dumps: true,
    };

    /// Page-aligned mappings whose canaries are written but never sealed;
    /// no locking, no dump exclusion.
    pub const ZERO_FILL_ONLY: Self = Self {
        page_aligned: true,
        seal_guards: false,
        lock_memory: false,
        exclude_dumps: false,
    };

    /// Ordinary heap allocations carrying canary bytes and wiping only.
    /// Locking is still attempted where the platform has a call for it.
    pub const PLAIN_HEAP: Self = Self {
        page_aligned: false,
        seal_guards: false,
        lock_memory: true,
        exclude_dumps: false,
    };

    /// The descriptor detected for this process.
    ///
    /// Detection runs once; later calls return the cached value, which is
    /// what keeps acquisition and release of a region symmetric.
    pub fn current() -> Self {
        static CURRENT: OnceLock<Capabilities> = OnceLock::new();
        *CURRENT.get_or_init(Self::detect)
    }

    /// Detects the protection features of the running platform.
    ///
    /// The [`TIER_ENV_VAR`] environment variable (`full`, `zerofill` or
    /// `heap`, case-insensitive) lowers the result to the named tier.
    /// Features the platform lacks are dropped either way; unknown values
    /// are ignored.
    pub fn detect() -> Self {
        Self::detect_from(env::var(TIER_ENV_VAR).ok().as_deref())
    }

    fn detect_from(override_name: Option<&str>) -> Self {
        let supported = Self::platform_support();
        match override_name.and_then(|name| Self::from_tier_name(name.trim())) {
            Some(requested) => requested.intersect(supported),
            None => supported,
        }
    }

    /// Parses a tier name as accepted by the [`TIER_ENV_VAR`] variable.
    pub fn from_tier_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("full") {
            Some(Self::FULL)
        } else if name.eq_ignore_ascii_case("zerofill") {
            Some(Self::ZERO_FILL_ONLY)
        } else if name.eq_ignore_ascii_case("heap") {
            Some(Self::PLAIN_HEAP)
        } else {
            None
        }
    }

    fn platform_support() -> Self {
        if cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd",
            target_os = "dragonfly"
        )) {
            Self::FULL
        } else if cfg!(target_family = "unix") {
            // No madvise flag for dump exclusion on the remaining unices.
            Self {
                exclude_dumps: false,
                ..Self::FULL
            }
        } else if cfg!(target_family = "windows") {
            // No VirtualAlloc-level equivalent of MADV_DONTDUMP.
            Self {
                exclude_dumps: false,
                ..Self::FULL
            }
        } else {
            Self {
                lock_memory: false,
                ..Self::PLAIN_HEAP
            }
        }
    }

    fn intersect(self, other: Self) -> Self {
        Self {
            page_aligned: self.page_aligned && other.page_aligned,
            seal_guards: self.seal_guards && other.seal_guards,
            lock_memory: self.lock_memory && other.lock_memory,
            exclude_dumps: self.exclude_dumps && other.exclude_dumps,
        }
    }

    /// Whether regions are backed by page-aligned mappings.
    pub fn page_aligned(&self) -> bool {
        self.page_aligned
    }

    /// Whether canary pages are sealed against all access.
    pub fn seals_guards(&self) -> bool {
        self.seal_guards
    }

    /// Whether regions are locked against being paged out.
    pub fn locks_memory(&self) -> bool {
        self.lock_memory
    }

    /// Whether regions are excluded from core dumps.
    pub fn excludes_from_dumps(&self) -> bool {
        self.exclude_dumps
    }

    /// Largest alignment the user span is guaranteed to have.
    ///
    /// Page-aligned tiers place the user span on a page boundary; the
    /// plain-heap tier guarantees [`HEAP_FALLBACK_ALIGN`].
    pub fn user_align(&self) -> usize {
        if self.page_aligned {
            page_size()
        } else {
            HEAP_FALLBACK_ALIGN
        }
    }
}
