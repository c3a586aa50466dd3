use core::{fmt, ops::Deref, str};

use allocator_api2::vec::Vec;
use hashbrown::{hash_map::DefaultHashBuilder, HashMap};

use crate::adapter::GuardedAlloc;

/// A vector whose buffer lives in guarded regions.
///
/// Construct it through the allocator-taking constructors, e.g.
/// `GuardedVec::new_in(GuardedAlloc)` or
/// `GuardedVec::with_capacity_in(n, GuardedAlloc)`. Every buffer the
/// vector grows out of is verified and wiped as it is replaced.
pub type GuardedVec<T> = Vec<T, GuardedAlloc>;

/// A hash map whose table lives in guarded regions.
///
/// Construct it through `GuardedMap::new_in(GuardedAlloc)` or
/// `GuardedMap::with_capacity_in(n, GuardedAlloc)`.
pub type GuardedMap<K, V, S = DefaultHashBuilder> = HashMap<K, V, S, GuardedAlloc>;

/// A UTF-8 string whose bytes live in guarded regions.
///
/// `String` cannot carry a custom allocator, so this is a thin owner of a
/// [`GuardedVec<u8>`] upholding UTF-8.
#[derive(Clone)]
pub struct GuardedString {
    vec: GuardedVec<u8>,
}

impl GuardedString {
    /// Creates an empty string. No region is held until bytes arrive.
    pub fn new() -> Self {
        Self {
            vec: Vec::new_in(GuardedAlloc),
        }
    }

    /// Creates an empty string with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            vec: Vec::with_capacity_in(capacity, GuardedAlloc),
        }
    }

    /// The contents as a string slice.
    pub fn as_str(&self) -> &str {
        // Only UTF-8 ever enters the vector.
        unsafe { str::from_utf8_unchecked(&self.vec) }
    }

    /// Appends a character.
    pub fn push(&mut self, ch: char) {
        let mut buf = [0u8; 4];
        self.vec
            .extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
    }

    /// Appends a string slice.
    pub fn push_str(&mut self, s: &str) {
        self.vec.extend_from_slice(s.as_bytes());
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.vec.len()
    }

    /// Whether the string holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    /// Truncates to zero length, keeping the buffer.
    pub fn clear(&mut self) {
        self.vec.clear();
    }
}

impl Default for GuardedString {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for GuardedString {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for GuardedString {
    fn from(s: &str) -> Self {
        let mut vec = Vec::with_capacity_in(s.len(), GuardedAlloc);
        vec.extend_from_slice(s.as_bytes());
        Self { vec }
    }
}

impl fmt::Write for GuardedString {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl PartialEq for GuardedString {
    fn eq(&self, other: &Self) -> bool {
        self.vec == other.vec
    }
}

impl Eq for GuardedString {}

impl PartialEq<str> for GuardedString {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for GuardedString {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl core::hash::Hash for GuardedString {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Display for GuardedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for GuardedString {
    // Contents stay out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuardedString(..)")
    }
}
