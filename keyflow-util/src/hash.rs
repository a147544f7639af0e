//! Stable 64-bit hashing.
//!
//! The default keymap assigns a key's owning rank by hashing it, so every
//! rank must compute the same hash for the same key. [`hash64`] uses an
//! unseeded xxh3 hasher, which is stable across processes (unlike the
//! randomly-seeded hashers used for in-memory maps).

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

/// Hash `value` to a stable 64-bit digest.
pub fn hash64<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = Xxh3::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_hash() {
        assert_eq!(hash64(&(3u64, 7u64)), hash64(&(3u64, 7u64)));
        assert_eq!(hash64("a key"), hash64("a key"));
    }

    #[test]
    fn different_inputs_differ() {
        // Not a guarantee in general, but these must not collide for the
        // distribution tests downstream to make sense.
        assert_ne!(hash64(&0u64), hash64(&1u64));
    }
}
