//! Deterministic map and set aliases used by every table in the crate.
//!
//! Almost everything here keys on fixed-width integers: variable ids,
//! the eight-word CSE key, 128-bit kernel fingerprints. The hasher mixes
//! whole 64-bit words instead of walking bytes, and it carries no
//! per-process random seed, so iteration-adjacent behavior (probe
//! order, collision patterns) reproduces across runs the same way the
//! fingerprints themselves do.

use std::hash::{BuildHasherDefault, Hasher};

pub type Map<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<WordHasher>>;
pub type Set<K> = std::collections::HashSet<K, BuildHasherDefault<WordHasher>>;

/// Unseeded multiply-rotate mixer over 64-bit words.
#[derive(Default)]
pub struct WordHasher {
    state: u64,
}

impl WordHasher {
    #[inline]
    fn mix(&mut self, word: u64) {
        self.state = (self.state ^ word).wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(26);
    }
}

impl Hasher for WordHasher {
    #[inline]
    fn finish(&self) -> u64 {
        // One avalanche round so low-entropy keys (small ids) spread
        let mut h = self.state;
        h ^= h >> 32;
        h = h.wrapping_mul(0xd6e8_feb8_6659_fd93);
        h ^ (h >> 32)
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.mix(u64::from_le_bytes(word));
        }
        self.mix(bytes.len() as u64);
    }

    #[inline]
    fn write_u32(&mut self, x: u32) {
        self.mix(u64::from(x));
    }

    #[inline]
    fn write_u64(&mut self, x: u64) {
        self.mix(x);
    }

    #[inline]
    fn write_u128(&mut self, x: u128) {
        self.mix(x as u64);
        self.mix((x >> 64) as u64);
    }

    #[inline]
    fn write_usize(&mut self, x: usize) {
        self.mix(x as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(write: impl FnOnce(&mut WordHasher)) -> u64 {
        let mut h = WordHasher::default();
        write(&mut h);
        h.finish()
    }

    #[test]
    fn deterministic_and_word_order_sensitive() {
        let a = hash_of(|h| h.write_u64(1));
        let b = hash_of(|h| h.write_u64(1));
        assert_eq!(a, b);

        let ab = hash_of(|h| {
            h.write_u32(1);
            h.write_u32(2);
        });
        let ba = hash_of(|h| {
            h.write_u32(2);
            h.write_u32(1);
        });
        assert_ne!(ab, ba);
    }

    #[test]
    fn small_ids_spread() {
        // Consecutive variable ids must not land in consecutive buckets
        let h1 = hash_of(|h| h.write_u32(1));
        let h2 = hash_of(|h| h.write_u32(2));
        assert_ne!(h1 & 0xff, h2 & 0xff);
        assert_ne!(h1, 0);
    }
}
