// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Approximate resource-key sets backing the lock's admission test.
//!
//! A [`BloomSet`] is a fixed-width Bloom filter over resource keys. The lock
//! only ever asks two questions of these sets: "fold this key in" and "could
//! these two sets share a key?". Both are constant-time bit operations on a
//! 256-bit bitmap, which is what keeps the scheduler's critical sections
//! short enough to sit behind a spin lock.
//!
//! The filter is one-sided in the usual Bloom way: [`BloomSet::intersects`]
//! may report overlap for two sets that share no key (a false positive, which
//! merely forces two compatible batches to serialize), but it never misses a
//! genuine overlap. False negatives would break mutual exclusion; false
//! positives only cost throughput.

use std::fmt;
use std::hash::BuildHasher;

use foldhash::fast::FixedState;
use static_assertions::const_assert;

use crate::Key;

/// Width of the bitmap in bits.
///
/// 256 bits with [`FILTER_HASHES`] positions per key keeps the false-positive
/// rate acceptable for the batch sizes the lock merges (at most
/// [`MERGE_SATURATION`](crate::MERGE_SATURATION) writes).
pub const FILTER_BITS: usize = 256;

/// Number of bit positions derived per key.
pub const FILTER_HASHES: usize = 4;

const WORD_BITS: usize = 64;
const FILTER_WORDS: usize = FILTER_BITS / WORD_BITS;

// The bit positions are drawn as 16-bit chunks of one 64-bit mix, masked down
// to the bitmap width.
const_assert!(FILTER_BITS.is_power_of_two());
const_assert!(FILTER_BITS <= 1 << 16);
const_assert!(FILTER_HASHES * 16 <= 64);

/// Every set shares one fixed seed so that two independently built sets map
/// the same key to the same bit positions; intersection tests would be
/// meaningless otherwise.
const MIX_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// An approximate set of resource keys.
///
/// Supports insertion, bitwise union, and an intersection test. The reserved
/// key `0` ("no resource") is never folded in, so a set built purely from
/// zero keys stays empty.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BloomSet {
    words: [u64; FILTER_WORDS],
}

impl BloomSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: [0; FILTER_WORDS],
        }
    }

    /// Folds `key` into the set. Adding the reserved key `0` is a no-op.
    pub fn add(&mut self, key: Key) {
        if key == 0 {
            return;
        }

        let hash = mix(key);
        for chunk in 0..FILTER_HASHES {
            #[expect(clippy::cast_possible_truncation, reason = "masked down to the bitmap width")]
            let slot = ((hash >> (chunk * 16)) as usize) & (FILTER_BITS - 1);
            self.words[slot / WORD_BITS] |= 1 << (slot % WORD_BITS);
        }
    }

    /// Bitwise-ORs `other` into `self`.
    pub fn union_with(&mut self, other: &Self) {
        for (word, other) in self.words.iter_mut().zip(&other.words) {
            *word |= other;
        }
    }

    /// Returns true if the two sets could share a key.
    ///
    /// False positives are permitted; false negatives never occur.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.words.iter().zip(&other.words).any(|(a, b)| a & b != 0)
    }

    /// Returns true if no key has been folded in since the last clear.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Resets the set to empty.
    pub fn clear(&mut self) {
        self.words = [0; FILTER_WORDS];
    }

    fn bits_set(&self) -> u32 {
        self.words.iter().map(|word| word.count_ones()).sum()
    }
}

impl Default for BloomSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BloomSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomSet").field("bits_set", &self.bits_set()).finish()
    }
}

fn mix(key: Key) -> u64 {
    FixedState::with_seed(MIX_SEED).hash_one(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_key_always_intersects() {
        // Two sets that genuinely share a key must intersect; a miss here
        // would be a false negative, which the filter can never produce.
        for key in 1..200u64 {
            let mut a = BloomSet::new();
            let mut b = BloomSet::new();
            a.add(key);
            b.add(key);
            b.add(key.wrapping_mul(7919));
            assert!(a.intersects(&b), "sets sharing key {key} must intersect");
        }
    }

    #[test]
    fn zero_key_is_a_no_op() {
        let mut set = BloomSet::new();
        set.add(0);
        assert!(set.is_empty());
        assert_eq!(set.bits_set(), 0);
    }

    #[test]
    fn empty_sets_never_intersect() {
        let mut populated = BloomSet::new();
        populated.add(17);
        assert!(!BloomSet::new().intersects(&populated));
        assert!(!populated.intersects(&BloomSet::new()));
    }

    #[test]
    fn union_covers_both_operands() {
        let mut a = BloomSet::new();
        let mut b = BloomSet::new();
        a.add(3);
        b.add(1000);

        let mut merged = a;
        merged.union_with(&b);

        assert!(merged.intersects(&a));
        assert!(merged.intersects(&b));
    }

    #[test]
    fn insertion_order_is_irrelevant() {
        let keys = [5u64, 900, 123_456, 42];

        let mut forward = BloomSet::new();
        for key in keys {
            forward.add(key);
        }
        let mut backward = BloomSet::new();
        for key in keys.iter().rev() {
            backward.add(*key);
        }

        assert_eq!(forward, backward);
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut set = BloomSet::new();
        set.add(7);
        set.add(8);
        assert!(!set.is_empty());

        set.clear();
        assert!(set.is_empty());
        assert_eq!(set, BloomSet::new());
    }

    #[test]
    fn add_is_idempotent() {
        let mut once = BloomSet::new();
        once.add(99);
        let mut twice = once;
        twice.add(99);
        assert_eq!(once, twice);
    }
}
