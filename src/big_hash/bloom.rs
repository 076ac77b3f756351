//! Per-bucket bloom filters.
//!
//! One filter per on-device bucket, all packed into a single word array
//! (`bits_per_bucket` rounded up to whole 64-bit words so bucket filters
//! never share a word). A negative membership test lets a lookup skip the
//! bucket's device read entirely.
//!
//! Bits are set on insert and recomputed from surviving entries whenever a
//! bucket is fully rewritten (remove, overflow eviction); a filter is never
//! reset mid-life. Mutation happens under the bucket's stripe lock; the
//! words are atomics only so concurrent tests on *other* buckets race
//! benignly with a rebuild.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::hash::probe_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomConfig {
    /// Hash probes per key.
    pub num_hashes: u32,
    /// Filter width in bits for each bucket.
    pub bits_per_bucket: u32,
}

pub(crate) struct BloomFilterSet {
    num_hashes: u32,
    bits_per_bucket: u32,
    words_per_bucket: usize,
    words: Box<[AtomicU64]>,
}

impl BloomFilterSet {
    pub(crate) fn new(num_buckets: u64, config: BloomConfig) -> Result<Self> {
        if config.num_hashes == 0 || config.bits_per_bucket == 0 {
            return Err(Error::invalid_argument(
                "bloom filter needs nonzero hash count and bit width",
            ));
        }
        let words_per_bucket = config.bits_per_bucket.div_ceil(64) as usize;
        let total = words_per_bucket
            .checked_mul(num_buckets as usize)
            .ok_or_else(|| Error::invalid_argument("bloom filter size overflow"))?;
        Ok(Self {
            num_hashes: config.num_hashes,
            bits_per_bucket: config.bits_per_bucket,
            words_per_bucket,
            words: (0..total).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    #[inline]
    fn bucket_words(&self, bucket: u64) -> &[AtomicU64] {
        let start = bucket as usize * self.words_per_bucket;
        &self.words[start..start + self.words_per_bucket]
    }

    #[inline]
    fn bit_of(&self, hash: u64, probe: u32) -> (usize, u64) {
        let bit = probe_hash(hash, probe) % self.bits_per_bucket as u64;
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    pub(crate) fn set(&self, bucket: u64, hash: u64) {
        let words = self.bucket_words(bucket);
        for probe in 0..self.num_hashes {
            let (word, mask) = self.bit_of(hash, probe);
            words[word].fetch_or(mask, Ordering::Relaxed);
        }
    }

    pub(crate) fn may_contain(&self, bucket: u64, hash: u64) -> bool {
        let words = self.bucket_words(bucket);
        (0..self.num_hashes).all(|probe| {
            let (word, mask) = self.bit_of(hash, probe);
            words[word].load(Ordering::Relaxed) & mask != 0
        })
    }

    /// Recomputes one bucket's filter from the hashes that survive a full
    /// bucket rewrite.
    pub(crate) fn rebuild(&self, bucket: u64, hashes: impl Iterator<Item = u64>) {
        for word in self.bucket_words(bucket) {
            word.store(0, Ordering::Relaxed);
        }
        for hash in hashes {
            self.set(bucket, hash);
        }
    }

    pub(crate) fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<u64> {
        self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    pub(crate) fn restore(&self, words: &[u64]) -> Result<()> {
        if words.len() != self.words.len() {
            return Err(Error::invalid_argument(format!(
                "bloom snapshot has {} words, layout needs {}",
                words.len(),
                self.words.len()
            )));
        }
        for (slot, &value) in self.words.iter().zip(words) {
            slot.store(value, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_key;

    fn set() -> BloomFilterSet {
        BloomFilterSet::new(
            64,
            BloomConfig {
                num_hashes: 4,
                bits_per_bucket: 2048,
            },
        )
        .unwrap()
    }

    #[test]
    fn set_then_contains() {
        let bloom = set();
        let hash = hash_key(b"alpha");
        assert!(!bloom.may_contain(3, hash));
        bloom.set(3, hash);
        assert!(bloom.may_contain(3, hash));
        // Other buckets stay clean.
        assert!(!bloom.may_contain(4, hash));
    }

    #[test]
    fn rebuild_forgets_dropped_hashes() {
        let bloom = set();
        let keep = hash_key(b"keep");
        let drop = hash_key(b"drop");
        bloom.set(7, keep);
        bloom.set(7, drop);

        bloom.rebuild(7, std::iter::once(keep));
        assert!(bloom.may_contain(7, keep));
        assert!(!bloom.may_contain(7, drop));
    }

    #[test]
    fn false_positive_rate_is_sane() {
        let bloom = set();
        for i in 0..40 {
            bloom.set(0, hash_key(format!("present-{i}").as_bytes()));
        }
        let mut false_positives = 0;
        for i in 0..1000 {
            if bloom.may_contain(0, hash_key(format!("absent-{i}").as_bytes())) {
                false_positives += 1;
            }
        }
        // 2048 bits / 40 keys / 4 hashes is far below 1% in expectation;
        // 5% leaves generous slack.
        assert!(false_positives < 50, "{false_positives} false positives");
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let bloom = set();
        bloom.set(1, hash_key(b"x"));
        bloom.set(63, hash_key(b"y"));
        let words = bloom.snapshot();

        let other = set();
        other.restore(&words).unwrap();
        assert!(other.may_contain(1, hash_key(b"x")));
        assert!(other.may_contain(63, hash_key(b"y")));
        assert!(other.restore(&words[1..]).is_err());
    }

    #[test]
    fn rejects_zero_config() {
        assert!(BloomFilterSet::new(
            4,
            BloomConfig {
                num_hashes: 0,
                bits_per_bucket: 64
            }
        )
        .is_err());
    }
}
