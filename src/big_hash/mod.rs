//! # Big Hash Engine
//!
//! The small-object engine: a fixed set-associative hash table on the
//! device. `hash % num_buckets` names the one bucket a key can live in;
//! every operation reads that bucket, mutates the in-memory image, and
//! rewrites it with one aligned write, the atomicity unit. Torn writes are
//! caught by the bucket checksum on the next read and parse as an empty
//! bucket.
//!
//! Concurrency is a striped lock keyed by bucket index, protecting both the
//! bucket bytes and its bloom filter. Lookups consult the filter before
//! paying for the device read. Destructor callbacks fire outside the stripe
//! lock: `Removed` for explicit removes and same-key overwrites, `Recycled`
//! for entries pushed out by bucket overflow.
//!
//! A random `epoch` stamps every bucket written in this cache life. Cold
//! start draws a new epoch instead of wiping the device: every old bucket
//! fails the epoch check on first touch and is treated as empty.

pub(crate) mod bloom;
pub(crate) mod bucket;

pub use bloom::BloomConfig;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use crate::device::{AlignedBuf, Device};
use crate::driver::{DestructorCallback, DestructorEvent};
use crate::error::{Error, Result};
use crate::hash::hash_key;
use bloom::BloomFilterSet;
use bucket::{bucket_capacity, Bucket, BucketEntry, BUCKET_ENTRY_HEADER_SIZE};

pub(crate) struct BigHashParams {
    pub base_offset: u64,
    pub size: u64,
    pub bucket_size: u64,
    pub bloom: Option<BloomConfig>,
}

pub(crate) struct BigHash {
    device: Arc<dyn Device>,
    base_offset: u64,
    bucket_size: u64,
    num_buckets: u64,
    block_size: usize,
    epoch: AtomicU32,
    locks: Box<[parking_lot::Mutex<()>]>,
    bloom: Option<BloomFilterSet>,
    destructor: Option<DestructorCallback>,
}

impl BigHash {
    pub(crate) fn new(
        params: BigHashParams,
        device: Arc<dyn Device>,
        destructor: Option<DestructorCallback>,
    ) -> Result<Arc<Self>> {
        let block_size = device.io_alignment();
        if params.bucket_size == 0 || params.bucket_size % block_size != 0 {
            return Err(Error::invalid_argument(format!(
                "bucket size {} is not a positive multiple of block size {}",
                params.bucket_size, block_size
            )));
        }
        if params.size == 0 || params.size % params.bucket_size != 0 {
            return Err(Error::invalid_argument(
                "big hash size must be a positive multiple of bucket size",
            ));
        }
        let num_buckets = params.size / params.bucket_size;

        let bloom = params
            .bloom
            .map(|config| BloomFilterSet::new(num_buckets, config))
            .transpose()?;

        Ok(Arc::new(Self {
            device,
            base_offset: params.base_offset,
            bucket_size: params.bucket_size,
            num_buckets,
            block_size: block_size as usize,
            epoch: AtomicU32::new(random_epoch()),
            locks: (0..crate::config::BUCKET_LOCK_STRIPES)
                .map(|_| parking_lot::Mutex::new(()))
                .collect(),
            bloom,
            destructor,
        }))
    }

    /// Largest `key + value` payload a bucket can hold; the driver's
    /// `small_item_max_size` must stay below it.
    pub(crate) fn max_payload(bucket_size: u64) -> usize {
        bucket_capacity(bucket_size).saturating_sub(BUCKET_ENTRY_HEADER_SIZE)
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> u64 {
        hash % self.num_buckets
    }

    #[inline]
    fn bucket_offset(&self, bucket: u64) -> u64 {
        self.base_offset + bucket * self.bucket_size
    }

    #[inline]
    fn stripe(&self, bucket: u64) -> &parking_lot::Mutex<()> {
        &self.locks[(bucket % self.locks.len() as u64) as usize]
    }

    fn read_bucket(&self, bucket: u64) -> Result<Bucket> {
        let mut buf = AlignedBuf::zeroed(self.bucket_size as usize, self.block_size);
        self.device.read(self.bucket_offset(bucket), &mut buf)?;
        Ok(Bucket::parse(&buf, self.epoch.load(Ordering::Acquire)))
    }

    fn write_bucket(&self, bucket: u64, image: &mut Bucket) -> Result<()> {
        image.generation = image.generation.wrapping_add(1);
        let mut buf = AlignedBuf::zeroed(self.bucket_size as usize, self.block_size);
        image.serialize(&mut buf, self.epoch.load(Ordering::Acquire));
        self.device.write(self.bucket_offset(bucket), &buf)
    }

    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let hash = hash_key(key);
        let capacity = bucket_capacity(self.bucket_size);
        let entry = BucketEntry {
            key_hash: hash,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        if entry.wire_len() > capacity {
            return Err(Error::Rejected);
        }
        let bucket = self.bucket_of(hash);

        let (replaced, evicted) = {
            let _guard = self.stripe(bucket).lock();
            if let Some(bloom) = &self.bloom {
                bloom.set(bucket, hash);
            }
            let mut image = self.read_bucket(bucket)?;
            let (replaced, evicted) = image.insert(entry, capacity);
            if !evicted.is_empty() {
                // Overflow rewrites the whole bucket; the filter must forget
                // the evicted keys' bits where possible.
                if let Some(bloom) = &self.bloom {
                    bloom.rebuild(bucket, image.entries.iter().map(|e| e.key_hash));
                }
            }
            self.write_bucket(bucket, &mut image)?;
            (replaced, evicted)
        };

        if let Some(old) = replaced {
            self.notify(&old.key, &old.value, DestructorEvent::Removed);
        }
        for old in evicted {
            self.notify(&old.key, &old.value, DestructorEvent::Recycled);
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        let hash = hash_key(key);
        let bucket = self.bucket_of(hash);
        let _guard = self.stripe(bucket).lock();
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(bucket, hash) {
                return Err(Error::NotFound);
            }
        }
        let image = self.read_bucket(bucket)?;
        image
            .find(hash, key)
            .map(|entry| entry.value.clone())
            .ok_or(Error::NotFound)
    }

    pub(crate) fn remove(&self, key: &[u8]) -> Result<()> {
        let hash = hash_key(key);
        let bucket = self.bucket_of(hash);

        let removed = {
            let _guard = self.stripe(bucket).lock();
            let mut image = self.read_bucket(bucket)?;
            let Some(removed) = image.remove(hash, key) else {
                return Err(Error::NotFound);
            };
            // Full-bucket rewrite: recompute the filter from survivors.
            if let Some(bloom) = &self.bloom {
                bloom.rebuild(bucket, image.entries.iter().map(|e| e.key_hash));
            }
            self.write_bucket(bucket, &mut image)?;
            removed
        };

        self.notify(&removed.key, &removed.value, DestructorEvent::Removed);
        Ok(())
    }

    /// Filter-only membership test; no device read. Without a filter every
    /// key "could" exist.
    pub(crate) fn could_exist(&self, key: &[u8]) -> bool {
        match &self.bloom {
            Some(bloom) => {
                let hash = hash_key(key);
                let bucket = self.bucket_of(hash);
                let _guard = self.stripe(bucket).lock();
                bloom.may_contain(bucket, hash)
            }
            None => true,
        }
    }

    pub(crate) fn snapshot(&self) -> (u32, Option<Vec<u64>>) {
        (
            self.epoch.load(Ordering::Acquire),
            self.bloom.as_ref().map(BloomFilterSet::snapshot),
        )
    }

    pub(crate) fn restore(&self, epoch: u32, bloom_words: Option<&[u64]>) -> Result<()> {
        match (&self.bloom, bloom_words) {
            (Some(bloom), Some(words)) => bloom.restore(words)?,
            (Some(bloom), None) => {
                // Snapshot predates the filter config; start pessimistic-empty
                // and let epoch checks resolve stale buckets.
                warn!("bloom snapshot missing, filters start empty");
                bloom.clear_all();
            }
            _ => {}
        }
        self.epoch.store(epoch, Ordering::Release);
        debug!(epoch, "big hash state restored");
        Ok(())
    }

    /// Cold start: a fresh random epoch orphans every on-device bucket, and
    /// the filters go back to definite-miss.
    pub(crate) fn reset(&self) {
        let epoch = random_epoch();
        self.epoch.store(epoch, Ordering::Release);
        if let Some(bloom) = &self.bloom {
            bloom.clear_all();
        }
        debug!(epoch, "big hash cold start");
    }

    fn notify(&self, key: &[u8], value: &[u8], event: DestructorEvent) {
        if let Some(callback) = &self.destructor {
            callback(key, value, event);
        }
    }
}

fn random_epoch() -> u32 {
    // Zero is reserved so a zeroed device never validates.
    rand::thread_rng().gen_range(1..=u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use parking_lot::Mutex;

    fn engine_with_destructor() -> (Arc<BigHash>, Arc<Mutex<Vec<(Vec<u8>, DestructorEvent)>>>) {
        let events: Arc<Mutex<Vec<(Vec<u8>, DestructorEvent)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: DestructorCallback = Arc::new(move |key, _value, event| {
            sink.lock().push((key.to_vec(), event));
        });
        let device = Arc::new(MemoryDevice::new(1 << 20));
        let engine = BigHash::new(
            BigHashParams {
                base_offset: 0,
                size: 1 << 20,
                bucket_size: 4096,
                bloom: Some(BloomConfig {
                    num_hashes: 4,
                    bits_per_bucket: 2048,
                }),
            },
            device,
            Some(callback),
        )
        .unwrap();
        (engine, events)
    }

    #[test]
    fn insert_lookup_remove_cycle() {
        let (engine, _) = engine_with_destructor();
        engine.insert(b"small", b"payload").unwrap();
        assert_eq!(engine.lookup(b"small").unwrap(), b"payload");
        assert!(engine.could_exist(b"small"));

        engine.remove(b"small").unwrap();
        assert!(matches!(engine.lookup(b"small"), Err(Error::NotFound)));
        assert!(matches!(engine.remove(b"small"), Err(Error::NotFound)));
    }

    #[test]
    fn overwrite_fires_removed_for_old_value() {
        let (engine, events) = engine_with_destructor();
        engine.insert(b"k", b"v1").unwrap();
        engine.insert(b"k", b"v2").unwrap();
        assert_eq!(engine.lookup(b"k").unwrap(), b"v2");

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], (b"k".to_vec(), DestructorEvent::Removed));
    }

    #[test]
    fn bloom_negative_short_circuits() {
        let (engine, _) = engine_with_destructor();
        assert!(!engine.could_exist(b"never-inserted"));
        assert!(matches!(engine.lookup(b"nothing"), Err(Error::NotFound)));
    }

    #[test]
    fn reset_orphans_existing_buckets() {
        let (engine, _) = engine_with_destructor();
        engine.insert(b"key", b"value").unwrap();
        engine.reset();
        assert!(matches!(engine.lookup(b"key"), Err(Error::NotFound)));
    }

    #[test]
    fn snapshot_restore_preserves_visibility() {
        let (engine, _) = engine_with_destructor();
        engine.insert(b"key", b"value").unwrap();
        let (epoch, words) = engine.snapshot();

        engine.reset();
        engine.restore(epoch, words.as_deref()).unwrap();
        assert_eq!(engine.lookup(b"key").unwrap(), b"value");
    }

    #[test]
    fn oversized_item_is_rejected() {
        let (engine, _) = engine_with_destructor();
        let huge = vec![0u8; 5000];
        assert!(matches!(engine.insert(b"k", &huge), Err(Error::Rejected)));
    }
}
