//! # Cache Construction
//!
//! Plain configuration records with chained setters and a single validating
//! [`CacheConfig::build`]. Nothing talks to the device until `build`; every
//! invalid combination surfaces as `InvalidArgument` with a reason, never a
//! panic.
//!
//! ```ignore
//! let cache = CacheConfig::new(device)
//!     .metadata_size(4 << 20)
//!     .block_cache(BlockCacheConfig::new(4 << 20, 60 << 20, 1 << 20))
//!     .big_hash(BigHashConfig::new(64 << 20, 16 << 20, 4096), 2048)
//!     .build()?;
//! cache.recover()?;
//! ```

use std::sync::Arc;

use zerocopy::little_endian::{U32, U64};

use crate::admission::{AdmissionConfig, AdmissionPolicy};
use crate::big_hash::{BigHash, BigHashParams, BloomConfig};
use crate::block_cache::{BlockCache, BlockCacheParams, ReinsertionConfig};
use crate::config::{
    DEFAULT_CLEAN_REGIONS_POOL, DEFAULT_MAX_CONCURRENT_INSERTS, DEFAULT_MAX_PARCEL_MEMORY,
    DEFAULT_QUARANTINE_WATERMARK, MAX_KEY_SIZE,
};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::metadata::{Fingerprint, ENGINE_BIG_HASH, ENGINE_BLOCK_CACHE};
use crate::region::allocator::{AllocMode, RegionAllocator};
use crate::region::{EvictionPolicyConfig, RegionManager};
use crate::scheduler::{JobScheduler, SchedulerConfig};

use super::{Cache, DestructorCallback};

/// Block-cache engine layout and policies.
pub struct BlockCacheConfig {
    base_offset: u64,
    size: u64,
    region_size: u64,
    checksums: bool,
    eviction: EvictionPolicyConfig,
    size_classes: Vec<u32>,
    read_buffer_size: u64,
    clean_regions_pool: usize,
    num_in_mem_buffers: usize,
    reinsertion: ReinsertionConfig,
}

impl BlockCacheConfig {
    /// A stack-allocated, LRU-evicted block cache occupying
    /// `[base_offset, base_offset + size)`.
    pub fn new(base_offset: u64, size: u64, region_size: u64) -> Self {
        Self {
            base_offset,
            size,
            region_size,
            checksums: false,
            eviction: EvictionPolicyConfig::Lru,
            size_classes: Vec::new(),
            read_buffer_size: 0,
            clean_regions_pool: DEFAULT_CLEAN_REGIONS_POOL,
            num_in_mem_buffers: 0,
            reinsertion: ReinsertionConfig::None,
        }
    }

    /// Enables per-entry payload checksumming.
    pub fn checksum(mut self, enable: bool) -> Self {
        self.checksums = enable;
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicyConfig) -> Self {
        self.eviction = policy;
        self
    }

    /// Switches from the stack allocator to dedicated size-class regions.
    pub fn size_classes(mut self, classes: Vec<u32>) -> Self {
        self.size_classes = classes;
        self
    }

    /// Aligned read-back granularity for stack-allocated entries. Must be a
    /// multiple of the device block size; 0 selects one block.
    pub fn read_buffer_size(mut self, size: u64) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Target number of pre-reclaimed regions the background GC maintains.
    /// 0 is allowed: every region demand then reclaims synchronously.
    pub fn clean_regions_pool(mut self, target: usize) -> Self {
        self.clean_regions_pool = target;
        self
    }

    /// In-DRAM region buffers, counting the open regions. 0 selects one
    /// more than the allocator keeps open.
    pub fn num_in_mem_buffers(mut self, buffers: usize) -> Self {
        self.num_in_mem_buffers = buffers;
        self
    }

    pub fn reinsertion(mut self, policy: ReinsertionConfig) -> Self {
        self.reinsertion = policy;
        self
    }

    fn build_engine(
        self,
        device: &Arc<dyn Device>,
        scheduler: &Arc<JobScheduler>,
        destructor: Option<DestructorCallback>,
        shutdown: &Arc<std::sync::atomic::AtomicBool>,
        quarantine_watermark: usize,
    ) -> Result<Arc<BlockCache>> {
        let block = device.io_alignment();
        if self.base_offset % block != 0 {
            return Err(Error::invalid_argument(format!(
                "block cache base offset {} is not block-aligned",
                self.base_offset
            )));
        }
        if self.region_size % block != 0 {
            return Err(Error::invalid_argument(format!(
                "region size {} is not a multiple of block size {block}",
                self.region_size
            )));
        }
        if self.read_buffer_size != 0 && self.read_buffer_size % block != 0 {
            return Err(Error::invalid_argument(
                "read buffer size must be a multiple of block size",
            ));
        }

        let mode = if self.size_classes.is_empty() {
            AllocMode::Stack
        } else {
            AllocMode::SizeClasses(self.size_classes)
        };
        let alloc = RegionAllocator::new(mode, self.region_size)?;
        let mgr = RegionManager::new(
            self.base_offset,
            self.size,
            self.region_size,
            self.eviction,
            self.clean_regions_pool,
            quarantine_watermark,
        )?;

        let num_in_mem_buffers = if self.num_in_mem_buffers == 0 {
            alloc.open_region_demand() + 1
        } else {
            self.num_in_mem_buffers
        };
        let read_buffer_size = if self.read_buffer_size == 0 {
            block as usize
        } else {
            self.read_buffer_size as usize
        };

        BlockCache::new(
            BlockCacheParams {
                mgr,
                alloc,
                checksums: self.checksums,
                read_buffer_size,
                num_in_mem_buffers,
                reinsertion: self.reinsertion,
            },
            Arc::clone(device),
            Arc::clone(scheduler),
            destructor,
            Arc::clone(shutdown),
        )
    }
}

/// Big Hash engine layout.
pub struct BigHashConfig {
    base_offset: u64,
    size: u64,
    bucket_size: u64,
    bloom: Option<BloomConfig>,
}

impl BigHashConfig {
    pub fn new(base_offset: u64, size: u64, bucket_size: u64) -> Self {
        Self {
            base_offset,
            size,
            bucket_size,
            bloom: None,
        }
    }

    /// Enables the per-bucket bloom filter.
    pub fn bloom_filter(mut self, num_hashes: u32, bits_per_bucket: u32) -> Self {
        self.bloom = Some(BloomConfig {
            num_hashes,
            bits_per_bucket,
        });
        self
    }
}

/// Top-level cache configuration.
pub struct CacheConfig {
    device: Arc<dyn Device>,
    metadata_size: u64,
    scheduler: SchedulerConfig,
    block_cache: Option<BlockCacheConfig>,
    big_hash: Option<BigHashConfig>,
    small_item_max_size: u64,
    admission: AdmissionConfig,
    max_concurrent_inserts: usize,
    max_parcel_memory: u64,
    destructor: Option<DestructorCallback>,
    quarantine_watermark: usize,
}

impl CacheConfig {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            metadata_size: 0,
            scheduler: SchedulerConfig::default(),
            block_cache: None,
            big_hash: None,
            small_item_max_size: 0,
            admission: AdmissionConfig::None,
            max_concurrent_inserts: DEFAULT_MAX_CONCURRENT_INSERTS,
            max_parcel_memory: DEFAULT_MAX_PARCEL_MEMORY,
            destructor: None,
            quarantine_watermark: DEFAULT_QUARANTINE_WATERMARK,
        }
    }

    /// Reserves the first `size` bytes of the device for persisted
    /// metadata. 0 disables `persist`.
    pub fn metadata_size(mut self, size: u64) -> Self {
        self.metadata_size = size;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn block_cache(mut self, config: BlockCacheConfig) -> Self {
        self.block_cache = Some(config);
        self
    }

    /// Configures the small-object engine; values up to
    /// `small_item_max_size` bytes route to it.
    pub fn big_hash(mut self, config: BigHashConfig, small_item_max_size: u64) -> Self {
        self.big_hash = Some(config);
        self.small_item_max_size = small_item_max_size;
        self
    }

    pub fn admission_policy(mut self, policy: AdmissionConfig) -> Self {
        self.admission = policy;
        self
    }

    pub fn max_concurrent_inserts(mut self, limit: usize) -> Self {
        self.max_concurrent_inserts = limit;
        self
    }

    pub fn max_parcel_memory(mut self, bytes: u64) -> Self {
        self.max_parcel_memory = bytes;
        self
    }

    pub fn destructor_callback(mut self, callback: DestructorCallback) -> Self {
        self.destructor = Some(callback);
        self
    }

    /// Failed reclaims tolerated before the engine refuses further work.
    pub fn quarantine_watermark(mut self, watermark: usize) -> Self {
        self.quarantine_watermark = watermark;
        self
    }

    /// Validates the full configuration and starts the cache. The instance
    /// is cold; call [`Cache::recover`] to load persisted state.
    pub fn build(self) -> Result<Cache> {
        let device = self.device;
        let block = device.io_alignment();
        let device_size = device.size();

        if self.block_cache.is_none() && self.big_hash.is_none() {
            return Err(Error::invalid_argument(
                "configure at least one engine (block cache or big hash)",
            ));
        }
        if self.metadata_size % block != 0 {
            return Err(Error::invalid_argument(
                "metadata size must be a multiple of block size",
            ));
        }
        if self.max_concurrent_inserts == 0 {
            return Err(Error::invalid_argument(
                "max concurrent inserts must be nonzero",
            ));
        }
        if self.max_parcel_memory == 0 {
            return Err(Error::invalid_argument("max parcel memory must be nonzero"));
        }

        let bc_range = self
            .block_cache
            .as_ref()
            .map(|c| (c.base_offset, c.size, c.region_size));
        let bh_range = self
            .big_hash
            .as_ref()
            .map(|c| (c.base_offset, c.size, c.bucket_size));

        for (name, range) in [("block cache", bc_range), ("big hash", bh_range)] {
            if let Some((base, size, _)) = range {
                if base < self.metadata_size {
                    return Err(Error::invalid_argument(format!(
                        "{name} range overlaps the metadata prefix"
                    )));
                }
                let end = base
                    .checked_add(size)
                    .ok_or_else(|| Error::invalid_argument("engine range overflows"))?;
                if end > device_size {
                    return Err(Error::invalid_argument(format!(
                        "{name} range [{base}, {end}) exceeds device capacity {device_size}"
                    )));
                }
            }
        }
        if let (Some((bc_base, bc_size, _)), Some((bh_base, bh_size, _))) = (bc_range, bh_range)
        {
            if bc_base < bh_base + bh_size && bh_base < bc_base + bc_size {
                return Err(Error::invalid_argument(
                    "block cache and big hash ranges overlap",
                ));
            }
        }
        if let Some(big_hash) = &self.big_hash {
            if big_hash.base_offset % block != 0 {
                return Err(Error::invalid_argument(
                    "big hash base offset is not block-aligned",
                ));
            }
            let payload = BigHash::max_payload(big_hash.bucket_size) as u64;
            if self.small_item_max_size == 0
                || self.small_item_max_size + MAX_KEY_SIZE as u64 > payload
            {
                return Err(Error::invalid_argument(format!(
                    "small item max size {} does not fit bucket payload capacity {payload} \
                     with a maximum-length key",
                    self.small_item_max_size
                )));
            }
        }

        let admission = AdmissionPolicy::new(self.admission)?;
        let scheduler = Arc::new(JobScheduler::new(self.scheduler)?);
        let shutdown = scheduler.shutdown_flag();

        let block_cache = self
            .block_cache
            .map(|config| {
                config.build_engine(
                    &device,
                    &scheduler,
                    self.destructor.clone(),
                    &shutdown,
                    self.quarantine_watermark,
                )
            })
            .transpose()?;
        let big_hash = self
            .big_hash
            .map(|config| {
                BigHash::new(
                    BigHashParams {
                        base_offset: config.base_offset,
                        size: config.size,
                        bucket_size: config.bucket_size,
                        bloom: config.bloom,
                    },
                    Arc::clone(&device),
                    self.destructor.clone(),
                )
            })
            .transpose()?;

        let fingerprint = Fingerprint {
            device_size: U64::new(device_size),
            block_size: U64::new(block),
            region_size: U64::new(bc_range.map_or(0, |(_, _, r)| r)),
            bucket_size: U64::new(bh_range.map_or(0, |(_, _, b)| b)),
            engine_set: U32::new(
                block_cache.is_some() as u32 * ENGINE_BLOCK_CACHE
                    + big_hash.is_some() as u32 * ENGINE_BIG_HASH,
            ),
            _pad: U32::new(0),
            bc_base: U64::new(bc_range.map_or(0, |(b, _, _)| b)),
            bc_size: U64::new(bc_range.map_or(0, |(_, s, _)| s)),
            bh_base: U64::new(bh_range.map_or(0, |(b, _, _)| b)),
            bh_size: U64::new(bh_range.map_or(0, |(_, s, _)| s)),
        };

        Ok(Cache::assemble(
            device,
            scheduler,
            block_cache,
            big_hash,
            self.small_item_max_size,
            admission,
            self.max_concurrent_inserts,
            self.max_parcel_memory,
            self.destructor,
            self.metadata_size,
            fingerprint,
            shutdown,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn device() -> Arc<dyn Device> {
        Arc::new(MemoryDevice::new(64 << 20))
    }

    #[test]
    fn minimal_block_cache_builds() {
        let cache = CacheConfig::new(device())
            .block_cache(BlockCacheConfig::new(0, 64 << 20, 1 << 20))
            .build()
            .unwrap();
        cache.shutdown();
    }

    #[test]
    fn no_engine_is_invalid() {
        assert!(matches!(
            CacheConfig::new(device()).build(),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn overlapping_ranges_are_invalid() {
        let result = CacheConfig::new(device())
            .block_cache(BlockCacheConfig::new(0, 32 << 20, 1 << 20))
            .big_hash(BigHashConfig::new(16 << 20, 16 << 20, 4096), 1024)
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn engine_past_device_end_is_invalid() {
        let result = CacheConfig::new(device())
            .block_cache(BlockCacheConfig::new(32 << 20, 64 << 20, 1 << 20))
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn engine_under_metadata_is_invalid() {
        let result = CacheConfig::new(device())
            .metadata_size(1 << 20)
            .block_cache(BlockCacheConfig::new(0, 32 << 20, 1 << 20))
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn oversized_small_item_limit_is_invalid() {
        let result = CacheConfig::new(device())
            .big_hash(BigHashConfig::new(0, 16 << 20, 4096), 4096)
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn misaligned_region_size_is_invalid() {
        let result = CacheConfig::new(device())
            .block_cache(BlockCacheConfig::new(0, 32 << 20, 100_000))
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn zero_caps_are_invalid() {
        let result = CacheConfig::new(device())
            .block_cache(BlockCacheConfig::new(0, 32 << 20, 1 << 20))
            .max_concurrent_inserts(0)
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn big_hash_only_builds() {
        let cache = CacheConfig::new(device())
            .big_hash(
                BigHashConfig::new(0, 16 << 20, 4096).bloom_filter(4, 2048),
                2048,
            )
            .build()
            .unwrap();
        cache.shutdown();
    }
}
