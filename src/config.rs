//! # Engine Configuration Constants
//!
//! This module centralizes the numeric constants of the engine. Constants
//! that depend on each other are co-located and their relationships enforced
//! with compile-time assertions, so a change to one cannot silently drift
//! away from its dependents.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> every device offset and length is a multiple of it
//!       │
//!       └─> REGION_HEADER_SIZE / BUCKET_TRAILER_SIZE must fit inside one
//!           block so the smallest legal region / bucket stays usable
//!
//! INDEX_SHARD_COUNT (64)
//!       │
//!       └─> shard = key_hash % 64; must be a power of two so the modulo
//!           compiles to a mask
//!
//! ENTRY_ALIGN (8 bytes)
//!       │
//!       └─> every in-region entry offset and every in-bucket entry offset
//!           is rounded up to it; headers are sized as multiples of it
//! ```

// ============================================================================
// DEVICE GEOMETRY
// ============================================================================

/// Default device block size. All I/O offsets, lengths, and buffer
/// alignments are multiples of the configured block size; this is only the
/// default used when a config does not override it.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Default cap on a single physical write. Larger writes are chunked and
/// issued sequentially with no atomicity across chunks.
pub const DEFAULT_MAX_DEVICE_WRITE_SIZE: u64 = 1024 * 1024;

// ============================================================================
// ON-DEVICE LAYOUT
// ============================================================================

/// Reserved prefix of every block-cache region. Holds the region seal
/// header; entries start at this offset.
pub const REGION_HEADER_SIZE: u32 = 64;

/// Alignment of entry starts inside regions and buckets. Keeps zerocopy
/// header reads cheap and slot math simple.
pub const ENTRY_ALIGN: u32 = 8;

/// Bytes of every Big Hash bucket reserved for the trailer (checksum,
/// generation, entry count).
pub const BUCKET_TRAILER_SIZE: u64 = 24;

/// Persisted metadata format version. Bumped on any layout change; recovery
/// cold-starts on mismatch.
pub const METADATA_VERSION: u32 = 1;

// ============================================================================
// CONCURRENCY
// ============================================================================

/// Shards of the block-cache index. Power of two so `hash % shards` is a
/// mask. 64 matches the scale at which shard-lock contention stops being
/// measurable for point operations.
pub const INDEX_SHARD_COUNT: usize = 64;

/// Lock stripes protecting Big Hash buckets and their bloom filters.
pub const BUCKET_LOCK_STRIPES: usize = 1024;

/// Shards of the driver's pending-write map.
pub const PENDING_SHARD_COUNT: usize = 64;

/// Default worker threads per scheduler lane.
pub const DEFAULT_READ_WORKERS: usize = 4;
pub const DEFAULT_WRITE_WORKERS: usize = 4;
pub const DEFAULT_RECLAIM_WORKERS: usize = 1;

// ============================================================================
// DRIVER LIMITS
// ============================================================================

/// Default cap on concurrently in-flight inserts.
pub const DEFAULT_MAX_CONCURRENT_INSERTS: usize = 1024;

/// Default cap on total bytes of parcels (key + value held in memory
/// between caller return and physical write).
pub const DEFAULT_MAX_PARCEL_MEMORY: u64 = 256 * 1024 * 1024;

/// Longest key accepted by the driver.
pub const MAX_KEY_SIZE: usize = 255;

// ============================================================================
// REGION MANAGEMENT
// ============================================================================

/// Default target size of the pre-cleaned region pool.
pub const DEFAULT_CLEAN_REGIONS_POOL: usize = 1;

/// Reclaim failures a region manager tolerates (regions parked in
/// quarantine) before the engine refuses further work.
pub const DEFAULT_QUARANTINE_WATERMARK: usize = 8;

/// How long a writer waits for a clean region before re-driving reclaim.
pub const CLEAN_POOL_WAIT: std::time::Duration = std::time::Duration::from_millis(50);

/// Bound on the shutdown drain of pending writes.
pub const DEFAULT_SHUTDOWN_DRAIN_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(10);

const _: () = assert!(
    INDEX_SHARD_COUNT.is_power_of_two(),
    "INDEX_SHARD_COUNT must be a power of two: the shard selector is a mask"
);

const _: () = assert!(
    REGION_HEADER_SIZE as u64 % ENTRY_ALIGN as u64 == 0,
    "region entries start at REGION_HEADER_SIZE and must stay ENTRY_ALIGN-aligned"
);

const _: () = assert!(
    (REGION_HEADER_SIZE as u64) < DEFAULT_BLOCK_SIZE,
    "the region header must fit inside the first block"
);

const _: () = assert!(
    BUCKET_TRAILER_SIZE % ENTRY_ALIGN as u64 == 0,
    "bucket trailer must preserve entry alignment from the end of the bucket"
);
