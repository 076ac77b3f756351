//! # navycache - Flash-Tier Cache Engine
//!
//! A log-structured cache over a raw block device, built to sit behind a
//! DRAM cache and absorb its evictions. Two engines share the device, with
//! a driver routing by value size:
//!
//! - **Block Cache**: medium objects (roughly 1 KiB-512 KiB) in fixed-size
//!   regions written log-style, reclaimed whole by an eviction policy
//!   (LRU, FIFO, or segmented FIFO) with optional item reinsertion.
//! - **Big Hash**: small objects (under ~2 KiB) in set-associative
//!   on-device buckets with per-bucket bloom filters.
//!
//! ## Quick Start
//!
//! ```ignore
//! use navycache::{BlockCacheConfig, BigHashConfig, CacheConfig, FileDevice, FileDeviceConfig};
//! use std::sync::Arc;
//!
//! let device = Arc::new(FileDevice::open(FileDeviceConfig::new(
//!     vec!["/dev/nvme1n1p2".into()],
//!     256 << 30,
//! ))?);
//! let cache = CacheConfig::new(device)
//!     .metadata_size(16 << 20)
//!     .block_cache(BlockCacheConfig::new(16 << 20, 224 << 30, 16 << 20))
//!     .big_hash(BigHashConfig::new(224 << 30, 32 << 30, 4096).bloom_filter(4, 2048), 2048)
//!     .build()?;
//! cache.recover()?;
//!
//! cache.insert(b"user:42", b"profile bytes")?;
//! let value = cache.lookup(b"user:42")?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Driver: admission, parcel caps, size routing  │
//! ├─────────────────────┬─────────────────────────┤
//! │ Block Cache         │ Big Hash                │
//! │  sharded index      │  bucket codec + blooms  │
//! │  region manager     │  striped locks          │
//! │  eviction/reinsert  │                         │
//! ├─────────────────────┴─────────────────────────┤
//! │ Job scheduler: read / write / reclaim lanes   │
//! ├───────────────────────────────────────────────┤
//! │ Device: aligned direct I/O, RAID0, encryption │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Inserts return once admitted and queued; visibility is immediate
//! (read-your-writes per key), persistence is eventual. `persist` writes a
//! checksummed snapshot of all engine metadata into the device's reserved
//! prefix, and `recover` either loads it or cold-starts: a cache can
//! always refill.
//!
//! ## Module Overview
//!
//! - [`device`]: block device abstraction, file/RAID0/memory devices
//! - `scheduler`: keyed three-lane worker pool
//! - `region`: region lifecycle, eviction policies, allocator
//! - `block_cache`: medium-object engine
//! - `big_hash`: small-object engine
//! - `admission`: insert gating policies
//! - `driver`: external API, configuration, persistence glue

#[macro_use]
mod macros;

pub mod admission;
pub mod big_hash;
pub mod block_cache;
mod config;
pub mod device;
mod driver;
mod error;
pub mod hash;
mod metadata;
pub mod region;
mod scheduler;

pub use admission::{AdmissionConfig, DynamicRandomConfig};
pub use big_hash::BloomConfig;
pub use block_cache::ReinsertionConfig;
pub use device::{AlignedBuf, Device, DeviceEncryptor, FileDevice, FileDeviceConfig, MemoryDevice};
pub use driver::{
    BigHashConfig, BlockCacheConfig, Cache, CacheConfig, DestructorCallback, DestructorEvent,
};
pub use error::{DeviceErrorKind, Error, Result};
pub use region::EvictionPolicyConfig;
pub use scheduler::SchedulerConfig;
