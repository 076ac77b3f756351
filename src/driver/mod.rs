//! # Driver
//!
//! The external face of the engine. Routes operations to the two engines by
//! value size, enforces the bounded-memory insert pipeline, owns the job
//! scheduler, and runs persistence.
//!
//! ## Insert pipeline
//!
//! `insert` is asynchronous: after the admission gate and the parcel-memory
//! and concurrent-insert caps, the key/value parcel is recorded in a
//! pending map and a write job is queued under the key's hash. Physical
//! persistence is eventual; visibility is immediate, because lookups
//! consult the pending map before the engines. Every mutation of one key
//! flows through the write lane under the same hash, so per-key program
//! order holds without any global lock.
//!
//! ## Failure modes
//!
//! `Rejected` (admission said no) and `QueueFull` (a cap is exhausted) are
//! fail-fast and leave no trace. After shutdown every operation reports
//! `ShuttingDown`.
//!
//! ## Destructors
//!
//! The destructor callback fires exactly once per admitted insert: with
//! `Removed` when an explicit remove or a same-key overwrite displaces it,
//! with `Recycled` when region reclaim or bucket overflow evicts it. No
//! ordering is guaranteed, not even per key. Callbacks must be fast and
//! must not call back into the cache.

mod config;

pub use config::{BigHashConfig, BlockCacheConfig, CacheConfig};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::admission::AdmissionPolicy;
use crate::big_hash::BigHash;
use crate::block_cache::BlockCache;
use crate::config::{DEFAULT_SHUTDOWN_DRAIN_TIMEOUT, MAX_KEY_SIZE, PENDING_SHARD_COUNT};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::hash::hash_key;
use crate::metadata::{self, Fingerprint, MetadataState};
use crate::scheduler::{Completion, JobLane, JobScheduler};

/// Why an item's destructor fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructorEvent {
    /// Explicit `remove`, or displaced by a newer insert of the same key.
    Removed,
    /// Lost to region reclaim or bucket overflow.
    Recycled,
}

/// Invoked exactly once per admitted insert. Must be non-blocking and must
/// not re-enter the cache.
pub type DestructorCallback = Arc<dyn Fn(&[u8], &[u8], DestructorEvent) + Send + Sync>;

struct PendingInsert {
    seq: u64,
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Parcels between caller return and engine insert, sharded by key hash.
/// Entries are added by the caller and removed by the write job, so the
/// lifetime of an entry is exactly the parcel's time in the queue.
struct PendingWrites {
    shards: Vec<Mutex<HashMap<u64, Vec<PendingInsert>>>>,
    next_seq: AtomicU64,
}

impl PendingWrites {
    fn new() -> Self {
        Self {
            shards: (0..PENDING_SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            next_seq: AtomicU64::new(1),
        }
    }

    fn shard(&self, hash: u64) -> &Mutex<HashMap<u64, Vec<PendingInsert>>> {
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    fn add(&self, hash: u64, key: Vec<u8>, value: Vec<u8>) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shard(hash)
            .lock()
            .entry(hash)
            .or_default()
            .push(PendingInsert { seq, key, value });
        seq
    }

    fn complete(&self, hash: u64, seq: u64) {
        let mut shard = self.shard(hash).lock();
        if let Some(list) = shard.get_mut(&hash) {
            list.retain(|p| p.seq != seq);
            if list.is_empty() {
                shard.remove(&hash);
            }
        }
    }

    /// Newest pending value for the exact key, for read-your-writes.
    fn latest_value(&self, hash: u64, key: &[u8]) -> Option<Vec<u8>> {
        let shard = self.shard(hash).lock();
        shard
            .get(&hash)?
            .iter()
            .rev()
            .find(|p| p.key == key)
            .map(|p| p.value.clone())
    }

    fn get_by_seq(&self, hash: u64, seq: u64) -> Option<(Vec<u8>, Vec<u8>)> {
        let shard = self.shard(hash).lock();
        shard
            .get(&hash)?
            .iter()
            .find(|p| p.seq == seq)
            .map(|p| (p.key.clone(), p.value.clone()))
    }

    fn contains(&self, hash: u64, key: &[u8]) -> bool {
        let shard = self.shard(hash).lock();
        shard
            .get(&hash)
            .is_some_and(|list| list.iter().any(|p| p.key == key))
    }
}

struct Shared {
    device: Arc<dyn Device>,
    scheduler: Arc<JobScheduler>,
    block_cache: Option<Arc<BlockCache>>,
    big_hash: Option<Arc<BigHash>>,
    small_item_max_size: u64,
    admission: AdmissionPolicy,
    parcel_bytes: AtomicU64,
    max_parcel_memory: u64,
    inflight_inserts: AtomicUsize,
    max_concurrent_inserts: usize,
    pending: PendingWrites,
    destructor: Option<DestructorCallback>,
    metadata_size: u64,
    fingerprint: Fingerprint,
    shutdown: Arc<AtomicBool>,
}

enum Route {
    BigHash,
    BlockCache,
}

impl Shared {
    fn route(&self, value_len: u64) -> Result<Route> {
        if self.big_hash.is_some() && value_len <= self.small_item_max_size {
            return Ok(Route::BigHash);
        }
        if self.block_cache.is_some() {
            return Ok(Route::BlockCache);
        }
        // Big-hash-only configuration with an item too large for a bucket.
        Err(Error::Rejected)
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn release_insert(&self, parcel: u64) {
        self.parcel_bytes.fetch_sub(parcel, Ordering::AcqRel);
        self.inflight_inserts.fetch_sub(1, Ordering::AcqRel);
    }

    fn engine_insert(&self, route: &Route, key: &[u8], value: &[u8]) -> Result<()> {
        match route {
            Route::BigHash => self
                .big_hash
                .as_ref()
                .expect("route checked engine presence")
                .insert(key, value),
            Route::BlockCache => self
                .block_cache
                .as_ref()
                .expect("route checked engine presence")
                .insert(key, value),
        }
    }

    /// Deletes the key from the engine the insert did NOT route to. An
    /// overwrite whose value size crosses `small_item_max_size` changes
    /// engines; without this, the previous copy would survive in the other
    /// engine and shadow the new value (lookups try the block cache first).
    /// The displaced copy fires its `Removed` destructor here, the same as
    /// any other same-key overwrite. No-op with a single engine.
    fn evict_other_engine(&self, route: &Route, key: &[u8]) {
        let evicted = match route {
            Route::BigHash => self.block_cache.as_ref().map(|engine| engine.remove(key)),
            Route::BlockCache => self.big_hash.as_ref().map(|engine| engine.remove(key)),
        };
        if let Some(Err(err)) = evicted {
            if !err.is_not_found() {
                warn!(error = %err, "failed to evict stale copy from the other engine");
            }
        }
    }

    fn engine_lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(block_cache) = &self.block_cache {
            match block_cache.lookup(key) {
                Err(Error::NotFound) => {}
                other => return other,
            }
        }
        if let Some(big_hash) = &self.big_hash {
            return big_hash.lookup(key);
        }
        Err(Error::NotFound)
    }

    fn engine_remove(&self, key: &[u8]) -> Result<()> {
        let mut found = false;
        if let Some(block_cache) = &self.block_cache {
            match block_cache.remove(key) {
                Ok(()) => found = true,
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        if let Some(big_hash) = &self.big_hash {
            match big_hash.remove(key) {
                Ok(()) => found = true,
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }
}

/// Handle to a running cache. Clones share the instance; the last drop
/// shuts the scheduler down.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<Shared>,
}

impl Cache {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        device: Arc<dyn Device>,
        scheduler: Arc<JobScheduler>,
        block_cache: Option<Arc<BlockCache>>,
        big_hash: Option<Arc<BigHash>>,
        small_item_max_size: u64,
        admission: AdmissionPolicy,
        max_concurrent_inserts: usize,
        max_parcel_memory: u64,
        destructor: Option<DestructorCallback>,
        metadata_size: u64,
        fingerprint: Fingerprint,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                device,
                scheduler,
                block_cache,
                big_hash,
                small_item_max_size,
                admission,
                parcel_bytes: AtomicU64::new(0),
                max_parcel_memory,
                inflight_inserts: AtomicUsize::new(0),
                max_concurrent_inserts,
                pending: PendingWrites::new(),
                destructor,
                metadata_size,
                fingerprint,
                shutdown,
            }),
        }
    }

    /// Admits and enqueues an insert. Returns once the parcel is queued;
    /// persistence is eventual, but a subsequent `lookup` of this key
    /// already observes the new value.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let shared = &self.shared;
        shared.check_running()?;
        validate_key(key)?;
        let route = shared.route(value.len() as u64)?;

        let parcel = (key.len() + value.len()) as u64;
        if !shared.admission.accept(key, parcel) {
            return Err(Error::Rejected);
        }

        if shared.inflight_inserts.fetch_add(1, Ordering::AcqRel)
            >= shared.max_concurrent_inserts
        {
            shared.inflight_inserts.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::QueueFull);
        }
        if shared.parcel_bytes.fetch_add(parcel, Ordering::AcqRel) + parcel
            > shared.max_parcel_memory
        {
            shared.release_insert(parcel);
            return Err(Error::QueueFull);
        }

        let hash = hash_key(key);
        let seq = shared.pending.add(hash, key.to_vec(), value.to_vec());

        let job_shared = Arc::clone(shared);
        let job = Box::new(move || {
            if let Some((key, value)) = job_shared.pending.get_by_seq(hash, seq) {
                match job_shared.engine_insert(&route, &key, &value) {
                    Ok(()) => {
                        // An overwrite may have changed engines; drop any
                        // copy the other engine still holds so exactly one
                        // engine serves this key.
                        job_shared.evict_other_engine(&route, &key);
                    }
                    Err(err) => {
                        // The insert was admitted but never became visible;
                        // close its lifecycle so destructor accounting stays
                        // exact.
                        warn!(error = %err, "queued insert failed");
                        if let Some(callback) = &job_shared.destructor {
                            callback(&key, &value, DestructorEvent::Recycled);
                        }
                    }
                }
                job_shared.pending.complete(hash, seq);
            }
            job_shared.release_insert(parcel);
        });

        if let Err(err) = shared.scheduler.enqueue(JobLane::Write, hash, job) {
            shared.pending.complete(hash, seq);
            shared.release_insert(parcel);
            return Err(err);
        }
        Ok(())
    }

    /// Synchronous lookup; blocks the caller until the read completes.
    pub fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        let shared = &self.shared;
        shared.check_running()?;
        validate_key(key)?;
        let hash = hash_key(key);

        if let Some(value) = shared.pending.latest_value(hash, key) {
            return Ok(value);
        }

        let completion = Completion::new();
        {
            let completion = Arc::clone(&completion);
            let shared = Arc::clone(shared);
            let key = key.to_vec();
            self.shared.scheduler.enqueue(
                JobLane::Read,
                hash,
                Box::new(move || completion.complete(shared.engine_lookup(&key))),
            )?;
        }
        completion.wait()
    }

    /// Asynchronous lookup; `callback` runs on a read worker (or inline for
    /// a pending-write hit).
    pub fn lookup_async(
        &self,
        key: &[u8],
        callback: impl FnOnce(Result<Vec<u8>>) + Send + 'static,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.check_running()?;
        validate_key(key)?;
        let hash = hash_key(key);

        if let Some(value) = shared.pending.latest_value(hash, key) {
            callback(Ok(value));
            return Ok(());
        }

        let shared = Arc::clone(shared);
        let key = key.to_vec();
        self.shared.scheduler.enqueue(
            JobLane::Read,
            hash,
            Box::new(move || callback(shared.engine_lookup(&key))),
        )
    }

    /// Removes a key from both engines. `Ok` means something was removed and
    /// its destructor fired with `Removed`; `NotFound` means nothing was
    /// there. A second remove of the same key reports `NotFound`.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let shared = &self.shared;
        shared.check_running()?;
        validate_key(key)?;
        let hash = hash_key(key);

        let completion = Completion::new();
        {
            let completion = Arc::clone(&completion);
            let shared = Arc::clone(shared);
            let key = key.to_vec();
            self.shared.scheduler.enqueue(
                JobLane::Write,
                hash,
                Box::new(move || completion.complete(shared.engine_remove(&key))),
            )?;
        }
        completion.wait()
    }

    /// Index-and-filter membership check; never touches the device. False
    /// positives are possible, false negatives are not.
    pub fn could_exist(&self, key: &[u8]) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        let shared = &self.shared;
        let hash = hash_key(key);
        if shared.pending.contains(hash, key) {
            return true;
        }
        if let Some(block_cache) = &shared.block_cache {
            if block_cache.could_exist(key) {
                return true;
            }
        }
        if let Some(big_hash) = &shared.big_hash {
            if big_hash.could_exist(key) {
                return true;
            }
        }
        false
    }

    /// Drains in-flight writes and pushes buffered regions to the device.
    pub fn flush(&self) -> Result<()> {
        self.shared.scheduler.drain();
        if let Some(block_cache) = &self.shared.block_cache {
            block_cache.flush()?;
        }
        self.shared.device.flush()
    }

    /// Flushes, then serializes all engine metadata into the reserved
    /// device prefix. A later `recover` under the same configuration makes
    /// every currently-readable key readable again.
    pub fn persist(&self) -> Result<()> {
        if self.shared.metadata_size == 0 {
            return Err(Error::invalid_argument(
                "no metadata space reserved, persist unavailable",
            ));
        }
        self.flush()?;

        let mut state = MetadataState::default();
        if let Some(block_cache) = &self.shared.block_cache {
            let (regions, index) = block_cache.snapshot();
            state.regions = regions;
            state.index = index;
        }
        if let Some(big_hash) = &self.shared.big_hash {
            let (epoch, bloom_words) = big_hash.snapshot();
            state.bh_epoch = epoch;
            state.bloom_words = bloom_words;
        }
        metadata::persist(
            self.shared.device.as_ref(),
            self.shared.metadata_size,
            &self.shared.fingerprint,
            &state,
        )
    }

    /// Loads persisted metadata. Returns `true` on a warm start; any
    /// validation failure (or absent metadata) cold-starts with empty
    /// indexes and returns `false`. Call before serving traffic.
    pub fn recover(&self) -> Result<bool> {
        if self.shared.metadata_size == 0 {
            self.cold_start();
            return Ok(false);
        }
        let Some(state) = metadata::recover(
            self.shared.device.as_ref(),
            self.shared.metadata_size,
            &self.shared.fingerprint,
        ) else {
            self.cold_start();
            return Ok(false);
        };

        let restored = self.try_restore(state);
        if let Err(err) = restored {
            warn!(error = %err, "metadata restore failed, cold start");
            self.cold_start();
            return Ok(false);
        }
        debug!("warm start");
        Ok(true)
    }

    fn try_restore(&self, state: MetadataState) -> Result<()> {
        if let Some(block_cache) = &self.shared.block_cache {
            block_cache.restore(&state.regions, state.index)?;
        }
        if let Some(big_hash) = &self.shared.big_hash {
            big_hash.restore(state.bh_epoch, state.bloom_words.as_deref())?;
        }
        Ok(())
    }

    fn cold_start(&self) {
        if let Some(block_cache) = &self.shared.block_cache {
            block_cache.reset();
        }
        if let Some(big_hash) = &self.shared.big_hash {
            big_hash.reset();
        }
        debug!("cold start");
    }

    /// Stops accepting work, drains pending writes (bounded), and joins the
    /// workers. Idempotent; also runs on drop of the last handle.
    pub fn shutdown(&self) {
        self.shared
            .scheduler
            .shutdown(DEFAULT_SHUTDOWN_DRAIN_TIMEOUT);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.scheduler.shutdown(DEFAULT_SHUTDOWN_DRAIN_TIMEOUT);
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::invalid_argument(format!(
            "key length {} outside 1..={MAX_KEY_SIZE}",
            key.len()
        )));
    }
    Ok(())
}
