//! # Block Cache Engine
//!
//! The medium-object engine: a log-structured cache over fixed-size regions
//! of the device, with an in-memory index from key hash to on-device
//! location.
//!
//! ## Write path
//!
//! An insert allocates a slot in the open region (bump pointer or size
//! class), serializes `header + key + value` into the region's DRAM buffer,
//! and publishes the location in the index, at which point the insert is
//! visible to lookups. When a region fills it is sealed: the eviction
//! policy starts tracking it, a whole-region write is queued on the reclaim
//! lane, and the buffer keeps serving reads until that flush lands.
//!
//! ## Read path
//!
//! Index hit → generation check against the region (stale pointers from
//! recycled regions die here, lock-free) → read from the buffer if the
//! region is still in DRAM, else an aligned device read sized by the read
//! buffer hint → key comparison and optional checksum. Any mismatch
//! invalidates the index entry lazily and reports `NotFound`. A valid hit
//! bumps the item's hit counter and promotes the region in the eviction
//! order.
//!
//! ## Reclaim
//!
//! When the clean-region pool runs dry (or drops below target, via
//! background jobs), the eviction policy picks a sealed victim. The walk
//! re-parses every entry in the region and, for each one still live in the
//! index, asks the reinsertion policy: copy forward through the normal
//! write path, or drop with a `Recycled` destructor event. Copy-forward
//! publication is a compare-and-swap on the index entry, so a racing insert
//! or remove of the same key always wins. When the walk finishes the
//! region's generation is bumped and it returns to the clean pool.
//!
//! Reclaim never waits on allocation resources: if copy-forward cannot get
//! space without blocking, the item is dropped instead. That keeps the
//! reclaim lane free of cycles with the flush jobs that run on it.

pub(crate) mod entry;
pub(crate) mod index;
pub mod reinsertion;

pub use reinsertion::ReinsertionConfig;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::config::{CLEAN_POOL_WAIT, REGION_HEADER_SIZE};
use crate::device::{AlignedBuf, Device};
use crate::driver::{DestructorCallback, DestructorEvent};
use crate::error::{Error, Result};
use crate::hash::hash_key;
use crate::region::allocator::{Allocation, DetachedRegion, RegionAllocator, TryAlloc};
use crate::region::buffer::BufferPool;
use crate::region::{RegionManager, RegionSnap, ReclaimRegion};
use crate::scheduler::{JobLane, JobScheduler};
use entry::{
    encode_entry, entry_len, parse_entry, parse_header, ParsedEntry, RegionHeader,
    ENTRY_HEADER_SIZE,
};
use index::{Index, IndexEntry};
use reinsertion::ReinsertionPolicy;

/// Everything the driver resolves before constructing the engine.
pub(crate) struct BlockCacheParams {
    pub mgr: RegionManager,
    pub alloc: RegionAllocator,
    pub checksums: bool,
    pub read_buffer_size: usize,
    pub num_in_mem_buffers: usize,
    pub reinsertion: ReinsertionConfig,
}

pub(crate) struct BlockCache {
    /// Back-reference for the flush and refill jobs this engine spawns.
    self_ref: Weak<BlockCache>,
    device: Arc<dyn Device>,
    scheduler: Arc<JobScheduler>,
    mgr: RegionManager,
    alloc: RegionAllocator,
    buffers: BufferPool,
    index: Index,
    reinsertion: ReinsertionPolicy,
    checksums: bool,
    read_buffer_size: usize,
    block_size: usize,
    destructor: Option<DestructorCallback>,
    shutdown: Arc<AtomicBool>,
}

impl BlockCache {
    pub(crate) fn new(
        params: BlockCacheParams,
        device: Arc<dyn Device>,
        scheduler: Arc<JobScheduler>,
        destructor: Option<DestructorCallback>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let block_size = device.io_alignment() as usize;
        let region_size = params.mgr.region_size() as usize;
        if params.num_in_mem_buffers < params.alloc.open_region_demand() {
            return Err(Error::invalid_argument(format!(
                "{} in-memory buffers cannot cover {} simultaneously open regions",
                params.num_in_mem_buffers,
                params.alloc.open_region_demand()
            )));
        }

        let reinsertion = ReinsertionPolicy::new(params.reinsertion)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            buffers: BufferPool::new(params.num_in_mem_buffers, region_size, block_size),
            index: Index::new(),
            reinsertion,
            mgr: params.mgr,
            alloc: params.alloc,
            checksums: params.checksums,
            read_buffer_size: params.read_buffer_size.max(block_size),
            block_size,
            device,
            scheduler,
            destructor,
            shutdown,
        }))
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("engine outlives its jobs")
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let hash = hash_key(key);
        let len = (ENTRY_HEADER_SIZE + key.len() + value.len()) as u32;
        let allocation = self.allocate(len, true)?;
        self.write_entry(&allocation, hash, key, value);

        let new_entry = IndexEntry {
            region: allocation.rid,
            offset: allocation.offset,
            generation: self.mgr.generation(allocation.rid),
            hits: 0,
        };
        if let Some(old) = self.index.insert(hash, new_entry) {
            // Same-key overwrite: the clobbered insert is notified as an
            // explicit removal, with its old value when it is still
            // readable.
            let old_value = self.read_at(&old, key).unwrap_or_default();
            self.notify(key, &old_value, DestructorEvent::Removed);
        }
        Ok(())
    }

    fn write_entry(&self, allocation: &Allocation, hash: u64, key: &[u8], value: &[u8]) {
        let buffer = self
            .buffers
            .get(allocation.rid)
            .expect("open region always has a buffer");
        let mut data = buffer.write();
        let start = allocation.offset as usize;
        encode_entry(
            &mut data[start..start + allocation.slot_size as usize],
            hash,
            key,
            value,
            self.checksums,
        );
    }

    /// Serves an allocation, sealing exhausted regions and acquiring fresh
    /// ones as needed. `blocking` selects between the writer path (may
    /// reclaim synchronously and wait) and the reclaim copy-forward path
    /// (fails fast so the reclaim lane never waits on itself).
    fn allocate(&self, len: u32, blocking: bool) -> Result<Allocation> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            match self.alloc.try_allocate(len)? {
                TryAlloc::Allocated(allocation) => return Ok(allocation),
                TryAlloc::Exhausted(detached) => {
                    self.seal_region(detached);
                    continue;
                }
                TryAlloc::NeedRegion => {}
            }

            let rid = match self.mgr.try_open_region() {
                Some(rid) => rid,
                None if blocking => {
                    self.reclaim_one();
                    self.mgr.wait_for_region(CLEAN_POOL_WAIT, &self.shutdown)?;
                    continue;
                }
                None => return Err(Error::QueueFull),
            };

            let created = if blocking {
                match self.buffers.create(rid, &self.shutdown) {
                    Ok(pair) => Some(pair),
                    Err(err) => {
                        self.mgr.return_region(rid);
                        return Err(err);
                    }
                }
            } else {
                self.buffers.try_create(rid)
            };
            if created.is_none() {
                self.mgr.return_region(rid);
                return Err(Error::QueueFull);
            }

            if self.alloc.install(len, rid).is_err() {
                // A racing writer opened a region for this class first.
                self.buffers.remove(rid);
                self.mgr.return_region(rid);
            }
        }
    }

    /// Open → Sealed: stamp the on-device header, enter the eviction order,
    /// queue the whole-region flush, and top up the clean pool if needed.
    fn seal_region(&self, detached: DetachedRegion) {
        let generation = self.mgr.generation(detached.rid);
        let seal_epoch = self.mgr.seal(&detached);

        if let Some(buffer) = self.buffers.get(detached.rid) {
            let header = RegionHeader::new(
                detached.rid,
                generation,
                detached.size_class,
                detached.num_items,
                detached.bytes_used,
                seal_epoch,
            );
            let mut data = buffer.write();
            data[..std::mem::size_of::<RegionHeader>()]
                .copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        }

        if let Some(token) = self.buffers.token(detached.rid) {
            let this = self.arc();
            let rid = detached.rid;
            let queued = self.scheduler.enqueue(
                JobLane::Reclaim,
                rid as u64,
                Box::new(move || this.flush_region(rid, token)),
            );
            if queued.is_err() {
                // Shutting down: flush inline so sealed data still reaches
                // the device.
                self.flush_region(rid, token);
            }
        }

        if self.mgr.below_clean_target() {
            let this = self.arc();
            let _ = self.scheduler.enqueue(
                JobLane::Reclaim,
                detached.rid as u64,
                Box::new(move || {
                    if this.mgr.below_clean_target() {
                        this.reclaim_one();
                    }
                }),
            );
        }
    }

    /// Writes a sealed region to the device and retires its buffer. Runs on
    /// the reclaim lane.
    fn flush_region(&self, rid: u32, token: u64) {
        let Some(buffer) = self.buffers.get_if_current(rid, token) else {
            return;
        };
        let result = {
            let data = buffer.read();
            self.device
                .write(self.mgr.region_offset(rid), &data)
                .and_then(|_| self.device.flush())
        };
        if let Err(err) = result {
            // The region stays sealed with unreadable device bytes; lookups
            // fail the key/checksum comparison and clean the index lazily.
            warn!(rid, error = %err, "region flush failed");
        }
        self.buffers.remove_if_current(rid, token);
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    pub(crate) fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        let hash = hash_key(key);
        let Some(entry) = self.index.get(hash) else {
            return Err(Error::NotFound);
        };
        if self.mgr.generation(entry.region) != entry.generation {
            self.index
                .remove_if_points_at(hash, entry.region, entry.generation, entry.offset);
            return Err(Error::NotFound);
        }

        match self.read_at(&entry, key) {
            Ok(value) => {
                self.index.record_hit(hash);
                self.mgr.note_hit(entry.region);
                Ok(value)
            }
            Err(Error::NotFound) => {
                self.index
                    .remove_if_points_at(hash, entry.region, entry.generation, entry.offset);
                Err(Error::NotFound)
            }
            Err(Error::BadChecksum) => {
                warn!(region = entry.region, offset = entry.offset, "checksum mismatch on read");
                self.index
                    .remove_if_points_at(hash, entry.region, entry.generation, entry.offset);
                Err(Error::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn could_exist(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        match self.index.get(hash) {
            Some(entry) => self.mgr.generation(entry.region) == entry.generation,
            None => false,
        }
    }

    /// Reads and validates the entry at an index location. `NotFound` means
    /// the bytes there no longer describe `key`.
    fn read_at(&self, entry: &IndexEntry, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(buffer) = self.buffers.get(entry.region) {
            let data = buffer.read();
            let parsed = parse_entry(&data[entry.offset as usize..])?;
            return Self::extract(&parsed, key);
        }

        let region_size = self.mgr.region_size() as usize;
        let region_offset = self.mgr.region_offset(entry.region);
        let offset = entry.offset as usize;
        if offset >= region_size {
            return Err(Error::NotFound);
        }
        let start = offset - offset % self.block_size;
        let within = offset - start;

        // First probe: the read-buffer hint, grown to at least cover the
        // header.
        let mut want = self
            .read_buffer_size
            .max(self.align_up(within + ENTRY_HEADER_SIZE))
            .min(region_size - start);
        loop {
            let mut buf = AlignedBuf::zeroed(want, self.block_size);
            self.device.read(region_offset + start as u64, &mut buf)?;
            let header = parse_header(&buf[within..])?;
            let span = within
                + ENTRY_HEADER_SIZE
                + header.key_len() as usize
                + header.value_len() as usize;
            if span <= buf.len() {
                let parsed = parse_entry(&buf[within..span])?;
                return Self::extract(&parsed, key);
            }
            let grown = self.align_up(span).min(region_size - start);
            if grown <= want {
                // The header promises more bytes than the region holds.
                return Err(Error::NotFound);
            }
            want = grown;
        }
    }

    fn extract(parsed: &ParsedEntry<'_>, key: &[u8]) -> Result<Vec<u8>> {
        if parsed.key != key {
            return Err(Error::NotFound);
        }
        parsed.verify_checksum()?;
        Ok(parsed.value.to_vec())
    }

    #[inline]
    fn align_up(&self, len: usize) -> usize {
        len.div_ceil(self.block_size) * self.block_size
    }

    // ------------------------------------------------------------------
    // Remove
    // ------------------------------------------------------------------

    pub(crate) fn remove(&self, key: &[u8]) -> Result<()> {
        let hash = hash_key(key);
        let Some(entry) = self.index.get(hash) else {
            return Err(Error::NotFound);
        };
        // Best-effort value capture for the destructor before the entry
        // disappears; the on-device bytes stay until reclaim.
        let value = self.read_at(&entry, key).unwrap_or_default();
        if self.index.remove(hash).is_none() {
            return Err(Error::NotFound);
        }
        self.notify(key, &value, DestructorEvent::Removed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reclaim
    // ------------------------------------------------------------------

    /// Reclaims one region chosen by the eviction policy. Called inline by
    /// writers that ran out of clean regions and from background refill
    /// jobs.
    pub(crate) fn reclaim_one(&self) {
        let Some(victim) = self.mgr.begin_reclaim() else {
            return;
        };
        match self.region_data(victim.rid) {
            Ok(data) => {
                self.walk_region(&victim, &data);
                // A still-unflushed buffer is dead weight now; its pending
                // flush will miss the token check.
                self.buffers.remove(victim.rid);
                self.mgr.finish_reclaim(victim.rid);
            }
            Err(err) => {
                warn!(rid = victim.rid, error = %err, "reclaim read failed");
                if self.mgr.quarantine(victim.rid) {
                    warn!("quarantine watermark exceeded, engine stops accepting work");
                    self.shutdown.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Snapshot of the victim's bytes: the DRAM buffer when the region has
    /// not been flushed yet, otherwise a whole-region device read.
    fn region_data(&self, rid: u32) -> Result<AlignedBuf> {
        if let Some(buffer) = self.buffers.get(rid) {
            return Ok(buffer.read().clone());
        }
        let mut data =
            AlignedBuf::zeroed(self.mgr.region_size() as usize, self.block_size);
        self.device.read(self.mgr.region_offset(rid), &mut data)?;
        Ok(data)
    }

    fn walk_region(&self, victim: &ReclaimRegion, data: &[u8]) {
        let generation = self.mgr.generation(victim.rid);
        let mut walked = 0u32;
        match victim.size_class {
            None => {
                let mut cursor = REGION_HEADER_SIZE as usize;
                let end = (victim.bytes_used as usize).min(data.len());
                for _ in 0..victim.num_items {
                    if cursor + ENTRY_HEADER_SIZE > end {
                        break;
                    }
                    let Ok(parsed) = parse_entry(&data[cursor..end]) else {
                        warn!(rid = victim.rid, cursor, "reclaim walk hit unparsable entry");
                        break;
                    };
                    let len = entry_len(parsed.key.len(), parsed.value.len()) as usize;
                    self.reclaim_item(victim.rid, generation, cursor as u32, &parsed);
                    walked += 1;
                    cursor += len;
                }
            }
            Some(class) => {
                let class = class as usize;
                for slot in 0..victim.num_items as usize {
                    let start = REGION_HEADER_SIZE as usize + slot * class;
                    if start + class > data.len() {
                        break;
                    }
                    if let Ok(parsed) = parse_entry(&data[start..start + class]) {
                        self.reclaim_item(victim.rid, generation, start as u32, &parsed);
                    }
                    walked += 1;
                }
            }
        }
        debug!(rid = victim.rid, walked, of = victim.num_items, "reclaim walk done");
    }

    fn reclaim_item(
        &self,
        rid: u32,
        generation: u32,
        offset: u32,
        parsed: &ParsedEntry<'_>,
    ) {
        let hash = parsed.header.key_hash();
        let Some(entry) = self.index.get(hash) else {
            // Removed or overwritten earlier; its destructor already fired.
            return;
        };
        if entry.region != rid || entry.generation != generation || entry.offset != offset {
            return;
        }

        let intact = hash_key(parsed.key) == hash && parsed.verify_checksum().is_ok();
        if intact
            && self.reinsertion.should_reinsert(entry.hits, hash)
            && self.copy_forward(parsed, rid, generation, offset)
        {
            return;
        }

        if self.index.remove_if_points_at(hash, rid, generation, offset) {
            self.notify(parsed.key, parsed.value, DestructorEvent::Recycled);
        }
    }

    /// Reinserts a reclaimed item through the normal write path. Returns
    /// false when space could not be had without blocking; the caller drops
    /// the item instead.
    fn copy_forward(
        &self,
        parsed: &ParsedEntry<'_>,
        rid: u32,
        generation: u32,
        offset: u32,
    ) -> bool {
        let hash = parsed.header.key_hash();
        let len = (ENTRY_HEADER_SIZE + parsed.key.len() + parsed.value.len()) as u32;
        let Ok(allocation) = self.allocate(len, false) else {
            return false;
        };
        self.write_entry(&allocation, hash, parsed.key, parsed.value);

        let new_entry = IndexEntry {
            region: allocation.rid,
            offset: allocation.offset,
            generation: self.mgr.generation(allocation.rid),
            hits: 0,
        };
        // A racing insert or remove that got here first wins; the freshly
        // written slot becomes dead weight until its region is reclaimed,
        // and the racer's path already did the destructor accounting.
        self.index
            .replace_if_points_at(hash, rid, generation, offset, new_entry);
        true
    }

    // ------------------------------------------------------------------
    // Flush / persist / recover
    // ------------------------------------------------------------------

    /// Pushes every buffered region (open ones included) to the device and
    /// flushes it. Buffers stay in place; open regions keep filling.
    pub(crate) fn flush(&self) -> Result<()> {
        for (rid, buffer) in self.buffers.buffered() {
            let data = buffer.read();
            self.device.write(self.mgr.region_offset(rid), &data)?;
        }
        self.device.flush()
    }

    /// State for the metadata snapshot. Open regions with items are recorded
    /// as sealed (their bytes are on the device after `flush`) so a
    /// recovered instance can read them; their unused tail is abandoned.
    pub(crate) fn snapshot(&self) -> (Vec<RegionSnap>, Vec<(u64, IndexEntry)>) {
        let mut regions = self.mgr.snapshot();
        for open in self.alloc.open_regions() {
            let snap = &mut regions[open.rid as usize];
            if open.num_items > 0 {
                snap.sealed = true;
                snap.size_class = open.size_class;
                snap.num_items = open.num_items;
                snap.bytes_used = open.bytes_used;
            }
        }
        (regions, self.index.snapshot())
    }

    pub(crate) fn restore(
        &self,
        regions: &[RegionSnap],
        entries: Vec<(u64, IndexEntry)>,
    ) -> Result<()> {
        self.alloc.clear();
        self.buffers.clear();
        self.mgr.restore(regions)?;
        self.index.restore(entries);
        Ok(())
    }

    pub(crate) fn reset(&self) {
        self.alloc.clear();
        self.buffers.clear();
        self.mgr.reset();
        self.index.clear();
    }

    fn notify(&self, key: &[u8], value: &[u8], event: DestructorEvent) {
        if let Some(callback) = &self.destructor {
            callback(key, value, event);
        }
    }
}
