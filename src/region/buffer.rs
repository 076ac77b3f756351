//! In-memory region buffers.
//!
//! An open region lives entirely in DRAM until it is sealed; the seal
//! triggers the region's single whole-region device write. Between seal and
//! flush completion the buffer keeps serving reads, so a lookup never
//! observes a half-written region. The pool caps the number of simultaneous
//! buffers (`num_in_mem_buffers`, counting open regions); writers wanting a
//! fresh buffer wait for a flush to retire one.
//!
//! Every pool entry carries a token minted at creation. A flush job records
//! the token of the buffer it was scheduled for and retires only a matching
//! entry, so a flush that lost a race with reclaim (region already recycled
//! and reopened with a fresh buffer) cannot retire its successor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use super::RegionId;
use crate::config::CLEAN_POOL_WAIT;
use crate::device::AlignedBuf;
use crate::error::{Error, Result};

pub(crate) struct RegionBuffer {
    data: RwLock<AlignedBuf>,
}

impl RegionBuffer {
    fn new(region_size: usize, align: usize) -> Self {
        Self {
            data: RwLock::new(AlignedBuf::zeroed(region_size, align)),
        }
    }

    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, AlignedBuf> {
        self.data.read()
    }

    pub(crate) fn write(&self) -> parking_lot::RwLockWriteGuard<'_, AlignedBuf> {
        self.data.write()
    }
}

pub(crate) struct BufferPool {
    limit: usize,
    region_size: usize,
    align: usize,
    inner: Mutex<HashMap<RegionId, (u64, Arc<RegionBuffer>)>>,
    slot_free: Condvar,
    next_token: AtomicU64,
}

impl BufferPool {
    pub(crate) fn new(limit: usize, region_size: usize, align: usize) -> Self {
        Self {
            limit,
            region_size,
            align,
            inner: Mutex::new(HashMap::with_capacity(limit)),
            slot_free: Condvar::new(),
            next_token: AtomicU64::new(1),
        }
    }

    fn mint(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates the buffer for a freshly opened region, waiting for a slot if
    /// the pool is at its limit. Bails with `ShuttingDown` when the engine
    /// stops, so a blocked writer cannot stall shutdown.
    pub(crate) fn create(
        &self,
        rid: RegionId,
        shutdown: &AtomicBool,
    ) -> Result<(u64, Arc<RegionBuffer>)> {
        let mut buffers = self.inner.lock();
        while buffers.len() >= self.limit && !buffers.contains_key(&rid) {
            if shutdown.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            self.slot_free.wait_for(&mut buffers, CLEAN_POOL_WAIT);
        }
        let token = self.mint();
        let buffer = Arc::new(RegionBuffer::new(self.region_size, self.align));
        buffers.insert(rid, (token, Arc::clone(&buffer)));
        Ok((token, buffer))
    }

    /// Non-waiting variant used on the reclaim path, where waiting for a
    /// slot could depend on a flush queued behind the running reclaim job.
    pub(crate) fn try_create(&self, rid: RegionId) -> Option<(u64, Arc<RegionBuffer>)> {
        let mut buffers = self.inner.lock();
        if buffers.len() >= self.limit && !buffers.contains_key(&rid) {
            return None;
        }
        let token = self.mint();
        let buffer = Arc::new(RegionBuffer::new(self.region_size, self.align));
        buffers.insert(rid, (token, Arc::clone(&buffer)));
        Some((token, buffer))
    }

    pub(crate) fn get(&self, rid: RegionId) -> Option<Arc<RegionBuffer>> {
        self.inner.lock().get(&rid).map(|(_, buf)| Arc::clone(buf))
    }

    pub(crate) fn token(&self, rid: RegionId) -> Option<u64> {
        self.inner.lock().get(&rid).map(|(token, _)| *token)
    }

    /// The buffer only if it is still the one minted with `token`.
    pub(crate) fn get_if_current(&self, rid: RegionId, token: u64) -> Option<Arc<RegionBuffer>> {
        let buffers = self.inner.lock();
        match buffers.get(&rid) {
            Some((t, buf)) if *t == token => Some(Arc::clone(buf)),
            _ => None,
        }
    }

    /// Retires a flushed buffer and wakes one waiting writer. A token
    /// mismatch means the entry was already replaced; it is left alone.
    pub(crate) fn remove_if_current(&self, rid: RegionId, token: u64) {
        let mut buffers = self.inner.lock();
        if matches!(buffers.get(&rid), Some((t, _)) if *t == token) {
            buffers.remove(&rid);
            self.slot_free.notify_one();
        }
    }

    /// Unconditional retire, used when a region is recycled with a flush
    /// still pending (the flush keeps its own `Arc` and will no-op on its
    /// token check).
    pub(crate) fn remove(&self, rid: RegionId) {
        let mut buffers = self.inner.lock();
        if buffers.remove(&rid).is_some() {
            self.slot_free.notify_one();
        }
    }

    /// Snapshot of the buffered regions, for `flush` to push open-region
    /// contents to the device.
    pub(crate) fn buffered(&self) -> Vec<(RegionId, Arc<RegionBuffer>)> {
        self.inner
            .lock()
            .iter()
            .map(|(&rid, (_, buf))| (rid, Arc::clone(buf)))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().clear();
        self.slot_free.notify_all();
    }
}
