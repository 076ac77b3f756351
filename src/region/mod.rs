//! # Region Management
//!
//! The block-cache half of the device is an array of fixed-size regions,
//! the unit of allocation, flush, and reclaim. This module owns their
//! lifecycle:
//!
//! ```text
//! Free ──open──> Open ──seal──> Sealed ──victim──> Reclaiming ──done──> Free
//! ```
//!
//! ## Invariants
//!
//! - At most one writer per region: a region is writable only while Open,
//!   and Open regions belong to exactly one allocator slot.
//! - Sealed regions accept reads and reclaim, nothing else.
//! - `bytes_used ≤ region_size`; stack allocations append monotonically.
//! - An item's location is immutable until its region is reclaimed.
//!
//! ## Generations
//!
//! Readers never lock a region. Every region carries a generation counter,
//! bumped when reclaim completes; index entries embed the generation they
//! were written under, and a mismatch at read time means the pointer is
//! stale. Generations live in a dedicated atomic array so the read path
//! stays lock-free.
//!
//! ## Clean pool
//!
//! Reclaimed regions land in a pre-cleaned pool with a configurable target
//! size. Writers demand regions from the pool; when it runs dry the caller
//! reclaims synchronously, and a background job tops the pool back up after
//! every seal. A reclaim that fails (device error) parks the region in
//! quarantine; crossing the quarantine watermark trips engine shutdown.

pub(crate) mod allocator;
pub(crate) mod buffer;
pub mod eviction;

pub use eviction::EvictionPolicyConfig;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use eviction::EvictionPolicy;

pub(crate) type RegionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionState {
    Free,
    Open,
    Sealed,
    Reclaiming,
}

#[derive(Debug, Clone)]
pub(crate) struct Region {
    pub state: RegionState,
    pub size_class: Option<u32>,
    pub priority: u32,
    pub num_items: u32,
    pub bytes_used: u32,
    pub last_access_epoch: u64,
    pub seal_epoch: u64,
}

impl Region {
    fn free() -> Self {
        Self {
            state: RegionState::Free,
            size_class: None,
            priority: 0,
            num_items: 0,
            bytes_used: 0,
            last_access_epoch: 0,
            seal_epoch: 0,
        }
    }
}

/// Victim handed to the reclaim walk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReclaimRegion {
    pub rid: RegionId,
    pub size_class: Option<u32>,
    pub num_items: u32,
    pub bytes_used: u32,
}

/// Per-region record exchanged with the metadata layer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RegionSnap {
    pub sealed: bool,
    pub size_class: Option<u32>,
    pub priority: u32,
    pub num_items: u32,
    pub bytes_used: u32,
    pub generation: u32,
    pub seal_epoch: u64,
    pub last_access_epoch: u64,
}

struct Inner {
    regions: Vec<Region>,
    free: VecDeque<RegionId>,
    clean: VecDeque<RegionId>,
    policy: EvictionPolicy,
    quarantined: usize,
}

pub(crate) struct RegionManager {
    base_offset: u64,
    region_size: u64,
    num_regions: u32,
    target_clean: usize,
    quarantine_watermark: usize,
    policy_config: EvictionPolicyConfig,
    inner: Mutex<Inner>,
    region_ready: Condvar,
    generations: Box<[AtomicU32]>,
    epoch: AtomicU64,
}

impl RegionManager {
    pub(crate) fn new(
        base_offset: u64,
        size: u64,
        region_size: u64,
        policy_config: EvictionPolicyConfig,
        target_clean: usize,
        quarantine_watermark: usize,
    ) -> Result<Self> {
        if region_size == 0 || size % region_size != 0 {
            return Err(Error::invalid_argument(format!(
                "cache size {size} is not a multiple of region size {region_size}"
            )));
        }
        let num_regions = size / region_size;
        if num_regions < 2 {
            return Err(Error::invalid_argument(
                "block cache needs at least two regions",
            ));
        }
        let num_regions = u32::try_from(num_regions)
            .map_err(|_| Error::invalid_argument("too many regions"))?;

        let policy = EvictionPolicy::new(&policy_config, num_regions)?;
        Ok(Self {
            base_offset,
            region_size,
            num_regions,
            target_clean,
            quarantine_watermark,
            policy_config,
            inner: Mutex::new(Inner {
                regions: (0..num_regions).map(|_| Region::free()).collect(),
                free: (0..num_regions).collect(),
                clean: VecDeque::new(),
                policy,
                quarantined: 0,
            }),
            region_ready: Condvar::new(),
            generations: (0..num_regions).map(|_| AtomicU32::new(1)).collect(),
            epoch: AtomicU64::new(1),
        })
    }

    pub(crate) fn region_size(&self) -> u64 {
        self.region_size
    }

    pub(crate) fn region_offset(&self, rid: RegionId) -> u64 {
        self.base_offset + rid as u64 * self.region_size
    }

    /// Lock-free generation read for the lookup path.
    #[inline]
    pub(crate) fn generation(&self, rid: RegionId) -> u32 {
        self.generations[rid as usize].load(Ordering::Acquire)
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Pops a region from the clean pool (or the never-used free list) and
    /// marks it Open. `None` means a reclaim must produce one.
    pub(crate) fn try_open_region(&self) -> Option<RegionId> {
        let mut inner = self.inner.lock();
        let rid = inner.clean.pop_front().or_else(|| inner.free.pop_front())?;
        inner.regions[rid as usize].state = RegionState::Open;
        Some(rid)
    }

    /// Returns a region acquired by `try_open_region` that lost an install
    /// race. It goes to the front of the clean pool, still clean.
    pub(crate) fn return_region(&self, rid: RegionId) {
        let mut inner = self.inner.lock();
        inner.regions[rid as usize] = Region::free();
        inner.clean.push_front(rid);
        drop(inner);
        self.region_ready.notify_one();
    }

    /// Waits until a region may be available, bounded so callers can
    /// re-check the shutdown flag and re-drive reclaim.
    pub(crate) fn wait_for_region(&self, timeout: Duration, shutdown: &AtomicBool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.clean.is_empty() || !inner.free.is_empty() {
            return Ok(());
        }
        if shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.region_ready.wait_for(&mut inner, timeout);
        Ok(())
    }

    /// True when the background reclaim should produce more clean regions.
    pub(crate) fn below_clean_target(&self) -> bool {
        let inner = self.inner.lock();
        inner.clean.len() + inner.free.len() < self.target_clean
    }

    /// Open → Sealed, recording final occupancy and entering the eviction
    /// order. Returns the seal epoch for the on-device region header.
    pub(crate) fn seal(&self, detached: &allocator::DetachedRegion) -> u64 {
        let seal_epoch = self.next_epoch();
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let region = &mut inner.regions[detached.rid as usize];
        debug_assert_eq!(region.state, RegionState::Open);
        region.state = RegionState::Sealed;
        region.size_class = detached.size_class;
        region.num_items = detached.num_items;
        region.bytes_used = detached.bytes_used;
        region.seal_epoch = seal_epoch;
        inner.policy.on_seal(detached.rid, &mut inner.regions);
        debug!(
            rid = detached.rid,
            items = detached.num_items,
            bytes = detached.bytes_used,
            "region sealed"
        );
        seal_epoch
    }

    /// Marks a lookup hit for the eviction order. No-op unless the region is
    /// sealed (hits on open regions are served from the write buffer and
    /// carry no eviction signal yet).
    pub(crate) fn note_hit(&self, rid: RegionId) {
        let epoch = self.next_epoch();
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let region = &mut inner.regions[rid as usize];
        if region.state != RegionState::Sealed {
            return;
        }
        region.last_access_epoch = epoch;
        inner.policy.on_hit(rid, &mut inner.regions);
    }

    /// Picks the eviction victim and transitions it to Reclaiming. `None`
    /// when no sealed region exists yet.
    pub(crate) fn begin_reclaim(&self) -> Option<ReclaimRegion> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let rid = inner.policy.pick_victim(&mut inner.regions)?;
        let region = &mut inner.regions[rid as usize];
        debug_assert_eq!(region.state, RegionState::Sealed);
        region.state = RegionState::Reclaiming;
        Some(ReclaimRegion {
            rid,
            size_class: region.size_class,
            num_items: region.num_items,
            bytes_used: region.bytes_used,
        })
    }

    /// Completes a reclaim: bumps the generation (invalidating every index
    /// entry still pointing here) and returns the region to the clean pool.
    pub(crate) fn finish_reclaim(&self, rid: RegionId) {
        self.generations[rid as usize].fetch_add(1, Ordering::AcqRel);
        let mut inner = self.inner.lock();
        inner.regions[rid as usize] = Region::free();
        inner.clean.push_back(rid);
        drop(inner);
        self.region_ready.notify_one();
        debug!(rid, "region reclaimed");
    }

    /// Parks a region whose reclaim failed. Returns true when the quarantine
    /// watermark is exceeded and the engine should stop accepting work.
    pub(crate) fn quarantine(&self, rid: RegionId) -> bool {
        let mut inner = self.inner.lock();
        inner.quarantined += 1;
        let over = inner.quarantined > self.quarantine_watermark;
        warn!(
            rid,
            quarantined = inner.quarantined,
            watermark = self.quarantine_watermark,
            "region quarantined after failed reclaim"
        );
        over
    }

    pub(crate) fn snapshot(&self) -> Vec<RegionSnap> {
        let inner = self.inner.lock();
        inner
            .regions
            .iter()
            .enumerate()
            .map(|(rid, region)| RegionSnap {
                sealed: region.state == RegionState::Sealed,
                size_class: region.size_class,
                priority: region.priority,
                num_items: region.num_items,
                bytes_used: region.bytes_used,
                generation: self.generations[rid].load(Ordering::Acquire),
                seal_epoch: region.seal_epoch,
                last_access_epoch: region.last_access_epoch,
            })
            .collect()
    }

    /// Rebuilds state from a persisted snapshot. Sealed regions re-enter the
    /// eviction order oldest-first by their recorded epochs; everything else
    /// becomes free.
    pub(crate) fn restore(&self, snaps: &[RegionSnap]) -> Result<()> {
        if snaps.len() != self.num_regions as usize {
            return Err(Error::invalid_argument(format!(
                "snapshot has {} regions, device layout has {}",
                snaps.len(),
                self.num_regions
            )));
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.policy = EvictionPolicy::new(&self.policy_config, self.num_regions)?;
        inner.free.clear();
        inner.clean.clear();
        inner.quarantined = 0;

        let mut max_epoch = 0u64;
        let mut sealed: Vec<(u64, RegionId)> = Vec::new();
        for (rid, snap) in snaps.iter().enumerate() {
            self.generations[rid].store(snap.generation, Ordering::Release);
            max_epoch = max_epoch.max(snap.seal_epoch).max(snap.last_access_epoch);
            if snap.sealed && snap.num_items > 0 {
                inner.regions[rid] = Region {
                    state: RegionState::Sealed,
                    size_class: snap.size_class,
                    priority: snap.priority,
                    num_items: snap.num_items,
                    bytes_used: snap.bytes_used,
                    last_access_epoch: snap.last_access_epoch,
                    seal_epoch: snap.seal_epoch,
                };
                sealed.push((snap.seal_epoch.max(snap.last_access_epoch), rid as RegionId));
            } else {
                inner.regions[rid] = Region::free();
                inner.free.push_back(rid as RegionId);
            }
        }

        sealed.sort_unstable();
        for (_, rid) in sealed {
            inner.policy.on_seal(rid, &mut inner.regions);
        }
        self.epoch.store(max_epoch + 1, Ordering::Release);
        Ok(())
    }

    /// Cold start: forget everything and bump every generation so any
    /// surviving pointer is stale.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.regions = (0..self.num_regions).map(|_| Region::free()).collect();
        inner.free = (0..self.num_regions).collect();
        inner.clean.clear();
        inner.quarantined = 0;
        inner.policy = EvictionPolicy::new(&self.policy_config, self.num_regions)
            .expect("policy config validated at construction");
        for generation in self.generations.iter() {
            generation.fetch_add(1, Ordering::AcqRel);
        }
        drop(inner);
        self.region_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator::DetachedRegion;

    fn manager() -> RegionManager {
        RegionManager::new(0, 16 << 20, 1 << 20, EvictionPolicyConfig::Lru, 1, 8).unwrap()
    }

    fn detached(rid: RegionId) -> DetachedRegion {
        DetachedRegion {
            rid,
            size_class: None,
            num_items: 3,
            bytes_used: 4096,
        }
    }

    #[test]
    fn lifecycle_free_open_sealed_reclaimed() {
        let mgr = manager();
        let rid = mgr.try_open_region().unwrap();
        let before = mgr.generation(rid);

        mgr.seal(&detached(rid));
        let victim = mgr.begin_reclaim().unwrap();
        assert_eq!(victim.rid, rid);
        assert_eq!(victim.num_items, 3);

        mgr.finish_reclaim(rid);
        assert_eq!(mgr.generation(rid), before + 1);

        // The reclaimed region is first in line again via the clean pool.
        assert_eq!(mgr.try_open_region(), Some(rid));
    }

    #[test]
    fn begin_reclaim_without_sealed_regions_is_none() {
        let mgr = manager();
        let _rid = mgr.try_open_region().unwrap();
        assert!(mgr.begin_reclaim().is_none());
    }

    #[test]
    fn lru_reclaims_least_recently_hit_region() {
        let mgr = manager();
        let a = mgr.try_open_region().unwrap();
        let b = mgr.try_open_region().unwrap();
        mgr.seal(&detached(a));
        mgr.seal(&detached(b));

        mgr.note_hit(a);
        assert_eq!(mgr.begin_reclaim().unwrap().rid, b);
    }

    #[test]
    fn quarantine_trips_watermark() {
        let mgr = RegionManager::new(0, 4 << 20, 1 << 20, EvictionPolicyConfig::Fifo, 1, 1)
            .unwrap();
        assert!(!mgr.quarantine(0));
        assert!(mgr.quarantine(1));
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mgr = manager();
        let a = mgr.try_open_region().unwrap();
        mgr.seal(&detached(a));
        mgr.note_hit(a);

        let snaps = mgr.snapshot();
        let restored = manager();
        restored.restore(&snaps).unwrap();

        let victim = restored.begin_reclaim().unwrap();
        assert_eq!(victim.rid, a);
        assert_eq!(victim.num_items, 3);
        assert_eq!(restored.generation(a), mgr.generation(a));
    }

    #[test]
    fn reset_invalidates_generations() {
        let mgr = manager();
        let rid = mgr.try_open_region().unwrap();
        mgr.seal(&detached(rid));
        let before = mgr.generation(rid);

        mgr.reset();
        assert_eq!(mgr.generation(rid), before + 1);
        assert!(mgr.begin_reclaim().is_none());
    }
}
