//! Region eviction policies.
//!
//! A policy orders sealed regions for reclaim. It is consulted through a
//! three-method capability (`on_seal`, `on_hit`, `pick_victim`) and never
//! owns region state; it only arranges region ids. All three variants are
//! O(1) except segmented-FIFO promotion, which scans one segment (region
//! counts are device-size / region-size, small enough that this is noise).
//!
//! - **LRU**: intrusive doubly-linked list by region id. Hits move a region
//!   to the MRU end; the victim is the LRU tail.
//! - **FIFO**: plain seal-order queue; hits are ignored.
//! - **Segmented FIFO**: `k` queues with configured size ratios. Sealed
//!   regions enter segment 0, demotion flows toward the last segment as
//!   ratios are rebalanced after every seal, hits promote back to segment
//!   0, and the victim comes from the highest-index non-empty segment.

use std::collections::VecDeque;

use smallvec::SmallVec;

use super::{Region, RegionId};
use crate::error::{Error, Result};

/// Which ordering a block cache uses for reclaim victims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionPolicyConfig {
    Lru,
    Fifo,
    /// Ratios of segment sizes, segment 0 first. `[2, 1]` keeps roughly two
    /// thirds of sealed regions in the probationary segment.
    SegmentedFifo { segment_ratios: Vec<u32> },
}

pub(crate) enum EvictionPolicy {
    Lru(LruList),
    Fifo(FifoQueue),
    SegmentedFifo(SegmentedFifo),
}

impl EvictionPolicy {
    pub(crate) fn new(config: &EvictionPolicyConfig, num_regions: u32) -> Result<Self> {
        match config {
            EvictionPolicyConfig::Lru => Ok(Self::Lru(LruList::new(num_regions))),
            EvictionPolicyConfig::Fifo => Ok(Self::Fifo(FifoQueue::default())),
            EvictionPolicyConfig::SegmentedFifo { segment_ratios } => {
                if segment_ratios.is_empty() {
                    return Err(Error::invalid_argument(
                        "segmented fifo needs at least one segment ratio",
                    ));
                }
                if segment_ratios.iter().any(|&r| r == 0) {
                    return Err(Error::invalid_argument(
                        "segmented fifo ratios must be nonzero",
                    ));
                }
                Ok(Self::SegmentedFifo(SegmentedFifo::new(segment_ratios)))
            }
        }
    }

    pub(crate) fn on_seal(&mut self, rid: RegionId, regions: &mut [Region]) {
        match self {
            Self::Lru(lru) => lru.push_front(rid),
            Self::Fifo(fifo) => fifo.queue.push_back(rid),
            Self::SegmentedFifo(sfifo) => sfifo.on_seal(rid, regions),
        }
    }

    pub(crate) fn on_hit(&mut self, rid: RegionId, regions: &mut [Region]) {
        match self {
            Self::Lru(lru) => lru.move_to_front(rid),
            Self::Fifo(_) => {}
            Self::SegmentedFifo(sfifo) => sfifo.on_hit(rid, regions),
        }
    }

    pub(crate) fn pick_victim(&mut self, _regions: &mut [Region]) -> Option<RegionId> {
        match self {
            Self::Lru(lru) => lru.pop_back(),
            Self::Fifo(fifo) => fifo.queue.pop_front(),
            Self::SegmentedFifo(sfifo) => sfifo.pick_victim(),
        }
    }

}

const NIL: u32 = u32::MAX;

/// Intrusive doubly-linked list over region ids. Head is MRU, tail is LRU.
pub(crate) struct LruList {
    head: u32,
    tail: u32,
    prev: Vec<u32>,
    next: Vec<u32>,
    present: Vec<bool>,
}

impl LruList {
    fn new(num_regions: u32) -> Self {
        let n = num_regions as usize;
        Self {
            head: NIL,
            tail: NIL,
            prev: vec![NIL; n],
            next: vec![NIL; n],
            present: vec![false; n],
        }
    }

    fn push_front(&mut self, rid: RegionId) {
        debug_assert!(!self.present[rid as usize]);
        let i = rid as usize;
        self.present[i] = true;
        self.prev[i] = NIL;
        self.next[i] = self.head;
        if self.head != NIL {
            self.prev[self.head as usize] = rid;
        }
        self.head = rid;
        if self.tail == NIL {
            self.tail = rid;
        }
    }

    fn unlink(&mut self, rid: RegionId) {
        let i = rid as usize;
        let (prev, next) = (self.prev[i], self.next[i]);
        if prev != NIL {
            self.next[prev as usize] = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.prev[next as usize] = prev;
        } else {
            self.tail = prev;
        }
        self.present[i] = false;
    }

    fn move_to_front(&mut self, rid: RegionId) {
        if !self.present[rid as usize] || self.head == rid {
            return;
        }
        self.unlink(rid);
        self.push_front(rid);
    }

    fn pop_back(&mut self) -> Option<RegionId> {
        if self.tail == NIL {
            return None;
        }
        let victim = self.tail;
        self.unlink(victim);
        Some(victim)
    }
}

#[derive(Default)]
pub(crate) struct FifoQueue {
    queue: VecDeque<RegionId>,
}

pub(crate) struct SegmentedFifo {
    ratios: SmallVec<[u32; 4]>,
    segments: Vec<VecDeque<RegionId>>,
    total: usize,
}

impl SegmentedFifo {
    fn new(ratios: &[u32]) -> Self {
        Self {
            ratios: SmallVec::from_slice(ratios),
            segments: ratios.iter().map(|_| VecDeque::new()).collect(),
            total: 0,
        }
    }

    fn on_seal(&mut self, rid: RegionId, regions: &mut [Region]) {
        self.segments[0].push_back(rid);
        regions[rid as usize].priority = 0;
        self.total += 1;
        self.rebalance(regions);
    }

    fn on_hit(&mut self, rid: RegionId, regions: &mut [Region]) {
        let segment = regions[rid as usize].priority as usize;
        if segment == 0 || segment >= self.segments.len() {
            return;
        }
        if let Some(pos) = self.segments[segment].iter().position(|&r| r == rid) {
            self.segments[segment].remove(pos);
            self.segments[0].push_back(rid);
            regions[rid as usize].priority = 0;
        }
    }

    fn pick_victim(&mut self) -> Option<RegionId> {
        for segment in self.segments.iter_mut().rev() {
            if let Some(rid) = segment.pop_front() {
                self.total -= 1;
                return Some(rid);
            }
        }
        None
    }

    /// Demotes the oldest overflow of each segment into the next so segment
    /// sizes track `total * ratio_i / sum(ratios)`. The last segment absorbs
    /// the remainder. Demotion preserves global seal order because the
    /// oldest entry of segment `i` is younger than everything already in
    /// segment `i + 1`.
    fn rebalance(&mut self, regions: &mut [Region]) {
        let sum: u64 = self.ratios.iter().map(|&r| r as u64).sum();
        for i in 0..self.segments.len() - 1 {
            let target = (self.total as u64 * self.ratios[i] as u64 / sum) as usize;
            while self.segments[i].len() > target {
                let Some(rid) = self.segments[i].pop_front() else {
                    break;
                };
                regions[rid as usize].priority = (i + 1) as u32;
                self.segments[i + 1].push_back(rid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionState;

    fn regions(n: u32) -> Vec<Region> {
        (0..n)
            .map(|_| Region {
                state: RegionState::Sealed,
                size_class: None,
                priority: 0,
                num_items: 1,
                bytes_used: 0,
                last_access_epoch: 0,
                seal_epoch: 0,
            })
            .collect()
    }

    #[test]
    fn lru_evicts_least_recently_hit() {
        let mut regions = regions(4);
        let mut policy = EvictionPolicy::new(&EvictionPolicyConfig::Lru, 4).unwrap();
        for rid in 0..4 {
            policy.on_seal(rid, &mut regions);
        }
        // Hit region 0 so region 1 becomes the oldest untouched.
        policy.on_hit(0, &mut regions);
        assert_eq!(policy.pick_victim(&mut regions), Some(1));
        assert_eq!(policy.pick_victim(&mut regions), Some(2));
        assert_eq!(policy.pick_victim(&mut regions), Some(3));
        assert_eq!(policy.pick_victim(&mut regions), Some(0));
        assert_eq!(policy.pick_victim(&mut regions), None);
    }

    #[test]
    fn fifo_ignores_hits() {
        let mut regions = regions(3);
        let mut policy = EvictionPolicy::new(&EvictionPolicyConfig::Fifo, 3).unwrap();
        for rid in 0..3 {
            policy.on_seal(rid, &mut regions);
        }
        policy.on_hit(0, &mut regions);
        assert_eq!(policy.pick_victim(&mut regions), Some(0));
    }

    #[test]
    fn sfifo_victims_come_from_last_segment() {
        let mut regions = regions(6);
        let config = EvictionPolicyConfig::SegmentedFifo {
            segment_ratios: vec![1, 1],
        };
        let mut policy = EvictionPolicy::new(&config, 6).unwrap();
        for rid in 0..6 {
            policy.on_seal(rid, &mut regions);
        }
        // Half the sealed regions have been demoted; the oldest one is the
        // victim.
        let victim = policy.pick_victim(&mut regions).unwrap();
        assert_eq!(victim, 0);
        assert_eq!(regions[victim as usize].priority, 1);
    }

    #[test]
    fn sfifo_promotion_rescues_hit_region() {
        let mut regions = regions(6);
        let config = EvictionPolicyConfig::SegmentedFifo {
            segment_ratios: vec![1, 1],
        };
        let mut policy = EvictionPolicy::new(&config, 6).unwrap();
        for rid in 0..6 {
            policy.on_seal(rid, &mut regions);
        }
        // Region 0 sits in the victim segment; a hit promotes it back.
        assert_eq!(regions[0].priority, 1);
        policy.on_hit(0, &mut regions);
        assert_eq!(regions[0].priority, 0);
        assert_ne!(policy.pick_victim(&mut regions), Some(0));
    }

    #[test]
    fn sfifo_rejects_bad_ratios() {
        assert!(EvictionPolicy::new(
            &EvictionPolicyConfig::SegmentedFifo {
                segment_ratios: vec![]
            },
            4
        )
        .is_err());
        assert!(EvictionPolicy::new(
            &EvictionPolicyConfig::SegmentedFifo {
                segment_ratios: vec![1, 0]
            },
            4
        )
        .is_err());
    }
}
