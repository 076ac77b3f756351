//! In-region allocation.
//!
//! Two exclusive modes:
//!
//! - **Stack**: one open region, monotonic bump pointer, any entry up to the
//!   region's usable capacity.
//! - **Size classes**: one open region *per class*; an allocation rounds up
//!   to the smallest class that fits and the region serves only that class
//!   for its lifetime.
//!
//! The allocator hands out `(region, offset)` pairs and detects when an open
//! region is exhausted; sealing, buffer management, and region acquisition
//! stay with the block cache, which owns the locks those steps need. The
//! allocator's own lock is held only for pointer arithmetic.

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::RegionId;
use crate::config::{ENTRY_ALIGN, REGION_HEADER_SIZE};
use crate::error::{Error, Result};

/// Rounds an entry length up to the in-region alignment.
#[inline]
pub(crate) fn align_entry(len: u32) -> u32 {
    (len + (ENTRY_ALIGN - 1)) & !(ENTRY_ALIGN - 1)
}

#[derive(Debug, Clone)]
pub(crate) enum AllocMode {
    Stack,
    /// Ascending, deduplicated slot sizes, each a multiple of `ENTRY_ALIGN`.
    SizeClasses(Vec<u32>),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Allocation {
    pub rid: RegionId,
    /// Offset of the slot inside the region.
    pub offset: u32,
    /// Reserved bytes: the rounded entry size (stack) or the class size.
    pub slot_size: u32,
}

/// An open region detached because it could not fit the next allocation.
/// The caller seals and flushes it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DetachedRegion {
    pub rid: RegionId,
    pub size_class: Option<u32>,
    pub num_items: u32,
    pub bytes_used: u32,
}

pub(crate) enum TryAlloc {
    Allocated(Allocation),
    /// The class's open region is full and has been detached; seal it, then
    /// retry.
    Exhausted(DetachedRegion),
    /// No open region for this class; install one, then retry.
    NeedRegion,
}

struct OpenRegion {
    rid: RegionId,
    cursor: u32,
    items: u32,
}

pub(crate) struct RegionAllocator {
    mode: AllocMode,
    region_size: u32,
    open: Mutex<HashMap<u32, OpenRegion>>,
}

impl RegionAllocator {
    pub(crate) fn new(mode: AllocMode, region_size: u64) -> Result<Self> {
        let region_size = u32::try_from(region_size)
            .map_err(|_| Error::invalid_argument("region size exceeds 4 GiB"))?;

        if let AllocMode::SizeClasses(classes) = &mode {
            if classes.is_empty() {
                return Err(Error::invalid_argument("size class list is empty"));
            }
            let capacity = region_size - REGION_HEADER_SIZE;
            let mut last = 0u32;
            for &class in classes {
                if class == 0 || class % ENTRY_ALIGN != 0 {
                    return Err(Error::invalid_argument(format!(
                        "size class {class} is not a positive multiple of {ENTRY_ALIGN}"
                    )));
                }
                if class <= last {
                    return Err(Error::invalid_argument(
                        "size classes must be ascending and distinct",
                    ));
                }
                if class > capacity {
                    return Err(Error::invalid_argument(format!(
                        "size class {class} exceeds region capacity {capacity}"
                    )));
                }
                last = class;
            }
        }

        Ok(Self {
            mode,
            region_size,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Number of regions this allocator keeps open at once; the buffer pool
    /// must be at least this large.
    pub(crate) fn open_region_demand(&self) -> usize {
        match &self.mode {
            AllocMode::Stack => 1,
            AllocMode::SizeClasses(classes) => classes.len(),
        }
    }

    /// Maps an entry length to `(class key, slot size)`. Fails with
    /// `Rejected` when no region could ever hold the entry.
    fn resolve(&self, len: u32) -> Result<(u32, u32)> {
        let aligned = align_entry(len);
        match &self.mode {
            AllocMode::Stack => {
                if aligned > self.region_size - REGION_HEADER_SIZE {
                    return Err(Error::Rejected);
                }
                Ok((0, aligned))
            }
            AllocMode::SizeClasses(classes) => classes
                .iter()
                .find(|&&class| class >= aligned)
                .map(|&class| (class, class))
                .ok_or(Error::Rejected),
        }
    }

    pub(crate) fn try_allocate(&self, len: u32) -> Result<TryAlloc> {
        let (key, slot) = self.resolve(len)?;
        let mut open = self.open.lock();
        match open.get_mut(&key) {
            Some(region) if region.cursor as u64 + slot as u64 <= self.region_size as u64 => {
                let offset = region.cursor;
                region.cursor += slot;
                region.items += 1;
                Ok(TryAlloc::Allocated(Allocation {
                    rid: region.rid,
                    offset,
                    slot_size: slot,
                }))
            }
            Some(_) => {
                let full = open.remove(&key).expect("entry checked above");
                Ok(TryAlloc::Exhausted(DetachedRegion {
                    rid: full.rid,
                    size_class: (key != 0).then_some(key),
                    num_items: full.items,
                    bytes_used: full.cursor,
                }))
            }
            None => Ok(TryAlloc::NeedRegion),
        }
    }

    /// Installs `rid` as the open region for the class serving `len`-byte
    /// entries. Fails when a racing writer installed one first; the caller
    /// returns the region to the manager and retries.
    pub(crate) fn install(&self, len: u32, rid: RegionId) -> Result<()> {
        let (key, _) = self.resolve(len)?;
        let mut open = self.open.lock();
        if open.contains_key(&key) {
            return Err(Error::invalid_argument("class already has an open region"));
        }
        open.insert(
            key,
            OpenRegion {
                rid,
                cursor: REGION_HEADER_SIZE,
                items: 0,
            },
        );
        Ok(())
    }

    pub(crate) fn size_class_of(&self, len: u32) -> Result<Option<u32>> {
        let (key, _) = self.resolve(len)?;
        Ok((key != 0).then_some(key))
    }

    /// Snapshot of open regions as `(rid, size_class, items, bytes_used)`,
    /// used by persist to record their occupancy.
    pub(crate) fn open_regions(&self) -> Vec<DetachedRegion> {
        self.open
            .lock()
            .iter()
            .map(|(&key, region)| DetachedRegion {
                rid: region.rid,
                size_class: (key != 0).then_some(key),
                num_items: region.items,
                bytes_used: region.cursor,
            })
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.open.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_bumps_monotonically() {
        let alloc = RegionAllocator::new(AllocMode::Stack, 1 << 20).unwrap();
        alloc.install(100, 5).unwrap();

        let a = match alloc.try_allocate(100).unwrap() {
            TryAlloc::Allocated(a) => a,
            _ => panic!("expected allocation"),
        };
        assert_eq!(a.rid, 5);
        assert_eq!(a.offset, REGION_HEADER_SIZE);
        assert_eq!(a.slot_size, align_entry(100));

        let b = match alloc.try_allocate(64).unwrap() {
            TryAlloc::Allocated(a) => a,
            _ => panic!("expected allocation"),
        };
        assert_eq!(b.offset, REGION_HEADER_SIZE + align_entry(100));
    }

    #[test]
    fn stack_detaches_exhausted_region() {
        let alloc = RegionAllocator::new(AllocMode::Stack, 4096).unwrap();
        alloc.install(2000, 1).unwrap();
        assert!(matches!(
            alloc.try_allocate(2000).unwrap(),
            TryAlloc::Allocated(_)
        ));

        // Capacity is 4096 - 64; a second 2000-byte entry still fits, a third
        // does not.
        assert!(matches!(
            alloc.try_allocate(2000).unwrap(),
            TryAlloc::Allocated(_)
        ));
        match alloc.try_allocate(2000).unwrap() {
            TryAlloc::Exhausted(detached) => {
                assert_eq!(detached.rid, 1);
                assert_eq!(detached.num_items, 2);
                assert_eq!(
                    detached.bytes_used,
                    REGION_HEADER_SIZE + 2 * align_entry(2000)
                );
            }
            _ => panic!("expected exhaustion"),
        }
        assert!(matches!(
            alloc.try_allocate(2000).unwrap(),
            TryAlloc::NeedRegion
        ));
    }

    #[test]
    fn stack_rejects_oversized_entries() {
        let alloc = RegionAllocator::new(AllocMode::Stack, 4096).unwrap();
        assert!(matches!(alloc.try_allocate(4096), Err(Error::Rejected)));
    }

    #[test]
    fn classes_round_up_and_separate_regions() {
        let alloc =
            RegionAllocator::new(AllocMode::SizeClasses(vec![512, 2048]), 1 << 20).unwrap();
        alloc.install(300, 1).unwrap();
        alloc.install(1500, 2).unwrap();

        let small = match alloc.try_allocate(300).unwrap() {
            TryAlloc::Allocated(a) => a,
            _ => panic!(),
        };
        assert_eq!(small.rid, 1);
        assert_eq!(small.slot_size, 512);

        let large = match alloc.try_allocate(1500).unwrap() {
            TryAlloc::Allocated(a) => a,
            _ => panic!(),
        };
        assert_eq!(large.rid, 2);
        assert_eq!(large.slot_size, 2048);

        assert!(matches!(alloc.try_allocate(3000), Err(Error::Rejected)));
    }

    #[test]
    fn class_validation_rejects_bad_lists() {
        assert!(RegionAllocator::new(AllocMode::SizeClasses(vec![]), 1 << 20).is_err());
        assert!(RegionAllocator::new(AllocMode::SizeClasses(vec![100]), 1 << 20).is_err());
        assert!(RegionAllocator::new(AllocMode::SizeClasses(vec![512, 512]), 1 << 20).is_err());
        assert!(RegionAllocator::new(AllocMode::SizeClasses(vec![1 << 21]), 1 << 20).is_err());
    }

    #[test]
    fn install_race_is_detected() {
        let alloc = RegionAllocator::new(AllocMode::Stack, 1 << 20).unwrap();
        alloc.install(100, 1).unwrap();
        assert!(alloc.install(100, 2).is_err());
    }
}
