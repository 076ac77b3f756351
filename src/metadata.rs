//! # Persisted Metadata
//!
//! `persist` serializes the engine state that cannot be rebuilt from the
//! data ranges (the region table, the block-cache index, and the Big Hash
//! epoch and bloom snapshot) into the reserved prefix of the device:
//!
//! ```text
//! [0..8)    magic "NAVYMETA"
//! [8..12)   format version (u32, big-endian)
//! [12..16)  header length h (u32, big-endian)
//! [16..h)   config fingerprint (geometry + engine set)
//! [h..h+c)  region table, index records, big hash state
//! [h+c..)   trailer: payload length (u32), crc32 (u32)
//! ```
//!
//! `recover` is all-or-nothing: bad magic, unknown version, a fingerprint
//! that does not match the running configuration, a truncated body, or a
//! failed CRC all yield `None` and the driver cold-starts. There is no
//! partial recovery: a cache can always refill.

use crc::{Crc, CRC_32_ISCSI};
use tracing::{debug, warn};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{big_endian, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::block_cache::index::IndexEntry;
use crate::config::METADATA_VERSION;
use crate::device::{AlignedBuf, Device};
use crate::error::{Error, Result};
use crate::region::RegionSnap;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const META_MAGIC: &[u8; 8] = b"NAVYMETA";
const TRAILER_SIZE: usize = 8;

/// Geometry the snapshot was taken under. Any difference means the on-device
/// state describes a different cache and must not be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct Fingerprint {
    pub device_size: U64,
    pub block_size: U64,
    pub region_size: U64,
    pub bucket_size: U64,
    pub engine_set: U32,
    pub _pad: U32,
    pub bc_base: U64,
    pub bc_size: U64,
    pub bh_base: U64,
    pub bh_size: U64,
}

pub(crate) const ENGINE_BLOCK_CACHE: u32 = 1 << 0;
pub(crate) const ENGINE_BIG_HASH: u32 = 1 << 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct MetaPrefix {
    magic: [u8; 8],
    version: big_endian::U32,
    header_len: big_endian::U32,
}

const PREFIX_SIZE: usize = std::mem::size_of::<MetaPrefix>();
const HEADER_LEN: usize = PREFIX_SIZE + std::mem::size_of::<Fingerprint>();

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct RegionRecord {
    flags: U32,
    size_class: U32,
    priority: U32,
    num_items: U32,
    bytes_used: U32,
    generation: U32,
    seal_epoch: U64,
    last_access_epoch: U64,
}

const REGION_SEALED: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct IndexRecord {
    key_hash: U64,
    region: U32,
    offset: U32,
    generation: U32,
    hits: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct CountRecord {
    count: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct BigHashRecord {
    epoch: U32,
    has_bloom: U32,
    bloom_words: U64,
}

/// Everything `persist` writes and `recover` hands back.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct MetadataState {
    pub regions: Vec<RegionSnap>,
    pub index: Vec<(u64, IndexEntry)>,
    pub bh_epoch: u32,
    pub bloom_words: Option<Vec<u64>>,
}

fn serialize(fingerprint: &Fingerprint, state: &MetadataState) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        HEADER_LEN
            + 16
            + state.regions.len() * std::mem::size_of::<RegionRecord>()
            + state.index.len() * std::mem::size_of::<IndexRecord>()
            + state.bloom_words.as_ref().map_or(0, |w| w.len() * 8)
            + TRAILER_SIZE,
    );

    let prefix = MetaPrefix {
        magic: *META_MAGIC,
        version: big_endian::U32::new(METADATA_VERSION),
        header_len: big_endian::U32::new(HEADER_LEN as u32),
    };
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(fingerprint.as_bytes());

    out.extend_from_slice(
        CountRecord {
            count: U64::new(state.regions.len() as u64),
        }
        .as_bytes(),
    );
    for snap in &state.regions {
        let record = RegionRecord {
            flags: U32::new(if snap.sealed { REGION_SEALED } else { 0 }),
            size_class: U32::new(snap.size_class.unwrap_or(0)),
            priority: U32::new(snap.priority),
            num_items: U32::new(snap.num_items),
            bytes_used: U32::new(snap.bytes_used),
            generation: U32::new(snap.generation),
            seal_epoch: U64::new(snap.seal_epoch),
            last_access_epoch: U64::new(snap.last_access_epoch),
        };
        out.extend_from_slice(record.as_bytes());
    }

    out.extend_from_slice(
        CountRecord {
            count: U64::new(state.index.len() as u64),
        }
        .as_bytes(),
    );
    for (hash, entry) in &state.index {
        let record = IndexRecord {
            key_hash: U64::new(*hash),
            region: U32::new(entry.region),
            offset: U32::new(entry.offset),
            generation: U32::new(entry.generation),
            hits: U32::new(entry.hits as u32),
        };
        out.extend_from_slice(record.as_bytes());
    }

    let bh = BigHashRecord {
        epoch: U32::new(state.bh_epoch),
        has_bloom: U32::new(state.bloom_words.is_some() as u32),
        bloom_words: U64::new(state.bloom_words.as_ref().map_or(0, |w| w.len() as u64)),
    };
    out.extend_from_slice(bh.as_bytes());
    if let Some(words) = &state.bloom_words {
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    let length = out.len() as u32;
    let checksum = CRC32.checksum(&out);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

/// Writes the snapshot into the reserved metadata prefix.
pub(crate) fn persist(
    device: &dyn Device,
    metadata_size: u64,
    fingerprint: &Fingerprint,
    state: &MetadataState,
) -> Result<()> {
    let serialized = serialize(fingerprint, state);
    if serialized.len() as u64 > metadata_size {
        return Err(Error::invalid_argument(format!(
            "serialized metadata ({} bytes) exceeds the reserved prefix ({} bytes)",
            serialized.len(),
            metadata_size
        )));
    }
    let block_size = device.io_alignment() as usize;
    let write_len = serialized.len().div_ceil(block_size) * block_size;
    let mut buf = AlignedBuf::zeroed(write_len, block_size);
    buf[..serialized.len()].copy_from_slice(&serialized);
    device.write(0, &buf)?;
    device.flush()?;
    debug!(bytes = serialized.len(), "metadata persisted");
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn record<T: FromBytes>(&mut self) -> Option<T> {
        let bytes = self.take(std::mem::size_of::<T>())?;
        T::read_from_bytes(bytes).ok()
    }
}

/// Reads and validates the metadata prefix. `None` means cold start.
pub(crate) fn recover(
    device: &dyn Device,
    metadata_size: u64,
    expected: &Fingerprint,
) -> Option<MetadataState> {
    let block_size = device.io_alignment() as usize;
    let read_len = (metadata_size as usize) / block_size * block_size;
    if read_len == 0 {
        return None;
    }
    let mut buf = AlignedBuf::zeroed(read_len, block_size);
    if let Err(err) = device.read(0, &mut buf) {
        warn!(error = %err, "metadata read failed, cold start");
        return None;
    }

    let mut reader = Reader { buf: &buf, pos: 0 };
    let prefix: MetaPrefix = reader.record()?;
    if prefix.magic != *META_MAGIC {
        debug!("no metadata magic, cold start");
        return None;
    }
    if prefix.version.get() != METADATA_VERSION {
        warn!(
            found = prefix.version.get(),
            expected = METADATA_VERSION,
            "metadata version mismatch, cold start"
        );
        return None;
    }
    if prefix.header_len.get() as usize != HEADER_LEN {
        warn!("metadata header length mismatch, cold start");
        return None;
    }
    let fingerprint: Fingerprint = reader.record()?;
    if fingerprint != *expected {
        warn!("config fingerprint mismatch, cold start");
        return None;
    }

    let region_count = reader.record::<CountRecord>()?.count.get() as usize;
    if region_count > buf.len() / std::mem::size_of::<RegionRecord>() {
        return None;
    }
    let mut regions = Vec::with_capacity(region_count);
    for _ in 0..region_count {
        let record: RegionRecord = reader.record()?;
        regions.push(RegionSnap {
            sealed: record.flags.get() & REGION_SEALED != 0,
            size_class: match record.size_class.get() {
                0 => None,
                class => Some(class),
            },
            priority: record.priority.get(),
            num_items: record.num_items.get(),
            bytes_used: record.bytes_used.get(),
            generation: record.generation.get(),
            seal_epoch: record.seal_epoch.get(),
            last_access_epoch: record.last_access_epoch.get(),
        });
    }

    let index_count = reader.record::<CountRecord>()?.count.get() as usize;
    if index_count > buf.len() / std::mem::size_of::<IndexRecord>() {
        return None;
    }
    let mut index = Vec::with_capacity(index_count);
    for _ in 0..index_count {
        let record: IndexRecord = reader.record()?;
        index.push((
            record.key_hash.get(),
            IndexEntry {
                region: record.region.get(),
                offset: record.offset.get(),
                generation: record.generation.get(),
                hits: record.hits.get().min(u8::MAX as u32) as u8,
            },
        ));
    }

    let bh: BigHashRecord = reader.record()?;
    let bloom_words = if bh.has_bloom.get() != 0 {
        let count = bh.bloom_words.get() as usize;
        if count > buf.len() / 8 {
            return None;
        }
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            let bytes = reader.take(8)?;
            words.push(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")));
        }
        Some(words)
    } else {
        None
    };

    let payload_len = reader.pos;
    let trailer = reader.take(TRAILER_SIZE)?;
    let stored_len = u32::from_le_bytes(trailer[..4].try_into().expect("4-byte slice"));
    let stored_crc = u32::from_le_bytes(trailer[4..].try_into().expect("4-byte slice"));
    if stored_len as usize != payload_len {
        warn!("metadata trailer length mismatch, cold start");
        return None;
    }
    if CRC32.checksum(&buf[..payload_len]) != stored_crc {
        warn!("metadata crc mismatch, cold start");
        return None;
    }

    debug!(
        regions = regions.len(),
        index_entries = index.len(),
        "metadata recovered"
    );
    Some(MetadataState {
        regions,
        index,
        bh_epoch: bh.epoch.get(),
        bloom_words,
    })
}
