//! On-device entry and region-header layout.
//!
//! A block-cache entry is written back-to-back inside its region:
//!
//! ```text
//! +------------------+---------+-----------+-- pad to 8 --+
//! | EntryHeader (24) | key     | value     |              |
//! +------------------+---------+-----------+--------------+
//! ```
//!
//! The header stores the key hash for cheap mismatch rejection, the exact
//! key and value lengths, and an optional CRC-32 over `key ++ value`. The
//! first 64 bytes of every region are reserved for a [`RegionHeader`]
//! stamped at seal time; it mirrors the in-memory region table and lets a
//! reclaim walk sanity-check what it is reading.

use crc::{Crc, CRC_32_ISCSI};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{ENTRY_ALIGN, REGION_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::region::allocator::align_entry;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub(crate) const ENTRY_HEADER_SIZE: usize = 24;
pub(crate) const REGION_MAGIC: u32 = 0x4e52_4731; // "NRG1"

const FLAG_CHECKSUM: u16 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct EntryHeader {
    key_hash: U64,
    value_len: U32,
    key_len: U16,
    flags: U16,
    checksum: U32,
    hits: U32,
}

impl EntryHeader {
    zerocopy_getters! {
        value_len: u32,
        key_len: u16,
        checksum: u32,
    }

    pub(crate) fn key_hash(&self) -> u64 {
        self.key_hash.get()
    }

    pub(crate) fn checksummed(&self) -> bool {
        self.flags.get() & FLAG_CHECKSUM != 0
    }
}

const _: () = assert!(std::mem::size_of::<EntryHeader>() == ENTRY_HEADER_SIZE);
const _: () = assert!(ENTRY_HEADER_SIZE % ENTRY_ALIGN as usize == 0);

/// Total reserved length of an entry, aligned for the next one.
#[inline]
pub(crate) fn entry_len(key_len: usize, value_len: usize) -> u32 {
    align_entry((ENTRY_HEADER_SIZE + key_len + value_len) as u32)
}

pub(crate) fn checksum_payload(key: &[u8], value: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(key);
    digest.update(value);
    digest.finalize()
}

/// Serializes one entry into `buf`, which must hold `entry_len` bytes.
pub(crate) fn encode_entry(
    buf: &mut [u8],
    key_hash: u64,
    key: &[u8],
    value: &[u8],
    checksums: bool,
) {
    let header = EntryHeader {
        key_hash: U64::new(key_hash),
        value_len: U32::new(value.len() as u32),
        key_len: U16::new(key.len() as u16),
        flags: U16::new(if checksums { FLAG_CHECKSUM } else { 0 }),
        checksum: U32::new(if checksums {
            checksum_payload(key, value)
        } else {
            0
        }),
        hits: U32::new(0),
    };
    buf[..ENTRY_HEADER_SIZE].copy_from_slice(header.as_bytes());
    buf[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + key.len()].copy_from_slice(key);
    buf[ENTRY_HEADER_SIZE + key.len()..ENTRY_HEADER_SIZE + key.len() + value.len()]
        .copy_from_slice(value);
}

/// A parsed entry borrowing from region bytes.
pub(crate) struct ParsedEntry<'a> {
    pub header: EntryHeader,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl ParsedEntry<'_> {
    /// Verifies the optional payload checksum.
    pub(crate) fn verify_checksum(&self) -> Result<()> {
        if self.header.checksummed()
            && self.header.checksum() != checksum_payload(self.key, self.value)
        {
            return Err(Error::BadChecksum);
        }
        Ok(())
    }
}

/// Parses just the header at `buf[0]`, with the sanity checks that separate
/// an entry from never-written or stale bytes. Used by the read path to
/// size its second probe before the full entry is in memory.
pub(crate) fn parse_header(buf: &[u8]) -> Result<EntryHeader> {
    if buf.len() < ENTRY_HEADER_SIZE {
        return Err(Error::NotFound);
    }
    let header = EntryHeader::read_from_bytes(&buf[..ENTRY_HEADER_SIZE])
        .map_err(|_| Error::NotFound)?;
    let key_len = header.key_len() as usize;
    if key_len == 0 || key_len > crate::config::MAX_KEY_SIZE {
        return Err(Error::NotFound);
    }
    Ok(header)
}

/// Parses the entry starting at `buf[0]`. `NotFound` marks bytes that do not
/// look like an entry (never-written slot, torn region, stale data).
pub(crate) fn parse_entry(buf: &[u8]) -> Result<ParsedEntry<'_>> {
    let header = parse_header(buf)?;
    let key_len = header.key_len() as usize;
    let value_len = header.value_len() as usize;
    let end = ENTRY_HEADER_SIZE
        .checked_add(key_len)
        .and_then(|n| n.checked_add(value_len))
        .ok_or(Error::NotFound)?;
    if end > buf.len() {
        return Err(Error::NotFound);
    }
    Ok(ParsedEntry {
        header,
        key: &buf[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + key_len],
        value: &buf[ENTRY_HEADER_SIZE + key_len..end],
    })
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct RegionHeader {
    magic: U32,
    region_id: U32,
    generation: U32,
    size_class: U32,
    num_items: U32,
    bytes_used: U32,
    seal_epoch: U64,
}

impl RegionHeader {
    pub(crate) fn new(
        region_id: u32,
        generation: u32,
        size_class: Option<u32>,
        num_items: u32,
        bytes_used: u32,
        seal_epoch: u64,
    ) -> Self {
        Self {
            magic: U32::new(REGION_MAGIC),
            region_id: U32::new(region_id),
            generation: U32::new(generation),
            size_class: U32::new(size_class.unwrap_or(0)),
            num_items: U32::new(num_items),
            bytes_used: U32::new(bytes_used),
            seal_epoch: U64::new(seal_epoch),
        }
    }
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() <= REGION_HEADER_SIZE as usize);
