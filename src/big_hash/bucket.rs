//! On-device bucket layout.
//!
//! A bucket is one `bucket_size` record, rewritten whole by a single
//! aligned device write. That write is the atomicity unit of Big Hash:
//!
//! ```text
//! +---------+---------+---- ... ----+---------+----------------+
//! | entry 0 | entry 1 |             | padding | trailer (24 B) |
//! +---------+---------+---- ... ----+---------+----------------+
//!   oldest → newest                            checksum, epoch,
//!                                              generation, count
//! ```
//!
//! Entries sit oldest-first, so overflow eviction pops from the front and
//! lookups scan from the back (newest wins). The trailer checksum covers
//! the entry bytes and the trailer fields; a mismatch (a torn write, a
//! never-written bucket, garbage from a previous cache life) parses as an
//! empty bucket. The `epoch` field ties a bucket to one cache life: cold
//! start picks a fresh epoch, instantly orphaning every bucket written
//! before it.

use crc::{Crc, CRC_32_ISCSI};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{BUCKET_TRAILER_SIZE, ENTRY_ALIGN};
use crate::region::allocator::align_entry;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub(crate) const BUCKET_MAGIC: u32 = 0x4e42_4b31; // "NBK1"
pub(crate) const BUCKET_ENTRY_HEADER_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct BucketEntryHeader {
    key_hash: U64,
    key_len: U16,
    value_len: U16,
    _reserved: U32,
}

const _: () = assert!(std::mem::size_of::<BucketEntryHeader>() == BUCKET_ENTRY_HEADER_SIZE);
const _: () = assert!(BUCKET_ENTRY_HEADER_SIZE % ENTRY_ALIGN as usize == 0);

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct BucketTrailer {
    data_len: U32,
    num_entries: U32,
    epoch: U32,
    generation: U32,
    checksum: U32,
    magic: U32,
}

impl BucketTrailer {
    zerocopy_getters! {
        data_len: u32,
        num_entries: u32,
        epoch: u32,
        generation: u32,
        magic: u32,
    }

    zerocopy_accessors! {
        checksum: u32,
    }
}

const _: () = assert!(std::mem::size_of::<BucketTrailer>() == BUCKET_TRAILER_SIZE as usize);

fn trailer_checksum(data: &[u8], trailer: &BucketTrailer) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(data);
    digest.update(&trailer.data_len().to_le_bytes());
    digest.update(&trailer.num_entries().to_le_bytes());
    digest.update(&trailer.epoch().to_le_bytes());
    digest.update(&trailer.generation().to_le_bytes());
    digest.update(&trailer.magic().to_le_bytes());
    digest.finalize()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BucketEntry {
    pub key_hash: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BucketEntry {
    pub(crate) fn wire_len(&self) -> usize {
        align_entry((BUCKET_ENTRY_HEADER_SIZE + self.key.len() + self.value.len()) as u32)
            as usize
    }
}

/// Parsed, mutable image of one bucket. Entries are ordered oldest-first.
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    pub entries: Vec<BucketEntry>,
    pub generation: u32,
}

/// Bytes available for entries in a `bucket_size` bucket. Saturating, so
/// configuration validation can compare against it before rejecting a
/// bucket size too small to hold anything.
#[inline]
pub(crate) fn bucket_capacity(bucket_size: u64) -> usize {
    (bucket_size as usize).saturating_sub(BUCKET_TRAILER_SIZE as usize)
}

impl Bucket {
    /// Parses a raw bucket. Anything that does not validate (bad magic,
    /// wrong epoch, failed checksum, inconsistent lengths) yields an empty
    /// bucket; the caller logs the cases it cares about.
    pub(crate) fn parse(buf: &[u8], epoch: u32) -> Self {
        let trailer_at = buf.len() - BUCKET_TRAILER_SIZE as usize;
        let Ok(trailer) = BucketTrailer::read_from_bytes(&buf[trailer_at..]) else {
            return Self::default();
        };
        if trailer.magic() != BUCKET_MAGIC || trailer.epoch() != epoch {
            return Self::default();
        }
        let data_len = trailer.data_len() as usize;
        if data_len > trailer_at {
            return Self::default();
        }
        if trailer_checksum(&buf[..data_len], &trailer) != trailer.checksum() {
            return Self::default();
        }

        let mut entries = Vec::with_capacity(trailer.num_entries() as usize);
        let mut cursor = 0usize;
        for _ in 0..trailer.num_entries() {
            if cursor + BUCKET_ENTRY_HEADER_SIZE > data_len {
                break;
            }
            let Ok(header) = BucketEntryHeader::read_from_bytes(
                &buf[cursor..cursor + BUCKET_ENTRY_HEADER_SIZE],
            ) else {
                break;
            };
            let key_len = header.key_len.get() as usize;
            let value_len = header.value_len.get() as usize;
            let end = cursor + BUCKET_ENTRY_HEADER_SIZE + key_len + value_len;
            if key_len == 0 || end > data_len {
                break;
            }
            let key_start = cursor + BUCKET_ENTRY_HEADER_SIZE;
            entries.push(BucketEntry {
                key_hash: header.key_hash.get(),
                key: buf[key_start..key_start + key_len].to_vec(),
                value: buf[key_start + key_len..end].to_vec(),
            });
            cursor += align_entry((BUCKET_ENTRY_HEADER_SIZE + key_len + value_len) as u32)
                as usize;
        }

        Self {
            entries,
            generation: trailer.generation(),
        }
    }

    /// Serializes into a zeroed `bucket_size` buffer. The caller bumps
    /// `generation` before rewriting a bucket.
    pub(crate) fn serialize(&self, buf: &mut [u8], epoch: u32) {
        buf.fill(0);
        let trailer_at = buf.len() - BUCKET_TRAILER_SIZE as usize;
        let mut cursor = 0usize;
        for entry in &self.entries {
            let header = BucketEntryHeader {
                key_hash: U64::new(entry.key_hash),
                key_len: U16::new(entry.key.len() as u16),
                value_len: U16::new(entry.value.len() as u16),
                _reserved: U32::new(0),
            };
            buf[cursor..cursor + BUCKET_ENTRY_HEADER_SIZE].copy_from_slice(header.as_bytes());
            let key_start = cursor + BUCKET_ENTRY_HEADER_SIZE;
            buf[key_start..key_start + entry.key.len()].copy_from_slice(&entry.key);
            buf[key_start + entry.key.len()..key_start + entry.key.len() + entry.value.len()]
                .copy_from_slice(&entry.value);
            cursor += entry.wire_len();
        }

        let mut trailer = BucketTrailer {
            data_len: U32::new(cursor as u32),
            num_entries: U32::new(self.entries.len() as u32),
            epoch: U32::new(epoch),
            generation: U32::new(self.generation),
            checksum: U32::new(0),
            magic: U32::new(BUCKET_MAGIC),
        };
        trailer.set_checksum(trailer_checksum(&buf[..cursor], &trailer));
        buf[trailer_at..].copy_from_slice(trailer.as_bytes());
    }

    fn used(&self) -> usize {
        self.entries.iter().map(BucketEntry::wire_len).sum()
    }

    /// Newest-first match on `(hash, key)`.
    pub(crate) fn find(&self, key_hash: u64, key: &[u8]) -> Option<&BucketEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key_hash == key_hash && e.key == key)
    }

    pub(crate) fn remove(&mut self, key_hash: u64, key: &[u8]) -> Option<BucketEntry> {
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.key_hash == key_hash && e.key == key)?;
        Some(self.entries.remove(pos))
    }

    /// Appends `entry`, first removing any previous version of the key,
    /// then evicting oldest entries until everything fits in `capacity`.
    /// Returns `(replaced_same_key, evicted_oldest)`.
    pub(crate) fn insert(
        &mut self,
        entry: BucketEntry,
        capacity: usize,
    ) -> (Option<BucketEntry>, Vec<BucketEntry>) {
        let replaced = self.remove(entry.key_hash, &entry.key);
        let mut evicted = Vec::new();
        let needed = entry.wire_len();
        while self.used() + needed > capacity && !self.entries.is_empty() {
            evicted.push(self.entries.remove(0));
        }
        self.entries.push(entry);
        (replaced, evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_key;

    const BUCKET_SIZE: u64 = 4096;

    fn entry(key: &str, value_len: usize) -> BucketEntry {
        BucketEntry {
            key_hash: hash_key(key.as_bytes()),
            key: key.as_bytes().to_vec(),
            value: vec![0x5a; value_len],
        }
    }

    #[test]
    fn serialize_parse_round_trip() {
        let mut bucket = Bucket::default();
        bucket.insert(entry("a", 100), bucket_capacity(BUCKET_SIZE));
        bucket.insert(entry("b", 200), bucket_capacity(BUCKET_SIZE));
        bucket.generation = 7;

        let mut buf = vec![0u8; BUCKET_SIZE as usize];
        bucket.serialize(&mut buf, 42);

        let parsed = Bucket::parse(&buf, 42);
        assert_eq!(parsed.generation, 7);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.find(hash_key(b"b"), b"b").unwrap().value.len(), 200);
    }

    #[test]
    fn wrong_epoch_parses_empty() {
        let mut bucket = Bucket::default();
        bucket.insert(entry("a", 10), bucket_capacity(BUCKET_SIZE));
        let mut buf = vec![0u8; BUCKET_SIZE as usize];
        bucket.serialize(&mut buf, 1);

        assert!(Bucket::parse(&buf, 2).entries.is_empty());
    }

    #[test]
    fn torn_write_parses_empty() {
        let mut bucket = Bucket::default();
        bucket.insert(entry("a", 50), bucket_capacity(BUCKET_SIZE));
        let mut buf = vec![0u8; BUCKET_SIZE as usize];
        bucket.serialize(&mut buf, 1);

        buf[10] ^= 0xff;
        assert!(Bucket::parse(&buf, 1).entries.is_empty());
    }

    #[test]
    fn zeroed_bucket_parses_empty() {
        let buf = vec![0u8; BUCKET_SIZE as usize];
        assert!(Bucket::parse(&buf, 1).entries.is_empty());
    }

    #[test]
    fn newest_entry_wins_lookup() {
        let mut bucket = Bucket::default();
        bucket.insert(entry("k", 10), bucket_capacity(BUCKET_SIZE));
        let mut newer = entry("k", 20);
        newer.value = vec![9; 20];
        let (replaced, evicted) = bucket.insert(newer, bucket_capacity(BUCKET_SIZE));

        assert!(replaced.is_some());
        assert!(evicted.is_empty());
        assert_eq!(bucket.entries.len(), 1);
        assert_eq!(bucket.find(hash_key(b"k"), b"k").unwrap().value, vec![9; 20]);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let capacity = bucket_capacity(BUCKET_SIZE);
        let mut bucket = Bucket::default();
        // Each entry occupies align8(16 + 4 + 780) = 800 bytes; five fit in
        // 4072, the sixth forces the oldest out.
        for i in 0..5 {
            let (_, evicted) = bucket.insert(entry(&format!("k{i:03}"), 780), capacity);
            assert!(evicted.is_empty());
        }
        let (_, evicted) = bucket.insert(entry("k005", 780), capacity);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, b"k000");
        assert!(bucket.find(hash_key(b"k001"), b"k001").is_some());
    }
}
