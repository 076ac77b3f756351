//! Persist/recover round trips on a file device: a fresh process with the
//! same configuration sees every key persisted before shutdown; a changed
//! geometry invalidates the fingerprint and cold-starts with zero hits.

use std::path::PathBuf;
use std::sync::Arc;

use navycache::{
    BigHashConfig, BlockCacheConfig, CacheConfig, FileDevice, FileDeviceConfig, MemoryDevice,
};

const DEVICE_SIZE: u64 = 64 << 20;
const METADATA_SIZE: u64 = 4 << 20;
const ITEMS: usize = 200;

fn open_device(path: PathBuf, truncate: bool) -> Arc<FileDevice> {
    Arc::new(
        FileDevice::open(
            FileDeviceConfig::new(vec![path], DEVICE_SIZE).truncate(truncate),
        )
        .unwrap(),
    )
}

fn build(device: Arc<FileDevice>, region_size: u64) -> navycache::Cache {
    CacheConfig::new(device)
        .metadata_size(METADATA_SIZE)
        .block_cache(BlockCacheConfig::new(
            METADATA_SIZE,
            DEVICE_SIZE - METADATA_SIZE,
            region_size,
        ))
        .build()
        .unwrap()
}

fn value(i: usize) -> Vec<u8> {
    vec![(i % 251) as u8; 4096 + i]
}

#[test]
fn same_config_recovers_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.bin");

    {
        let cache = build(open_device(path.clone(), true), 1 << 20);
        assert!(!cache.recover().unwrap(), "fresh device must cold-start");
        for i in 0..ITEMS {
            cache.insert(format!("k{i}").as_bytes(), &value(i)).unwrap();
        }
        cache.persist().unwrap();
        cache.shutdown();
    }

    {
        let cache = build(open_device(path, false), 1 << 20);
        assert!(cache.recover().unwrap(), "expected a warm start");
        for i in 0..ITEMS {
            assert_eq!(
                cache.lookup(format!("k{i}").as_bytes()).unwrap(),
                value(i),
                "k{i} lost across restart"
            );
        }
        cache.shutdown();
    }
}

#[test]
fn altered_region_size_cold_starts_with_zero_hits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.bin");

    {
        let cache = build(open_device(path.clone(), true), 1 << 20);
        cache.recover().unwrap();
        for i in 0..ITEMS {
            cache.insert(format!("k{i}").as_bytes(), &value(i)).unwrap();
        }
        cache.persist().unwrap();
        cache.shutdown();
    }

    {
        // Same device, doubled region size: the fingerprint mismatch must
        // wipe the in-memory state.
        let cache = build(open_device(path, false), 2 << 20);
        assert!(!cache.recover().unwrap(), "expected a cold start");
        for i in 0..ITEMS {
            assert!(
                cache
                    .lookup(format!("k{i}").as_bytes())
                    .unwrap_err()
                    .is_not_found(),
                "k{i} resurrected after a cold start"
            );
        }
        cache.shutdown();
    }
}

#[test]
fn big_hash_state_survives_recovery() {
    let device = Arc::new(MemoryDevice::new(32 << 20));
    let config = || {
        CacheConfig::new(Arc::clone(&device) as Arc<dyn navycache::Device>)
            .metadata_size(1 << 20)
            .big_hash(
                BigHashConfig::new(1 << 20, 16 << 20, 4096).bloom_filter(4, 2048),
                2048,
            )
    };

    let first = config().build().unwrap();
    first.recover().unwrap();
    for i in 0..100usize {
        first
            .insert(format!("small-{i}").as_bytes(), &vec![7u8; 300])
            .unwrap();
    }
    first.persist().unwrap();
    first.shutdown();

    // Same underlying memory device stands in for a reopened process.
    let second = config().build().unwrap();
    assert!(second.recover().unwrap());
    for i in 0..100usize {
        assert_eq!(
            second.lookup(format!("small-{i}").as_bytes()).unwrap(),
            vec![7u8; 300]
        );
    }
    second.shutdown();
}
