//! End-to-end block-cache coverage on a real file device: a thousand
//! medium-sized inserts followed by a full readback, exercising the write
//! pipeline, region seal/flush, and both the buffered and on-device read
//! paths.

use std::sync::Arc;

use navycache::{BlockCacheConfig, CacheConfig, FileDevice, FileDeviceConfig};

#[test]
fn thousand_inserts_all_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(
        FileDevice::open(
            FileDeviceConfig::new(vec![dir.path().join("cache.bin")], 64 << 20)
                .block_size(4096),
        )
        .unwrap(),
    );

    let cache = CacheConfig::new(device)
        .block_cache(BlockCacheConfig::new(0, 64 << 20, 1 << 20))
        .max_concurrent_inserts(8192)
        .build()
        .unwrap();

    for i in 0..1000usize {
        let key = format!("k{i}");
        let value = vec![b'a'; 4096 + i];
        cache.insert(key.as_bytes(), &value).unwrap();
    }
    cache.flush().unwrap();

    for i in 0..1000usize {
        let key = format!("k{i}");
        let value = cache.lookup(key.as_bytes()).unwrap();
        assert_eq!(value.len(), 4096 + i, "{key} came back the wrong size");
        assert!(value.iter().all(|&b| b == b'a'), "{key} corrupted");
    }

    cache.shutdown();
}

#[test]
fn lookups_are_read_your_writes_before_flush() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(
        FileDevice::open(FileDeviceConfig::new(
            vec![dir.path().join("cache.bin")],
            16 << 20,
        ))
        .unwrap(),
    );
    let cache = CacheConfig::new(device)
        .block_cache(BlockCacheConfig::new(0, 16 << 20, 1 << 20))
        .build()
        .unwrap();

    // No flush, no drain: the insert must be visible immediately after the
    // call returns.
    cache.insert(b"immediate", b"value-1").unwrap();
    assert_eq!(cache.lookup(b"immediate").unwrap(), b"value-1");

    cache.insert(b"immediate", b"value-2").unwrap();
    assert_eq!(cache.lookup(b"immediate").unwrap(), b"value-2");

    cache.shutdown();
}

#[test]
fn remove_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(
        FileDevice::open(FileDeviceConfig::new(
            vec![dir.path().join("cache.bin")],
            16 << 20,
        ))
        .unwrap(),
    );
    let cache = CacheConfig::new(device)
        .block_cache(BlockCacheConfig::new(0, 16 << 20, 1 << 20))
        .build()
        .unwrap();

    cache.insert(b"gone", &vec![1u8; 3000]).unwrap();
    assert!(cache.remove(b"gone").is_ok());
    assert!(cache.remove(b"gone").unwrap_err().is_not_found());
    assert!(cache.lookup(b"gone").unwrap_err().is_not_found());

    cache.shutdown();
}
