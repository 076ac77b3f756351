//! Size-based routing across the two engines. A same-key overwrite whose
//! value crosses the small-item threshold changes engines; the copy left in
//! the previous engine must be removed (with a `Removed` destructor event)
//! so that lookups always see the newest value.

use std::sync::Arc;

use navycache::{
    BigHashConfig, BlockCacheConfig, CacheConfig, DestructorCallback, DestructorEvent,
    MemoryDevice,
};
use parking_lot::Mutex;

const SMALL_MAX: u64 = 2048;

type EventLog = Arc<Mutex<Vec<(Vec<u8>, DestructorEvent)>>>;

fn two_engine_cache() -> (navycache::Cache, EventLog) {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: DestructorCallback = Arc::new(move |key, _value, event| {
        sink.lock().push((key.to_vec(), event));
    });

    let device = Arc::new(MemoryDevice::new(64 << 20));
    let cache = CacheConfig::new(device)
        .block_cache(BlockCacheConfig::new(0, 32 << 20, 1 << 20))
        .big_hash(
            BigHashConfig::new(32 << 20, 16 << 20, 4096).bloom_filter(4, 2048),
            SMALL_MAX,
        )
        .destructor_callback(callback)
        .build()
        .unwrap();
    (cache, events)
}

fn removed_count(events: &EventLog, key: &[u8]) -> usize {
    events
        .lock()
        .iter()
        .filter(|(k, e)| k == key && *e == DestructorEvent::Removed)
        .count()
}

#[test]
fn overwrite_across_engines_keeps_one_live_copy() {
    let (cache, events) = two_engine_cache();

    // Large value routes to the block cache.
    cache.insert(b"k", &vec![b'L'; 8000]).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.lookup(b"k").unwrap(), vec![b'L'; 8000]);

    // Small overwrite routes to big hash; the block-cache copy must not
    // shadow it once the pending parcel drains.
    cache.insert(b"k", &vec![b's'; 200]).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.lookup(b"k").unwrap(), vec![b's'; 200]);
    assert_eq!(removed_count(&events, b"k"), 1, "displaced large copy");

    // And back: a large overwrite displaces the big-hash copy.
    cache.insert(b"k", &vec![b'G'; 9000]).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.lookup(b"k").unwrap(), vec![b'G'; 9000]);
    assert_eq!(removed_count(&events, b"k"), 2, "displaced small copy");

    // Explicit remove closes the last copy's lifecycle.
    cache.remove(b"k").unwrap();
    assert!(cache.lookup(b"k").unwrap_err().is_not_found());
    assert_eq!(removed_count(&events, b"k"), 3);
    assert!(cache.remove(b"k").unwrap_err().is_not_found());

    cache.shutdown();
}

#[test]
fn same_engine_overwrites_are_unaffected() {
    let (cache, events) = two_engine_cache();

    cache.insert(b"small", &vec![1u8; 100]).unwrap();
    cache.insert(b"small", &vec![2u8; 150]).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.lookup(b"small").unwrap(), vec![2u8; 150]);
    assert_eq!(removed_count(&events, b"small"), 1);

    cache.insert(b"large", &vec![3u8; 5000]).unwrap();
    cache.insert(b"large", &vec![4u8; 6000]).unwrap();
    cache.flush().unwrap();
    assert_eq!(cache.lookup(b"large").unwrap(), vec![4u8; 6000]);
    assert_eq!(removed_count(&events, b"large"), 1);

    cache.shutdown();
}
