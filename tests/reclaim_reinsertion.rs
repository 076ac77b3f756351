//! Reclaim under memory pressure with hits-based reinsertion: items read at
//! least twice survive region recycling by being copied forward; cold items
//! are dropped with exactly one `Recycled` event each.

use std::sync::Arc;

use navycache::{
    BlockCacheConfig, CacheConfig, DestructorCallback, DestructorEvent, MemoryDevice,
    ReinsertionConfig,
};
use parking_lot::Mutex;

const COLD_ITEMS: usize = 100;
const HOT_ITEMS: usize = 8;
const VALUE_LEN: usize = 100 << 10;

#[test]
fn hot_items_survive_three_reclaim_waves() {
    let events: Arc<Mutex<Vec<(Vec<u8>, DestructorEvent)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: DestructorCallback = Arc::new(move |key, _value, event| {
        sink.lock().push((key.to_vec(), event));
    });

    // Four 1 MiB regions hold ~40 of these items; 100 cold inserts force
    // several reclaim waves.
    let device = Arc::new(MemoryDevice::new(4 << 20));
    let cache = CacheConfig::new(device)
        .block_cache(
            BlockCacheConfig::new(0, 4 << 20, 1 << 20)
                .reinsertion(ReinsertionConfig::Hits { threshold: 2 }),
        )
        .destructor_callback(callback)
        .build()
        .unwrap();

    for i in 0..HOT_ITEMS {
        let key = format!("hot-{i}");
        cache.insert(key.as_bytes(), &vec![b'h'; VALUE_LEN]).unwrap();
    }
    cache.flush().unwrap();

    let warm_hot = |cache: &navycache::Cache| {
        for i in 0..HOT_ITEMS {
            let key = format!("hot-{i}");
            cache.lookup(key.as_bytes()).unwrap();
            cache.lookup(key.as_bytes()).unwrap();
        }
    };
    warm_hot(&cache);

    for i in 0..COLD_ITEMS {
        let key = format!("cold-{i:03}");
        cache.insert(key.as_bytes(), &vec![b'c'; VALUE_LEN]).unwrap();
        // Keep the hot set at two-or-more reads between any two reclaim
        // waves so the reinsertion threshold always holds for it.
        if i % 5 == 4 {
            cache.flush().unwrap();
            warm_hot(&cache);
        }
    }
    cache.flush().unwrap();

    // Every hot item survived every wave.
    for i in 0..HOT_ITEMS {
        let key = format!("hot-{i}");
        assert_eq!(
            cache.lookup(key.as_bytes()).unwrap(),
            vec![b'h'; VALUE_LEN],
            "{key} was lost to reclaim"
        );
    }

    let events = events.lock();
    assert!(
        !events.iter().any(|(k, _)| k.starts_with(b"hot-")),
        "a hot item was dropped instead of reinserted"
    );

    // Cold items churned hard: at least three regions' worth of drops, each
    // dropped key exactly once, and dropped keys really miss.
    let recycled: Vec<&Vec<u8>> = events
        .iter()
        .filter(|(_, e)| *e == DestructorEvent::Recycled)
        .map(|(k, _)| k)
        .collect();
    assert!(
        recycled.len() >= 27,
        "expected at least three reclaimed regions of cold items, saw {}",
        recycled.len()
    );
    for i in 0..COLD_ITEMS {
        let key = format!("cold-{i:03}");
        let drops = recycled.iter().filter(|k| ***k == key.as_bytes().to_vec()).count();
        let readable = cache.lookup(key.as_bytes()).is_ok();
        assert!(
            (drops == 1 && !readable) || (drops == 0 && readable),
            "{key}: drops={drops}, readable={readable}"
        );
    }

    cache.shutdown();
}
