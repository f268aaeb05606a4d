use super::*;

fn sample_meta(start: i64, end: i64) -> ChunkMetadata {
    ChunkMetadata {
        offset: 0,
        compressed_size: 100,
        uncompressed_size: 400,
        start_time: start,
        end_time: end,
        point_count: (end - start) as u64,
        data_type: 1,
    }
}

#[test]
fn insert_then_get_hits() {
    let cache = MetadataCache::new(1024 * 1024);
    let key = CacheKey::new("a.tsfile", "root.v.d0", "s0");
    cache.insert(key.clone(), vec![sample_meta(0, 100)]);

    assert_eq!(cache.get(&key), Some(vec![sample_meta(0, 100)]));
    let snap = cache.metrics_snapshot();
    assert_eq!(snap.hits, 1);
    assert_eq!(snap.inserts, 1);
}

#[test]
fn miss_on_unseen_key_bumps_misses() {
    let cache = MetadataCache::new(1024 * 1024);
    let key = CacheKey::new("a.tsfile", "root.v.d0", "s0");
    assert_eq!(cache.get(&key), None);
    assert_eq!(cache.metrics_snapshot().misses, 1);
}

#[test]
fn disabling_cache_clears_and_blocks_lookups() {
    let cache = MetadataCache::new(1024 * 1024);
    let key = CacheKey::new("a.tsfile", "root.v.d0", "s0");
    cache.insert(key.clone(), vec![sample_meta(0, 100)]);
    assert!(cache.get(&key).is_some());

    cache.set_enabled(false);
    assert!(cache.is_empty());
    assert_eq!(cache.get(&key), None);

    // re-enabling does not resurrect evicted entries
    cache.set_enabled(true);
    assert_eq!(cache.get(&key), None);
}

#[test]
fn get_or_insert_with_calls_fetch_only_on_miss() {
    let cache = MetadataCache::new(1024 * 1024);
    let key = CacheKey::new("a.tsfile", "root.v.d0", "s0");
    let mut fetch_calls = 0;

    let first: Result<Vec<ChunkMetadata>, ()> = cache.get_or_insert_with(key.clone(), || {
        fetch_calls += 1;
        Ok(vec![sample_meta(0, 100)])
    });
    assert!(first.is_ok());
    assert_eq!(fetch_calls, 1);

    let second: Result<Vec<ChunkMetadata>, ()> = cache.get_or_insert_with(key.clone(), || {
        fetch_calls += 1;
        Ok(vec![sample_meta(0, 100)])
    });
    assert!(second.is_ok());
    assert_eq!(fetch_calls, 1, "second lookup must hit the cache, not refetch");
}

#[test]
fn get_or_insert_with_propagates_fetch_error_without_caching() {
    let cache = MetadataCache::new(1024 * 1024);
    let key = CacheKey::new("a.tsfile", "root.v.d0", "s0");

    let result: Result<Vec<ChunkMetadata>, &'static str> =
        cache.get_or_insert_with(key.clone(), || Err("disk read failed"));
    assert_eq!(result, Err("disk read failed"));
    assert_eq!(cache.get(&key), None);
}

#[test]
fn remove_for_file_drops_only_that_files_entries() {
    let cache = MetadataCache::new(1024 * 1024);
    let a = CacheKey::new("a.tsfile", "root.v.d0", "s0");
    let b = CacheKey::new("b.tsfile", "root.v.d0", "s0");
    cache.insert(a.clone(), vec![sample_meta(0, 10)]);
    cache.insert(b.clone(), vec![sample_meta(0, 10)]);

    cache.remove_for_file(std::path::Path::new("a.tsfile"));

    assert_eq!(cache.get(&a), None);
    assert!(cache.get(&b).is_some());
}

#[test]
fn clear_empties_the_cache() {
    let cache = MetadataCache::new(1024 * 1024);
    cache.insert(CacheKey::new("a.tsfile", "root.v.d0", "s0"), vec![sample_meta(0, 10)]);
    cache.insert(CacheKey::new("b.tsfile", "root.v.d0", "s0"), vec![sample_meta(0, 10)]);
    assert_eq!(cache.len(), 2);

    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn distinct_devices_and_measurements_are_distinct_keys() {
    let cache = MetadataCache::new(1024 * 1024);
    let k1 = CacheKey::new("a.tsfile", "root.v.d0", "s0");
    let k2 = CacheKey::new("a.tsfile", "root.v.d0", "s1");
    let k3 = CacheKey::new("a.tsfile", "root.v.d1", "s0");

    cache.insert(k1.clone(), vec![sample_meta(0, 1)]);
    cache.insert(k2.clone(), vec![sample_meta(0, 2)]);
    cache.insert(k3.clone(), vec![sample_meta(0, 3)]);

    assert_eq!(cache.get(&k1), Some(vec![sample_meta(0, 1)]));
    assert_eq!(cache.get(&k2), Some(vec![sample_meta(0, 2)]));
    assert_eq!(cache.get(&k3), Some(vec![sample_meta(0, 3)]));
}

#[test]
fn bloom_disabled_still_allows_lookups() {
    let cache = MetadataCache::with_config(CacheConfig {
        budget_bytes: 1024 * 1024,
        bloom_enabled: false,
        expected_keys: 100,
    });
    let key = CacheKey::new("a.tsfile", "root.v.d0", "s0");
    cache.insert(key.clone(), vec![sample_meta(0, 10)]);
    assert_eq!(cache.get(&key), Some(vec![sample_meta(0, 10)]));
}

#[test]
fn insert_many_entries_triggers_capacity_resample_without_panicking() {
    let cache = MetadataCache::new(4096);
    for i in 0..200_001u32 {
        let key = CacheKey::new(format!("f{i}.tsfile"), "root.v.d0", "s0");
        cache.insert(key, vec![sample_meta(0, 10)]);
    }
    assert!(cache.metrics_snapshot().resamples >= 2);
}

#[test]
fn multi_chunk_series_is_cached_as_a_list() {
    let cache = MetadataCache::new(1024 * 1024);
    let key = CacheKey::new("a.tsfile", "root.v.d0", "s0");
    let chunks = vec![sample_meta(0, 10), sample_meta(11, 20), sample_meta(21, 30)];
    cache.insert(key.clone(), chunks.clone());
    assert_eq!(cache.get(&key), Some(chunks));
}
