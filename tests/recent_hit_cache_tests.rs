//! Tests for the in-process recent-hit cache.
//!
//! Tests verify:
//! - Capacity enforcement and eviction triggers
//! - Entries closest to expiry are evicted first
//! - Expired entries are swept before live ones are evicted
//! - TTL expiry and re-initialisation
//! - Atomic increments under concurrent access

use chrono::{TimeZone, Utc};
use feature_usage::{LocalHitCache, ManualClock, RecentHitCache};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 7, 26, 12, 0, 0).unwrap(),
    ))
}

// ============================================================================
// BASIC FUNCTIONALITY TESTS
// ============================================================================

#[test]
fn test_add_and_get() {
    let cache = LocalHitCache::with_capacity(100, clock());

    assert!(cache.add("recent-hits:f1:abc:20240726", 0, HOUR).unwrap());
    assert!(cache.contains("recent-hits:f1:abc:20240726"));
    assert_eq!(cache.get("recent-hits:f1:abc:20240726").unwrap(), Some(0));
}

#[test]
fn test_remove_and_clear() {
    let cache = LocalHitCache::with_capacity(100, clock());

    for i in 0..5 {
        cache.add(&format!("key-{}", i), i, HOUR).unwrap();
    }
    assert_eq!(cache.stats().entries, 5);

    cache.remove("key-2");
    assert_eq!(cache.stats().entries, 4);
    assert!(!cache.contains("key-2"));

    cache.clear();
    assert_eq!(cache.stats().entries, 0);
    assert!(!cache.contains("key-0"));
}

#[test]
fn test_hit_and_miss_counters() {
    let cache = LocalHitCache::with_capacity(100, clock());
    cache.add("present", 3, HOUR).unwrap();

    cache.get("present").unwrap();
    cache.get("present").unwrap();
    cache.get("absent").unwrap();

    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
}

// ============================================================================
// CAPACITY AND EVICTION TESTS
// ============================================================================

#[test]
fn test_capacity_enforcement() {
    let cache = LocalHitCache::with_capacity(10, clock());

    for i in 0..10 {
        assert!(cache.add(&format!("key-{}", i), 1, HOUR).unwrap());
    }

    let stats = cache.stats();
    assert_eq!(stats.entries, 10, "Cache should be exactly at capacity");
    assert_eq!(stats.total_evictions, 0, "No eviction should have occurred yet");

    cache.incr_with_init("key-10", HOUR, 1, 1).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.entries, 10, "Cache should remain at capacity after eviction");
    assert_eq!(stats.total_evictions, 1);
}

#[test]
fn test_evicts_closest_to_expiry() {
    let clock = clock();
    let cache = LocalHitCache::with_capacity(3, clock.clone());

    for i in 0..3 {
        cache.add(&format!("key-{}", i), 1, HOUR).unwrap();
        clock.advance(chrono::Duration::seconds(10));
    }

    // Increments keep the original expiry, so key-0 stays the oldest
    cache.incr_with_init("key-0", HOUR, 1, 1).unwrap();
    cache.add("key-3", 1, HOUR).unwrap();

    assert!(!cache.contains("key-0"), "Entry closest to expiry should go first");
    assert!(cache.contains("key-1"));
    assert!(cache.contains("key-3"));
}

#[test]
fn test_expired_entries_swept_before_eviction() {
    let clock = clock();
    let cache = LocalHitCache::with_capacity(3, clock.clone());

    cache.add("short-0", 1, Duration::from_secs(5)).unwrap();
    cache.add("short-1", 1, Duration::from_secs(5)).unwrap();
    cache.add("long", 1, HOUR).unwrap();

    clock.advance(chrono::Duration::seconds(6));
    cache.add("new", 1, HOUR).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.total_evictions, 0, "Expired entries are not evictions");
    assert!(cache.contains("long"));
}

// ============================================================================
// TTL TESTS
// ============================================================================

#[test]
fn test_expired_entry_reads_as_absent() {
    let clock = clock();
    let cache = LocalHitCache::with_capacity(10, clock.clone());

    cache.add("k", 42, Duration::from_secs(60)).unwrap();
    clock.advance(chrono::Duration::seconds(59));
    assert_eq!(cache.get("k").unwrap(), Some(42));

    clock.advance(chrono::Duration::seconds(1));
    assert_eq!(cache.get("k").unwrap(), None);

    // An expired entry can be added again
    assert!(cache.add("k", 7, HOUR).unwrap());
    assert_eq!(cache.get("k").unwrap(), Some(7));
}

#[test]
fn test_incr_reinitialises_after_expiry() {
    let clock = clock();
    let cache = LocalHitCache::with_capacity(10, clock.clone());

    assert_eq!(cache.incr_with_init("k", Duration::from_secs(60), 10, 10).unwrap(), 10);
    assert_eq!(cache.incr_with_init("k", Duration::from_secs(60), 10, 10).unwrap(), 20);

    clock.advance(chrono::Duration::seconds(61));
    assert_eq!(cache.incr_with_init("k", Duration::from_secs(60), 1, 1).unwrap(), 1);
}

// ============================================================================
// CONCURRENCY TESTS
// ============================================================================

#[test]
fn test_concurrent_increments_are_atomic() {
    let cache = Arc::new(LocalHitCache::with_capacity(100, clock()));
    let num_threads = 10;
    let increments_per_thread = 500;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..increments_per_thread {
                    cache.incr_with_init("shared", HOUR, 1, 1).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        cache.get("shared").unwrap(),
        Some((num_threads * increments_per_thread) as u64)
    );
}

#[test]
fn test_concurrent_add_has_single_winner() {
    let cache = Arc::new(LocalHitCache::with_capacity(100, clock()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.add("contended", i, HOUR).unwrap())
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|stored| *stored)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn test_concurrent_access_respects_capacity() {
    let cache = Arc::new(LocalHitCache::with_capacity(50, clock()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("thread-{}-key-{}", t, i);
                    cache.incr_with_init(&key, HOUR, 1, 1).unwrap();
                    let _ = cache.get(&key);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.entries <= 50, "Cache exceeded capacity: {}", stats.entries);
    assert_eq!(stats.total_evictions, 400 - 50);
}
