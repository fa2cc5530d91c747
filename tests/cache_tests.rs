//! Integration tests for the cache store and cache keys.

use integrations_resilience::{CacheConfig, CacheKeyBuilder, CacheStore, RequestFingerprint};
use pretty_assertions::{assert_eq, assert_ne};
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct ModelSettings {
    model: &'static str,
    temperature: f64,
}

fn store(max_size: usize) -> CacheStore<String> {
    CacheStore::new(CacheConfig {
        max_size,
        ..CacheConfig::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_entry_expires_after_ttl() {
    // Arrange
    let cache = store(100);
    cache.set("insights:k", "cached answer".to_string(), Some(Duration::from_secs(1)));
    assert_eq!(cache.get("insights:k").as_deref(), Some("cached answer"));

    // Act
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let after_expiry = cache.get("insights:k");

    // Assert
    assert_eq!(after_expiry, None);
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.hit_rate, 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_capacity_evicts_oldest_access() {
    let cache = store(3);
    for key in ["a", "b", "c"] {
        cache.set(key, key.to_uppercase(), None);
        tokio::time::advance(Duration::from_millis(5)).await;
    }
    // touching "a" makes "b" the least recently used
    cache.get("a");

    cache.set("d", "D".to_string(), None);

    assert_eq!(cache.len(), 3);
    assert!(cache.has("a"));
    assert!(!cache.has("b"));
    assert!(cache.has("c"));
    assert!(cache.has("d"));
}

#[tokio::test(start_paused = true)]
async fn test_default_ttl_applies() {
    let cache = CacheStore::new(CacheConfig {
        default_ttl: Duration::from_secs(10),
        ..CacheConfig::default()
    });
    cache.set("k", 1u8, None);

    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(cache.has("k"));
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!cache.has("k"));
}

#[tokio::test(start_paused = true)]
async fn test_keys_follow_configuration() {
    let cache = store(100);
    let fingerprint = RequestFingerprint::new(12)
        .with_price_range(2.5, 80.0)
        .with_categories(["groceries", "transport"]);

    let v1 = CacheKeyBuilder::new(
        "insights",
        &ModelSettings {
            model: "small",
            temperature: 0.2,
        },
    );
    let v2 = CacheKeyBuilder::new(
        "insights",
        &ModelSettings {
            model: "small",
            temperature: 0.7,
        },
    );

    cache.set(v1.key(&fingerprint), "old answer".to_string(), None);

    assert_ne!(v1.key(&fingerprint), v2.key(&fingerprint));
    assert!(cache.has(&v1.key(&fingerprint)));
    assert_eq!(cache.get(&v2.key(&fingerprint)), None);
    assert!(v1.key(&fingerprint).starts_with("insights:"));
}
