use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn redis_url() -> Option<String> {
    env_nonempty("TOLLGATE_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
}

static PREFIX_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_prefix() -> String {
    let n = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "tollgate_test:{}:{n}",
        chrono::Utc::now().timestamp_millis()
    )
}

async fn store() -> Option<RedisCounterStore> {
    let url = redis_url()?;
    let store = RedisCounterStore::new(url)
        .expect("store")
        .with_prefix(test_prefix());
    store.ping().await.expect("ping");
    Some(store)
}

#[test]
fn keys_are_unprefixed_by_default() {
    let store = RedisCounterStore::new("redis://127.0.0.1:6379").expect("client");
    assert_eq!(store.key("daily_usage:2025-01-01"), "daily_usage:2025-01-01");
    let store = store.with_prefix("staging");
    assert_eq!(
        store.key("daily_usage:2025-01-01"),
        "staging:daily_usage:2025-01-01"
    );
}

#[tokio::test]
async fn increment_within_stops_at_limit() {
    let Some(store) = store().await else {
        return;
    };
    let ttl = Duration::from_secs(60);

    for expected in 1..=2 {
        let out = store.increment_within("rl", 1, 2, ttl).await.expect("incr");
        assert_eq!(out, WindowIncrement::Admitted { count: expected });
    }
    let out = store.increment_within("rl", 1, 2, ttl).await.expect("incr");
    assert_eq!(out, WindowIncrement::Denied { count: 2 });

    let values = store
        .get_many(&["rl".to_string(), "missing".to_string()])
        .await
        .expect("mget");
    assert_eq!(values, vec![2, 0]);
}

#[tokio::test]
async fn batch_writes_hashes_counters_and_sorted_sets() {
    let Some(store) = store().await else {
        return;
    };
    let ttl = Duration::from_secs(60);

    let mut batch = WriteBatch::new();
    batch
        .increment("budget", 7, ttl)
        .hash_increment(
            "usage",
            vec![("requests".to_string(), 1), ("outputTokens".to_string(), 9)],
            ttl,
        )
        .sorted_set_upsert("active", "alice", 1_000)
        .sorted_set_upsert("active", "bob", 5_000);
    store.apply(&batch).await.expect("apply");
    store.apply(&batch).await.expect("apply twice");

    assert_eq!(
        store.get_many(&["budget".to_string()]).await.expect("get"),
        vec![14]
    );
    let usage = store.hash_get_all("usage").await.expect("hgetall");
    assert_eq!(usage.get("requests"), Some(&2));
    assert_eq!(usage.get("outputTokens"), Some(&18));

    assert_eq!(store.prune_and_count("active", 2_000).await.expect("prune"), 1);
}
