//! Behaviour every cache backend must share. The redis run needs a server:
//! `PAGEWIRE_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pagewire_cache::{Cache, CacheExt, MemoryCache, RedisCache};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio::sync::Mutex;
use uuid::Uuid;

const LOCK_KEYS: usize = 200;
const LOCK_TASKS: usize = 100;
const LOCK_ROUNDS: usize = 3;

/// Keys are namespaced per run so a shared redis can be reused.
struct Keys(String);

impl Keys {
    fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    fn key(&self, name: &str) -> String {
        format!("test:{}:{}", self.0, name)
    }
}

async fn check_increment(cache: &dyn Cache, keys: &Keys) {
    let key = keys.key("counter");
    assert_eq!(
        cache
            .increment(&key, 1, Some(Duration::from_secs(60)))
            .await
            .unwrap(),
        1
    );
    assert_eq!(cache.increment(&key, 2, None).await.unwrap(), 3);
    assert_eq!(cache.increment(&key, -5, None).await.unwrap(), -2);
    cache.remove(&[key.clone()]).await.unwrap();
    assert_eq!(cache.increment(&key, 4, None).await.unwrap(), 4);
    cache.remove(&[key]).await.unwrap();
}

async fn check_hash_increment(cache: &dyn Cache, keys: &Keys) {
    let key = keys.key("hash-counter");
    assert_eq!(cache.hash_increment(&key, "f", 1).await.unwrap(), 1);
    assert_eq!(cache.hash_increment(&key, "f", 2).await.unwrap(), 3);
    assert_eq!(cache.hash_increment(&key, "f", -5).await.unwrap(), -2);
    cache.remove(&[key]).await.unwrap();
}

async fn check_hash(cache: &dyn Cache, keys: &Keys) {
    let key = keys.key("hash");
    cache
        .hash_set(&key, &[("a", "1"), ("b", "2")])
        .await
        .unwrap();
    let all = cache.hash_get_all(&key).await.unwrap();
    assert_eq!(
        all,
        HashMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ])
    );
    assert_eq!(
        cache.hash_get(&key, "a").await.unwrap().as_deref(),
        Some("1")
    );
    assert_eq!(cache.hash_get(&key, "missing").await.unwrap(), None);

    cache.hash_remove(&key, &["a", "b"]).await.unwrap();
    assert!(!cache.exists(&key).await.unwrap());
    assert!(cache.hash_get_all(&key).await.unwrap().is_empty());
}

#[derive(Debug, Deserialize, PartialEq)]
struct StoredSession {
    id: String,
    #[serde(rename = "clientIP", default)]
    client_ip: String,
}

async fn check_hash_scan(cache: &dyn Cache, keys: &Keys) {
    let key = keys.key("scan");
    assert_eq!(cache.hash_scan::<StoredSession>(&key).await.unwrap(), None);
    cache
        .hash_set(&key, &[("id", "abc"), ("clientIP", "10.0.0.1"), ("size", "12")])
        .await
        .unwrap();
    let scanned = cache.hash_scan::<StoredSession>(&key).await.unwrap();
    assert_eq!(
        scanned,
        Some(StoredSession {
            id: "abc".to_string(),
            client_ip: "10.0.0.1".to_string(),
        })
    );
    cache.remove(&[key]).await.unwrap();
}

async fn check_set(cache: &dyn Cache, keys: &Keys) {
    let key = keys.key("set");
    cache.set_add(&key, "a").await.unwrap();
    cache.set_add(&key, "b").await.unwrap();
    cache.set_add(&key, "b").await.unwrap();
    let mut members = cache.set_members(&key).await.unwrap();
    members.sort();
    assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

    assert!(cache.set_remove(&key, "a").await.unwrap());
    assert!(!cache.set_remove(&key, "a").await.unwrap());
    assert!(cache.set_remove(&key, "b").await.unwrap());
    assert!(!cache.exists(&key).await.unwrap());
}

async fn check_sorted_set(cache: &dyn Cache, keys: &Keys) {
    let key = keys.key("expirations");
    cache.sorted_set_add(&key, "old", 100).await.unwrap();
    cache.sorted_set_add(&key, "new", 300).await.unwrap();
    cache.sorted_set_add(&key, "gone", 200).await.unwrap();
    cache.sorted_set_remove(&key, "gone").await.unwrap();

    assert_eq!(
        cache.sorted_set_pop_range(&key, 0, 250).await.unwrap(),
        vec!["old".to_string()]
    );
    assert!(cache
        .sorted_set_pop_range(&key, 0, 250)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        cache.sorted_set_pop_range(&key, 0, 300).await.unwrap(),
        vec!["new".to_string()]
    );
}

async fn check_session_size_cap(cache: &dyn Cache, keys: &Keys) {
    let session = keys.key("session");
    let controls = keys.key("session:controls");
    let small = r#"{"i":"a"}"#;
    let large = r#"{"i":"b","value":"0123456789012345678901234567890123456789"}"#;
    let cap = small.len() + large.len() - 1;

    assert!(cache
        .set_session_control(&session, &controls, "a", small, cap)
        .await
        .unwrap());
    assert!(!cache
        .set_session_control(&session, &controls, "b", large, cap)
        .await
        .unwrap());
    assert_eq!(cache.hash_get(&controls, "b").await.unwrap(), None);
    assert_eq!(
        cache.hash_get(&session, "size").await.unwrap(),
        Some(small.len().to_string())
    );

    // Replacing a control only counts the difference.
    assert!(cache
        .set_session_control(&session, &controls, "a", small, cap)
        .await
        .unwrap());
    assert_eq!(
        cache.hash_get(&session, "size").await.unwrap(),
        Some(small.len().to_string())
    );

    cache
        .remove_session_control(&session, &controls, "a")
        .await
        .unwrap();
    assert_eq!(
        cache.hash_get(&session, "size").await.unwrap(),
        Some("0".to_string())
    );
    assert!(cache
        .set_session_control(&session, &controls, "b", large, cap)
        .await
        .unwrap());
    cache.remove(&[session, controls]).await.unwrap();
}

async fn check_pubsub(cache: &dyn Cache, keys: &Keys) {
    let channel = keys.key("client");
    let mut first = cache.subscribe(&channel).await.unwrap();
    let mut second = cache.subscribe(&channel).await.unwrap();

    let payload = Bytes::from_static(br#"{"action":"appBecomeActive"}"#);
    let publisher = {
        let payload = payload.clone();
        async move { cache.publish(&channel, payload).await.unwrap() }
    };
    let (_, a, b) = tokio::join!(publisher, first.receiver.recv(), second.receiver.recv());
    assert_eq!(a, Some(payload.clone()));
    assert_eq!(b, Some(payload));

    cache.unsubscribe(first.id).await.unwrap();
    assert_eq!(first.receiver.recv().await, None);
    cache.unsubscribe(second.id).await.unwrap();
}

async fn check_lock_interleaving(cache: Arc<dyn Cache>, keys: &Keys) {
    let log: Arc<Mutex<HashMap<String, Vec<char>>>> = Arc::default();
    let mut rng = StdRng::seed_from_u64(42);
    let mut tasks = Vec::with_capacity(LOCK_TASKS);

    for _ in 0..LOCK_TASKS {
        let key = keys.key(&format!("lock-{}", rng.gen_range(0..LOCK_KEYS)));
        let pause = Duration::from_millis(rng.gen_range(0..20));
        let cache = Arc::clone(&cache);
        let log = Arc::clone(&log);
        tasks.push(tokio::spawn(async move {
            for _ in 0..LOCK_ROUNDS {
                let guard = cache.lock(&key).await.unwrap();
                log.lock().await.entry(key.clone()).or_default().push('A');
                tokio::time::sleep(pause).await;
                log.lock().await.entry(key.clone()).or_default().push('B');
                guard.unlock().await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for (key, events) in log.lock().await.iter() {
        for pair in events.chunks(2) {
            assert_eq!(pair, ['A', 'B'], "interleaved lock holders on {key}: {events:?}");
        }
    }
}

async fn run_contract(cache: Arc<dyn Cache>) {
    let keys = Keys::new();
    check_increment(cache.as_ref(), &keys).await;
    check_hash_increment(cache.as_ref(), &keys).await;
    check_hash(cache.as_ref(), &keys).await;
    check_hash_scan(cache.as_ref(), &keys).await;
    check_set(cache.as_ref(), &keys).await;
    check_sorted_set(cache.as_ref(), &keys).await;
    check_session_size_cap(cache.as_ref(), &keys).await;
    check_pubsub(cache.as_ref(), &keys).await;
    check_lock_interleaving(cache, &keys).await;
}

#[test_timeout::tokio_timeout_test(secs = 60, flavor = "multi_thread", workers = 4)]
async fn memory_cache_satisfies_contract() {
    run_contract(Arc::new(MemoryCache::new())).await;
}

#[test_timeout::tokio_timeout_test(secs = 120, flavor = "multi_thread", workers = 4)]
#[ignore = "requires PAGEWIRE_TEST_REDIS_URL"]
async fn redis_cache_satisfies_contract() {
    let Ok(url) = std::env::var("PAGEWIRE_TEST_REDIS_URL") else {
        eprintln!("PAGEWIRE_TEST_REDIS_URL not set; skipping");
        return;
    };
    let cache = RedisCache::connect(&url).await.expect("redis reachable");
    run_contract(Arc::new(cache)).await;
}
