//! Integration tests for the two-tier cache against a real Redis.
//!
//! Covers the read-through state machine (cold, warm, soft-stale, hard
//! expiry), herd coalescing, deep-copy hand-off, and cross-instance
//! invalidation. Tests share one Redis container via testcontainers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tidecache::{BoxError, Cache, CacheError};
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn redis_addr() -> String {
    let (_, addr) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let port = container
                .get_host_port_ipv4(6379)
                .await
                .expect("get redis port");
            (container, format!("127.0.0.1:{port}"))
        })
        .await;
    addr.clone()
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    let addr = redis_addr().await;
    let client = redis::Client::open(format!("redis://{addr}")).expect("redis client");
    client
        .get_multiplexed_async_connection()
        .await
        .expect("redis connection")
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos() as i64
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Doc {
    name: String,
    tags: Vec<String>,
}

fn doc(name: &str) -> Doc {
    Doc {
        name: name.into(),
        tags: vec!["a".into()],
    }
}

#[tokio::test]
async fn cold_read_runs_loader_and_fills_redis() {
    let cache = Cache::new("cold", redis_addr().await, "", 16).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let got: Doc = cache
        .get_object("cold:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, BoxError>(doc("test"))
        })
        .await
        .unwrap();

    assert_eq!(got, doc("test"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The redis payload is a self-describing envelope with an absolute
    // expiration roughly ttl from now.
    let mut conn = raw_connection().await;
    let payload: String = conn.get("cold:1").await.unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&payload).unwrap();

    assert_eq!(envelope["object"]["name"], "test");
    let expiration = envelope["expiration"].as_i64().unwrap();
    let expected = now_nanos() + 60_000_000_000;
    assert!((expected - expiration).abs() < 5_000_000_000, "expiration {expiration} vs {expected}");

    let ttl: i64 = conn.ttl("cold:1").await.unwrap();
    assert!((55..=60).contains(&ttl), "redis ttl = {ttl}");
}

#[tokio::test]
async fn warm_read_skips_loader() {
    let cache = Cache::new("warm", redis_addr().await, "", 16).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let counter = Arc::clone(&calls);
        let got: Doc = cache
            .get_object("warm:1", 60, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(doc("test"))
            })
            .await
            .unwrap();
        assert_eq!(got, doc("test"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn soft_stale_read_serves_old_value_and_refreshes() {
    let addr = redis_addr().await;
    let cache = Cache::new("stale", addr, "", 16).unwrap();

    // Seed an entry that is inside its soft window but far from hard
    // expiry: the huge ttl drags the soft boundary into the past.
    let expiration = now_nanos() + 30_000_000_000;
    let payload = format!(
        r#"{{"object":{{"name":"stale","tags":["a"]}},"expiration":{expiration},"ttl":1000000}}"#
    );
    let mut conn = raw_connection().await;
    conn.set_ex::<_, _, ()>("stale:1", payload, 60).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let got: Doc = cache
        .get_object("stale:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(doc("fresh"))
        })
        .await
        .unwrap();

    // The stale value is served without waiting on the refresh.
    assert_eq!(got.name, "stale");

    // The background refresh lands a new envelope in redis.
    let mut refreshed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let payload: Option<String> = conn.get("stale:1").await.unwrap();
        if let Some(payload) = payload {
            let envelope: serde_json::Value = serde_json::from_str(&payload).unwrap();
            if envelope["object"]["name"] == "fresh" {
                refreshed = true;
                break;
            }
        }
    }
    assert!(refreshed, "background refresh never landed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Subsequent reads see the refreshed value without reloading.
    let counter = Arc::clone(&calls);
    let got: Doc = cache
        .get_object("stale:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(doc("unused"))
        })
        .await
        .unwrap();
    assert_eq!(got.name, "fresh");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hard_expiry_reruns_loader_in_debug_mode() {
    let cache = Cache::new("debug", redis_addr().await, "", 16).unwrap();
    cache.enable_debug();

    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let _: Doc = cache
        .get_object("debug:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(doc("first"))
        })
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Debug mode forces the ttl to one second.
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let counter = Arc::clone(&calls);
    let got: Doc = cache
        .get_object("debug:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(doc("second"))
        })
        .await
        .unwrap();
    assert_eq!(got.name, "second");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn herd_of_cold_readers_runs_loader_once() {
    let cache = Cache::new("herd", redis_addr().await, "", 32).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let cache = cache.clone();
        let counter = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            cache
                .get_object::<Doc, _, _>("herd:1", 60, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, BoxError>(doc("herd"))
                })
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), doc("herd"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn delete_invalidates_every_instance() {
    let addr = redis_addr().await;
    let node_a = Cache::new("cluster", addr.clone(), "", 16).unwrap();
    let node_b = Cache::new("cluster", addr, "", 16).unwrap();

    // Let both subscribers come up before publishing anything.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let got: Doc = node_a
        .get_object("cluster:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(doc("original"))
        })
        .await
        .unwrap();
    assert_eq!(got.name, "original");

    node_b.delete("cluster:1").await.unwrap();

    // Within bounded time node A drops the key from both tiers and the
    // next read goes back to the loader.
    let reload_calls = Arc::new(AtomicUsize::new(0));
    let mut reloaded = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let counter = Arc::clone(&reload_calls);
        let got: Doc = node_a
            .get_object("cluster:1", 60, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(doc("reloaded"))
            })
            .await
            .unwrap();
        if got.name == "reloaded" {
            reloaded = true;
            break;
        }
    }

    assert!(reloaded, "invalidation never reached node A");
    assert_eq!(reload_calls.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn returned_values_are_independent_copies() {
    let cache = Cache::new("copy", redis_addr().await, "", 16).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let mut first: Doc = cache
        .get_object("copy:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(doc("copy"))
        })
        .await
        .unwrap();
    first.tags.push("mutated".into());

    let counter = Arc::clone(&calls);
    let second: Doc = cache
        .get_object("copy:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(doc("unused"))
        })
        .await
        .unwrap();

    assert_eq!(second, doc("copy"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn loader_error_propagates_and_leaves_tiers_empty() {
    let cache = Cache::new("err", redis_addr().await, "", 16).unwrap();

    let err = cache
        .get_object::<Doc, _, _>("err:1", 60, || async {
            Err::<Doc, BoxError>("origin unavailable".into())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Loader(_)));
    assert!(err.to_string().contains("origin unavailable"));

    // Nothing was cached on the failed path.
    let mut conn = raw_connection().await;
    let payload: Option<String> = conn.get("err:1").await.unwrap();
    assert!(payload.is_none());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let got: Doc = cache
        .get_object("err:1", 60, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(doc("recovered"))
        })
        .await
        .unwrap();
    assert_eq!(got.name, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
