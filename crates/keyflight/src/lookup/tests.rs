use crate::{
    BoxError, Error, LockStore, LookupStats, MemoryStore, SharedStore, StampedeSafeLookup,
    StoreScope,
};
use core::time::Duration;
use futures::future::{BoxFuture, join_all};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Instant;
use tokio::time::sleep;

type Load = BoxFuture<'static, Result<String, BoxError>>;

/// A load function that counts invocations and answers after `delay`.
#[derive(Clone)]
struct SlowSource {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl SlowSource {
    fn new(delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, value: &str) -> impl FnOnce(String) -> Load + Send + 'static {
        let calls = Arc::clone(&self.calls);
        let delay = self.delay;
        let value = value.to_owned();
        move |_key: String| -> Load {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(delay).await;
                Ok::<_, BoxError>(value)
            })
        }
    }

    fn fail(&self, reason: &'static str) -> impl FnOnce(String) -> Load + Send + 'static {
        let calls = Arc::clone(&self.calls);
        let delay = self.delay;
        move |_key: String| -> Load {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(delay).await;
                Err::<String, BoxError>(reason.into())
            })
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn fifty_cold_readers_share_one_load() {
    let lookup = Arc::new(StampedeSafeLookup::new(MemoryStore::new()));
    let source = SlowSource::new(Duration::from_millis(200));

    let start = Instant::now();
    let handles: Vec<_> = (0..50)
        .map(|_| {
            let lookup = Arc::clone(&lookup);
            let load = source.answer("Alice");
            tokio::spawn(async move { lookup.get::<String, _, _, _>("user:1", load).await })
        })
        .collect();

    for handle in join_all(handles).await {
        assert_eq!(handle.unwrap().unwrap(), "Alice");
    }
    let elapsed = start.elapsed();

    assert_eq!(source.calls(), 1);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(2_000), "took {elapsed:?}");

    let stats = lookup.stats();
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.hits + stats.misses, 50);
    assert_eq!(stats.coalesced + stats.loads, stats.misses);
    assert_eq!(lookup.in_flight_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn distinct_keys_load_in_parallel() {
    let lookup = Arc::new(StampedeSafeLookup::new(MemoryStore::new()));
    let first = SlowSource::new(Duration::from_millis(300));
    let second = SlowSource::new(Duration::from_millis(300));

    let start = Instant::now();
    let (a, b) = tokio::join!(
        lookup.get::<String, _, _, _>("user:1", first.answer("Alice")),
        lookup.get::<String, _, _, _>("user:2", second.answer("Bob")),
    );
    let elapsed = start.elapsed();

    assert_eq!(a.unwrap(), "Alice");
    assert_eq!(b.unwrap(), "Bob");
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
    // Roughly max(300, 300), not the 600ms a shared lock would cost.
    assert!(elapsed < Duration::from_millis(550), "took {elapsed:?}");
}

#[tokio::test]
async fn present_key_never_reloads() {
    let lookup = StampedeSafeLookup::new(MemoryStore::new());
    let source = SlowSource::new(Duration::ZERO);

    for _ in 0..5 {
        let value: String = lookup.get("user:1", source.answer("Alice")).await.unwrap();
        assert_eq!(value, "Alice");
    }

    assert_eq!(source.calls(), 1);
    assert_eq!(
        lookup.stats(),
        LookupStats {
            hits: 4,
            misses: 1,
            coalesced: 0,
            loads: 1,
            load_failures: 0,
        }
    );
}

#[tokio::test]
async fn failed_load_leaves_cache_empty_and_retries_next_time() {
    let store = MemoryStore::new();
    let lookup = StampedeSafeLookup::new(store.clone());
    let source = SlowSource::new(Duration::ZERO);

    let err = lookup
        .get::<String, _, _, _>("user:1", source.fail("db down"))
        .await
        .unwrap_err();
    match &err {
        Error::LoadFailed { key, source } => {
            assert_eq!(key, "user:1");
            assert_eq!(source.to_string(), "db down");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!store.contains_key("user:1"));
    assert_eq!(lookup.in_flight_keys(), 0);

    let value: String = lookup.get("user:1", source.answer("Alice")).await.unwrap();
    assert_eq!(value, "Alice");
    assert_eq!(source.calls(), 2);
    assert_eq!(lookup.stats().load_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn waiters_do_not_inherit_a_failure() {
    let lookup = Arc::new(StampedeSafeLookup::new(MemoryStore::new()));
    let failing = SlowSource::new(Duration::from_millis(150));
    let healthy = SlowSource::new(Duration::from_millis(50));

    let owner = {
        let lookup = Arc::clone(&lookup);
        let load = failing.fail("db down");
        tokio::spawn(async move { lookup.get::<String, _, _, _>("user:1", load).await })
    };
    // Let the failing owner take the lock first.
    sleep(Duration::from_millis(30)).await;

    let waiters: Vec<_> = (0..10)
        .map(|_| {
            let lookup = Arc::clone(&lookup);
            let load = healthy.answer("Alice");
            tokio::spawn(async move { lookup.get::<String, _, _, _>("user:1", load).await })
        })
        .collect();

    assert!(owner.await.unwrap().unwrap_err().is_load_failed());
    for waiter in join_all(waiters).await {
        assert_eq!(waiter.unwrap().unwrap(), "Alice");
    }
    assert_eq!(failing.calls(), 1);
    // The next waiter in line loads once; the rest find the entry present.
    assert_eq!(healthy.calls(), 1);
    assert_eq!(lookup.in_flight_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_waiter_leaves_load_untouched() {
    let lookup = Arc::new(StampedeSafeLookup::new(MemoryStore::new()));
    let source = SlowSource::new(Duration::from_millis(200));

    let owner = {
        let lookup = Arc::clone(&lookup);
        let load = source.answer("Alice");
        tokio::spawn(async move { lookup.get::<String, _, _, _>("user:1", load).await })
    };
    sleep(Duration::from_millis(20)).await;

    let waited = tokio::time::timeout(
        Duration::from_millis(30),
        lookup.get::<String, _, _, _>("user:1", source.answer("Mallory")),
    )
    .await;
    assert!(waited.is_err());
    assert_eq!(lookup.in_flight_keys(), 1);

    assert_eq!(owner.await.unwrap().unwrap(), "Alice");
    assert_eq!(source.calls(), 1);
    assert_eq!(lookup.in_flight_keys(), 0);
}

#[tokio::test]
async fn store_failure_on_fast_path_skips_load() {
    let store = MemoryStore::new();
    let lookup = StampedeSafeLookup::new(store.clone());
    let source = SlowSource::new(Duration::ZERO);

    store.set_available(false);
    let err = lookup
        .get::<String, _, _, _>("user:1", source.answer("Alice"))
        .await
        .unwrap_err();
    assert!(err.is_store_unavailable());
    assert_eq!(source.calls(), 0);
    assert_eq!(lookup.in_flight_keys(), 0);
}

#[tokio::test]
async fn rejects_empty_key() {
    let lookup = StampedeSafeLookup::new(MemoryStore::new());
    let source = SlowSource::new(Duration::ZERO);
    let err = lookup
        .get::<String, _, _, _>("", source.answer("Alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn caches_structured_values_as_json() {
    let store = MemoryStore::new();
    let lookup = StampedeSafeLookup::new(store.clone());

    let list: Vec<String> = lookup
        .get("test", |_key| async {
            Ok::<_, BoxError>(vec!["aaa".to_owned(), "bbbb".to_owned()])
        })
        .await
        .unwrap();
    assert_eq!(list, ["aaa", "bbbb"]);
    assert_eq!(
        store.get("test").await.unwrap(),
        Some(br#"["aaa","bbbb"]"#.to_vec())
    );
}

#[tokio::test]
async fn undecodable_entry_reports_codec_error() {
    let store = MemoryStore::new();
    store.set("user:1", b"not json".to_vec()).await.unwrap();
    let lookup = StampedeSafeLookup::new(store);
    let source = SlowSource::new(Duration::ZERO);

    let err = lookup
        .get::<String, _, _, _>("user:1", source.answer("Alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Codec { .. }));
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn raw_values_pass_through() {
    let store = MemoryStore::new();
    let lookup = StampedeSafeLookup::new(store.clone());

    let bytes = lookup
        .get_raw("blob", |key| async move {
            Ok::<_, BoxError>(key.into_bytes())
        })
        .await
        .unwrap();
    assert_eq!(bytes, b"blob");
    assert_eq!(store.get("blob").await.unwrap(), Some(b"blob".to_vec()));
}

#[tokio::test]
async fn fast_and_slow_sources_behave_alike() {
    for delay in [Duration::ZERO, Duration::from_millis(50)] {
        let lookup = StampedeSafeLookup::new(MemoryStore::new());
        let source = SlowSource::new(delay);
        let results = join_all(
            (0..8).map(|_| lookup.get::<String, _, _, _>("user:1", source.answer("Alice"))),
        )
        .await;
        assert!(results.into_iter().all(|r| r.unwrap() == "Alice"));
        assert_eq!(source.calls(), 1, "delay {delay:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn store_scope_collapses_across_processes() {
    let store = MemoryStore::new();
    let scope = StoreScope::new(Duration::from_secs(5), Duration::from_millis(5));
    // Two lookups with separate in-process locks stand in for two processes.
    let fleet = [
        Arc::new(StampedeSafeLookup::with_scope(store.clone(), scope)),
        Arc::new(StampedeSafeLookup::with_scope(store.clone(), scope)),
    ];
    let source = SlowSource::new(Duration::from_millis(100));

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let lookup = Arc::clone(&fleet[i % 2]);
            let load = source.answer("Alice");
            tokio::spawn(async move { lookup.get::<String, _, _, _>("user:1", load).await })
        })
        .collect();

    for handle in join_all(handles).await {
        assert_eq!(handle.unwrap().unwrap(), "Alice");
    }
    assert_eq!(source.calls(), 1);
    assert!(!store.is_locked(&StoreScope::lock_key("user:1")));
}

#[tokio::test]
async fn store_scope_releases_lock_after_failure() {
    let store = MemoryStore::new();
    let lookup = StampedeSafeLookup::with_scope(store.clone(), StoreScope::default());
    let source = SlowSource::new(Duration::ZERO);

    let err = lookup
        .get::<String, _, _, _>("user:1", source.fail("db down"))
        .await
        .unwrap_err();
    assert!(err.is_load_failed());
    assert!(!store.is_locked(&StoreScope::lock_key("user:1")));
    assert!(!store.contains_key("user:1"));

    let value: String = lookup.get("user:1", source.answer("Alice")).await.unwrap();
    assert_eq!(value, "Alice");
}

#[tokio::test]
async fn store_scope_waits_out_a_foreign_lock() {
    let store = MemoryStore::new();
    let lock_key = StoreScope::lock_key("user:1");
    let lookup = StampedeSafeLookup::with_scope(
        store.clone(),
        StoreScope::new(Duration::from_secs(5), Duration::from_millis(5)),
    );
    let source = SlowSource::new(Duration::ZERO);

    // Another process owns the load and fills the entry shortly.
    assert!(
        store
            .try_lock(&lock_key, "elsewhere", Duration::from_secs(5))
            .await
            .unwrap()
    );
    let filler = {
        let store = store.clone();
        let lock_key = lock_key.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            store.set("user:1", br#""Alice""#.to_vec()).await.unwrap();
            store.unlock(&lock_key, "elsewhere").await.unwrap();
        })
    };

    let value: String = lookup.get("user:1", source.answer("Mallory")).await.unwrap();
    filler.await.unwrap();

    assert_eq!(value, "Alice");
    assert_eq!(source.calls(), 0);
    assert_eq!(lookup.stats().coalesced, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_owner_hands_load_to_next_caller() {
    let store = MemoryStore::new();
    let lookup = StampedeSafeLookup::new(store.clone());
    let stuck = SlowSource::new(Duration::from_secs(10));
    let quick = SlowSource::new(Duration::ZERO);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        lookup.get::<String, _, _, _>("user:1", stuck.answer("Mallory")),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(stuck.calls(), 1);
    assert_eq!(lookup.in_flight_keys(), 0);
    assert!(!store.contains_key("user:1"));

    let start = Instant::now();
    let value: String = lookup.get("user:1", quick.answer("Alice")).await.unwrap();
    assert_eq!(value, "Alice");
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(quick.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_scope_cancelled_owner_releases_store_lock() {
    let store = MemoryStore::new();
    let lock_key = StoreScope::lock_key("user:1");
    let scope = StoreScope::new(Duration::from_secs(3), Duration::from_millis(5));
    let lookup = StampedeSafeLookup::with_scope(store.clone(), scope);
    let elsewhere = StampedeSafeLookup::with_scope(store.clone(), scope);
    let stuck = SlowSource::new(Duration::from_secs(10));
    let quick = SlowSource::new(Duration::ZERO);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        lookup.get::<String, _, _, _>("user:1", stuck.answer("Mallory")),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(stuck.calls(), 1);

    // The unlock runs on a spawned task.
    for _ in 0..100 {
        if !store.is_locked(&lock_key) {
            break;
        }
        sleep(Duration::from_millis(1)).await;
    }
    assert!(!store.is_locked(&lock_key));

    // Neither this process nor another one waits out the 3s lock ttl.
    let start = Instant::now();
    let here: String = lookup.get("user:1", quick.answer("Alice")).await.unwrap();
    assert_eq!(here, "Alice");
    store.remove("user:1");
    let there: String = elsewhere.get("user:1", quick.answer("Bob")).await.unwrap();
    assert_eq!(there, "Bob");
    assert!(start.elapsed() < Duration::from_millis(500), "took {:?}", start.elapsed());
    assert_eq!(quick.calls(), 2);
    assert!(!store.is_locked(&lock_key));
}

#[tokio::test]
async fn store_scope_rejects_keys_in_lock_namespace() {
    let store = MemoryStore::new();
    let lookup = StampedeSafeLookup::with_scope(store.clone(), StoreScope::default());
    let source = SlowSource::new(Duration::ZERO);

    let reserved = StoreScope::lock_key("user:1");
    assert_eq!(reserved, "keyflight:flight-lock:user:1");
    let err = lookup
        .get::<String, _, _, _>(&reserved, source.answer("Mallory"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert_eq!(source.calls(), 0);
    assert!(store.is_empty());

    // Lock keys never land on a key a caller could read.
    let value: String = lookup
        .get("user:1:flight-lock", source.answer("real"))
        .await
        .unwrap();
    assert_eq!(value, "real");
    assert!(!store.contains_key(&reserved));
}
