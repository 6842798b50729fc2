#![cfg(feature = "redis")]

use std::num::NonZeroU64;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use more_asserts::assert_le;
use shot_coord::AcquireStrategy;
use shot_coord::FrequencyLock;
use shot_coord::LockOutcome;
use shot_coord::MinuteRateLimiter;
use shot_coord::Semaphore;
use shot_coord::SendSpeedLimiter;
use shot_coord::SendVolumeLimiter;
use shot_coord::Store;
use shot_coord::store::Batch;
use shot_coord::store::RedisStore;
use shot_coord::store::SetOptions;

async fn store() -> Arc<RedisStore> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
    Arc::new(RedisStore::open(&url).await.expect("Redis should be reachable"))
}

/// A name no other test run will use.
fn unique(name: &str) -> String {
    format!("shot-coord-test:{name}:{}", rand::random::<u64>())
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_commands_follow_redis_semantics() {
    let store = store().await;
    let key = unique("commands");

    assert!(store.set(&key, "a", SetOptions::if_absent()).await.unwrap());
    assert!(!store.set(&key, "b", SetOptions::if_absent()).await.unwrap());
    assert_eq!(store.getset(&key, "c").await.unwrap().as_deref(), Some("a"));
    assert_eq!(store.del(&[key.as_str()]).await.unwrap(), 1);

    let list = unique("list");
    store.lpush(&list, "1").await.unwrap();
    store.lpush(&list, "2").await.unwrap();
    assert_eq!(store.rpop(&list).await.unwrap().as_deref(), Some("1"));
    assert_eq!(store.rpop(&list).await.unwrap().as_deref(), Some("2"));
    assert!(!store.exists(&list).await.unwrap());

    let hash = unique("hash");
    assert!(store.hset(&hash, "f", "v").await.unwrap());
    assert_eq!(
        store.hgetall(&hash).await.unwrap(),
        vec![("f".to_string(), "v".to_string())]
    );
    assert!(store.hdel(&hash, "f").await.unwrap());
    assert!(!store.hdel(&hash, "f").await.unwrap());
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_transaction_replies_in_order() {
    let store = store().await;
    let key = unique("counter");

    let batch = Batch::transaction()
        .incr_by(&key, 5)
        .pexpire(&key, Duration::from_secs(10))
        .get(&key);
    let replies = store.exec(&batch).await.unwrap();

    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0].clone().into_int().unwrap(), 5);
    assert!(replies[1].clone().into_bool().unwrap());
    assert_eq!(replies[2].clone().into_string().unwrap().as_deref(), Some("5"));
    store.del(&[key.as_str()]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_brpop_times_out_and_zero_does_not_block() {
    let store = store().await;
    let list = unique("empty");

    assert_eq!(store.brpop(&list, Duration::ZERO).await.unwrap(), None);
    let started = std::time::Instant::now();
    assert_eq!(store.brpop(&list, Duration::from_secs(1)).await.unwrap(), None);
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_frequency_lock_strategies() {
    let store = store().await;

    for strategy in [AcquireStrategy::SetIfAbsent, AcquireStrategy::StaleAwareSwap] {
        let lock = FrequencyLock::new(Arc::clone(&store), strategy);
        let name = unique("lock");

        assert!(lock.acquire(&name, Duration::from_secs(5)).await.unwrap());
        assert!(!lock.acquire(&name, Duration::from_secs(5)).await.unwrap());
    }
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_limiters() {
    let store = store().await;

    let minute = MinuteRateLimiter::new(Arc::clone(&store), NonZeroU64::new(100).unwrap());
    let identifier = unique("minute");
    assert!(!minute.should_limit(&identifier).await.unwrap());
    assert_le!(minute.remaining(&identifier).await.unwrap(), 99);

    let volume = SendVolumeLimiter::new(Arc::clone(&store), 10);
    let identifier = unique("volume");
    let batch: Vec<u32> = (0..7).collect();
    assert_eq!(volume.admit(&identifier, &batch).await.unwrap().len(), 7);
    assert_eq!(volume.admit(&identifier, &batch).await.unwrap().len(), 3);
    volume.reset(&identifier).await.unwrap();

    let speed = SendSpeedLimiter::new(Arc::clone(&store), NonZeroU64::new(100).unwrap());
    let identifier = unique("speed");
    let first = speed.time_to_send(&identifier, 100).await.unwrap();
    let second = speed.time_to_send(&identifier, 1).await.unwrap();
    assert_eq!((second - first).num_seconds(), 60);
    speed.reset(&identifier).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_semaphore_round_trip() {
    let store = store().await;
    let semaphore = Semaphore::new(
        Arc::clone(&store),
        unique("semaphore"),
        NonZeroUsize::new(2).unwrap(),
        Duration::from_secs(30),
    );

    let outcome = semaphore
        .lock(Some(Duration::from_secs(1)), |token| async move { token.get() })
        .await
        .unwrap();
    assert!(matches!(outcome, LockOutcome::Acquired(1 | 2)));
    assert_eq!(semaphore.available_count().await.unwrap(), 2);

    semaphore.delete().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_semaphore_blocking_wait_sees_release() {
    let store = store().await;
    let semaphore = Semaphore::new(
        Arc::clone(&store),
        unique("semaphore-wait"),
        NonZeroUsize::MIN,
        Duration::from_secs(30),
    );

    let holder = semaphore.clone();
    let held = tokio::spawn(async move {
        holder
            .lock(None, |_| tokio::time::sleep(Duration::from_millis(300)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = semaphore
        .lock(Some(Duration::from_secs(3)), |_| async {})
        .await
        .unwrap();
    assert!(outcome.is_acquired());
    assert!(held.await.unwrap().unwrap().is_acquired());

    semaphore.delete().await.unwrap();
}
