use std::sync::Arc;
use std::time::Duration;

use docstream::{
    Changes, Connection, Error, MemStore, Operation, RawRecord, StoreError, ThrottledQueueConfig,
    ThrottledWriteQueue, UpdateQueue,
};
use serde_json::json;

const DRAIN: Duration = Duration::from_secs(10);

fn store(n: usize) -> Arc<MemStore> {
    Arc::new(MemStore::with_records(
        "tweets",
        (0..n).map(|i| RawRecord::new(format!("r{i}"), json!({"n": i}))),
    ))
}

fn queue(store: &Arc<MemStore>, config: ThrottledQueueConfig) -> ThrottledWriteQueue<MemStore> {
    ThrottledWriteQueue::new(
        Arc::new(Connection::from_store(Arc::clone(store))),
        "tweets",
        config,
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_writes_applied() {
    let store = store(100);
    let queue = queue(&store, ThrottledQueueConfig::default());

    for i in 0..100 {
        queue
            .update_field(&format!("r{i}"), "label", json!(i % 3))
            .await;
    }
    queue.drain(DRAIN).await.unwrap();
    queue.close().await.unwrap();

    let stats = queue.stats();
    assert_eq!(stats.accepted, 100);
    assert_eq!(stats.acknowledged, 100);
    assert_eq!(stats.pending(), 0);
    assert_eq!(queue.in_flight(), 0);
    for i in 0..100 {
        assert_eq!(store.get("tweets", &format!("r{i}")).unwrap()["label"], json!(i % 3));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ceiling_respected_under_latency() {
    let store = store(200);
    store.set_latency(Duration::from_millis(10));
    let queue = queue(&store, ThrottledQueueConfig::default());

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in (p..200).step_by(4) {
                    queue.update_field(&format!("r{i}"), "seen", json!(true)).await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    queue.drain(DRAIN).await.unwrap();

    assert_eq!(queue.stats().acknowledged, 200);
    assert!(store.peak_concurrent_updates() <= 25);
    assert!(store.peak_concurrent_updates() > 1);
}

#[tokio::test]
async fn test_ceiling_decreases_on_every_throttle() {
    let store = store(5);
    let queue = queue(&store, ThrottledQueueConfig::default());

    let mut ceilings = vec![queue.max_in_flight()];
    for i in 0..5 {
        store.fail_next(Operation::Update, StoreError::Throttled("429".into()));
        queue.update_field(&format!("r{i}"), "label", json!("x")).await;
        queue.drain(DRAIN).await.unwrap();
        ceilings.push(queue.max_in_flight());
    }

    assert_eq!(ceilings, vec![25, 22, 19, 17, 15, 13]);
    let stats = queue.stats();
    assert_eq!(stats.throttled, 5);
    assert_eq!(stats.resubmitted, 5);
    assert_eq!(stats.acknowledged, 5);
    assert_eq!(store.calls(Operation::Update), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_throttling_converges() {
    let store = store(100);
    store.set_latency(Duration::from_millis(5));
    store.set_throttle_above(8);
    let queue = queue(&store, ThrottledQueueConfig::default());

    for i in 0..100 {
        queue.update_field(&format!("r{i}"), "label", json!("y")).await;
    }
    queue.drain(DRAIN).await.unwrap();

    let stats = queue.stats();
    assert_eq!(stats.acknowledged, 100);
    assert!(stats.throttled > 0);
    assert!(queue.max_in_flight() < 25);
}

#[tokio::test]
async fn test_other_failures_are_dropped_without_retry() {
    let store = store(3);
    let queue = queue(&store, ThrottledQueueConfig::default());

    store.fail_next(Operation::Update, StoreError::Transport("connection reset".into()));
    queue.update_field("r0", "label", json!("x")).await;
    queue.drain(DRAIN).await.unwrap();
    queue.update_field("missing", "label", json!("x")).await;
    queue.drain(DRAIN).await.unwrap();

    let stats = queue.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.acknowledged, 0);
    assert_eq!(store.calls(Operation::Update), 2);
    assert_eq!(queue.max_in_flight(), 25);
    assert!(store.get("tweets", "r0").unwrap().get("label").is_none());
}

#[tokio::test]
async fn test_throttle_retry_cap() {
    let store = store(1);
    let config = ThrottledQueueConfig {
        max_throttle_retries: Some(2),
        ..ThrottledQueueConfig::default()
    };
    let queue = queue(&store, config);

    for _ in 0..3 {
        store.fail_next(Operation::Update, StoreError::Throttled("429".into()));
    }
    queue.update_field("r0", "label", json!("x")).await;
    queue.drain(DRAIN).await.unwrap();

    let stats = queue.stats();
    assert_eq!(stats.throttled, 3);
    assert_eq!(stats.dropped, 1);
    assert_eq!(store.calls(Operation::Update), 3);
}

#[tokio::test]
async fn test_empty_changes_ignored() {
    let store = store(1);
    let queue = queue(&store, ThrottledQueueConfig::default());

    queue.update("r0", Changes::new()).await;
    queue.drain(DRAIN).await.unwrap();

    assert_eq!(queue.stats().accepted, 0);
    assert_eq!(store.calls(Operation::Update), 0);
}

#[tokio::test]
async fn test_drain_times_out() {
    let store = store(1);
    store.set_latency(Duration::from_millis(300));
    let queue = queue(&store, ThrottledQueueConfig::default());

    queue.update_field("r0", "label", json!("x")).await;
    let err = queue.drain(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, Error::DrainTimeout { pending: 1, .. }));

    queue.drain(DRAIN).await.unwrap();
    assert_eq!(queue.stats().acknowledged, 1);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config = ThrottledQueueConfig {
        min_in_flight: 0,
        max_in_flight: 0,
        max_throttle_retries: None,
    };
    let result = ThrottledWriteQueue::new(
        Arc::new(Connection::from_store(store(1))),
        "tweets",
        config,
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_cancelled_admission_wait_leaves_nothing_pending() {
    let store = store(2);
    store.set_latency(Duration::from_millis(100));
    let queue = queue(
        &store,
        ThrottledQueueConfig {
            min_in_flight: 1,
            max_in_flight: 1,
            max_throttle_retries: None,
        },
    );

    queue.update_field("r0", "label", json!("x")).await;
    let waited = tokio::time::timeout(
        Duration::from_millis(20),
        queue.update_field("r1", "label", json!("y")),
    )
    .await;
    assert!(waited.is_err());

    queue.drain(DRAIN).await.unwrap();
    let stats = queue.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.acknowledged, 1);
    assert!(store.get("tweets", "r1").unwrap().get("label").is_none());
}
