use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use docstream::{
    BulkQueueConfig, BulkWriteQueue, Changes, Connection, Error, MemStore, Operation, RawRecord,
    StoreError, UpdateQueue,
};
use serde_json::json;

fn store(n: usize) -> Arc<MemStore> {
    Arc::new(MemStore::with_records(
        "tweets",
        (0..n).map(|i| RawRecord::new(format!("r{i}"), json!({"n": i}))),
    ))
}

fn config() -> BulkQueueConfig {
    BulkQueueConfig {
        batch_size: 10,
        batch_bytes: 1024 * 1024,
        max_concurrent_batches: 2,
        max_retries: 2,
        flush_interval_ms: 60_000,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        close_timeout_ms: 5_000,
    }
}

fn queue(store: &Arc<MemStore>, config: BulkQueueConfig) -> BulkWriteQueue {
    BulkWriteQueue::new(
        Arc::new(Connection::from_store(Arc::clone(store))),
        "tweets",
        config,
    )
    .unwrap()
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn batch_sizes(store: &MemStore) -> Vec<usize> {
    let mut sizes: Vec<usize> = store.bulk_log().iter().map(Vec::len).collect();
    sizes.sort_unstable();
    sizes
}

#[tokio::test]
async fn test_count_threshold_seals_batches() {
    let store = store(25);
    let queue = queue(&store, config());

    for i in 0..25 {
        queue.update_field(&format!("r{i}"), "label", json!("pos")).await;
    }
    wait_for("two full batches", || store.bulk_log().len() == 2).await;
    assert_eq!(batch_sizes(&store), vec![10, 10]);

    queue.close().await.unwrap();
    assert_eq!(batch_sizes(&store), vec![5, 10, 10]);
    assert_eq!(queue.stats().acknowledged, 25);
    assert_eq!(queue.stats().pending(), 0);
}

#[tokio::test]
async fn test_byte_threshold_seals_batches() {
    let store = store(6);
    let queue = queue(
        &store,
        BulkQueueConfig {
            batch_bytes: 100,
            ..config()
        },
    );

    // each update is roughly 80 bytes, so every second one crosses the limit
    let text = "x".repeat(60);
    for i in 0..6 {
        queue.update_field(&format!("r{i}"), "text", json!(text)).await;
    }
    wait_for("three batches", || store.bulk_log().len() == 3).await;
    assert_eq!(batch_sizes(&store), vec![2, 2, 2]);

    queue.close().await.unwrap();
    assert_eq!(store.bulk_log().len(), 3);
}

#[tokio::test]
async fn test_time_threshold_seals_batch() {
    let store = store(3);
    let queue = queue(
        &store,
        BulkQueueConfig {
            batch_size: 1000,
            flush_interval_ms: 50,
            ..config()
        },
    );

    for i in 0..3 {
        queue.update_field(&format!("r{i}"), "label", json!("neg")).await;
    }
    assert!(store.bulk_log().is_empty());

    wait_for("interval flush", || !store.bulk_log().is_empty()).await;
    assert_eq!(store.bulk_log(), vec![vec!["r0", "r1", "r2"]]);
    wait_for("acknowledgements", || queue.stats().acknowledged == 3).await;

    queue.close().await.unwrap();
    assert_eq!(store.bulk_log().len(), 1);
}

#[tokio::test]
async fn test_explicit_flush() {
    let store = store(2);
    let queue = queue(&store, config());

    queue.update_field("r0", "label", json!(1)).await;
    queue.update_field("r1", "label", json!(2)).await;
    queue.flush();

    wait_for("flushed batch", || queue.stats().acknowledged == 2).await;
    assert_eq!(store.bulk_log(), vec![vec!["r0", "r1"]]);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_back_off_and_retry() {
    let store = store(4);
    let queue = queue(&store, config());
    store.fail_next(Operation::BulkUpdate, StoreError::Transport("connection reset".into()));
    store.fail_next(Operation::BulkUpdate, StoreError::Throttled("429".into()));

    for i in 0..4 {
        queue.update_field(&format!("r{i}"), "label", json!("pos")).await;
    }
    queue.close().await.unwrap();

    let log = store.bulk_log();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|batch| batch == &log[0]));
    let stats = queue.stats();
    assert_eq!(stats.acknowledged, 4);
    assert_eq!(stats.resubmitted, 0);
}

#[tokio::test]
async fn test_no_write_lost_on_whole_batch_transport_failure() {
    let store = store(5);
    let queue = queue(
        &store,
        BulkQueueConfig {
            max_retries: 1,
            ..config()
        },
    );
    store.fail_next(Operation::BulkUpdate, StoreError::Transport("down".into()));
    store.fail_next(Operation::BulkUpdate, StoreError::Transport("still down".into()));

    for i in 0..5 {
        queue.update_field(&format!("r{i}"), "label", json!("pos")).await;
    }
    queue.close().await.unwrap();

    let log = store.bulk_log();
    assert_eq!(log.len(), 3);
    let sent: BTreeSet<&String> = log[0].iter().collect();
    let resent: BTreeSet<&String> = log[2].iter().collect();
    assert_eq!(sent, resent);
    assert_eq!(sent.len(), 5);

    let stats = queue.stats();
    assert_eq!(stats.resubmitted, 5);
    assert_eq!(stats.acknowledged, 5);
    assert_eq!(stats.dropped, 0);
    for i in 0..5 {
        assert_eq!(store.get("tweets", &format!("r{i}")).unwrap()["label"], "pos");
    }
}

#[tokio::test]
async fn test_item_failures_are_not_retried() {
    let store = store(2);
    let queue = queue(&store, config());

    queue.update_field("r0", "label", json!("a")).await;
    queue.update_field("missing", "label", json!("b")).await;
    queue.update_field("r1", "label", json!("c")).await;
    queue.close().await.unwrap();

    let stats = queue.stats();
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.resubmitted, 0);
    assert_eq!(store.bulk_log().len(), 1);
}

#[tokio::test]
async fn test_rejected_batch_is_dropped() {
    let store = store(3);
    let queue = queue(&store, config());
    store.fail_next(Operation::BulkUpdate, StoreError::Rejected("mapping conflict".into()));

    for i in 0..3 {
        queue.update_field(&format!("r{i}"), "label", json!("x")).await;
    }
    let err = queue.close().await.unwrap_err();

    assert!(matches!(err, Error::FlushFailed { dropped: 3 }));
    assert_eq!(store.bulk_log().len(), 1);
}

#[tokio::test]
async fn test_close_is_bounded() {
    let store = store(2);
    store.set_latency(Duration::from_millis(500));
    let queue = queue(
        &store,
        BulkQueueConfig {
            close_timeout_ms: 50,
            ..config()
        },
    );

    queue.update_field("r0", "label", json!("x")).await;
    queue.update_field("r1", "label", json!("y")).await;

    let started = Instant::now();
    let err = queue.close().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(matches!(err, Error::CloseTimeout { pending: 2, .. }));
}

#[tokio::test]
async fn test_update_after_close_is_dropped() {
    let store = store(2);
    let queue = queue(&store, config());

    queue.update_field("r0", "label", json!("x")).await;
    queue.close().await.unwrap();
    assert!(queue.is_closed());

    queue.update_field("r1", "label", json!("y")).await;
    let stats = queue.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(store.bulk_log().len(), 1);
    assert!(store.get("tweets", "r1").unwrap().get("label").is_none());

    let err = queue.close().await.unwrap_err();
    assert!(matches!(err, Error::FlushFailed { dropped: 1 }));
}

#[tokio::test]
async fn test_empty_changes_ignored() {
    let store = store(1);
    let queue = queue(&store, config());

    queue.update("r0", Changes::new()).await;
    queue.close().await.unwrap();

    assert_eq!(queue.stats().accepted, 0);
    assert!(store.bulk_log().is_empty());
}

#[tokio::test]
async fn test_drop_without_close_still_flushes() {
    let store = store(3);
    let queue = queue(&store, config());

    for i in 0..3 {
        queue.update_field(&format!("r{i}"), "label", json!("z")).await;
    }
    drop(queue);

    wait_for("flush on drop", || store.bulk_log().len() == 1).await;
    wait_for("update applied", || {
        store
            .get("tweets", "r2")
            .and_then(|doc| doc.get("label").cloned())
            .is_some()
    })
    .await;
}

#[tokio::test]
async fn test_invalid_config_rejected_before_spawn() {
    let store = store(1);
    let result = BulkWriteQueue::new(
        Arc::new(Connection::from_store(Arc::clone(&store))),
        "tweets",
        BulkQueueConfig {
            flush_interval_ms: 0,
            ..config()
        },
    );
    assert!(matches!(result, Err(Error::Config(ref m)) if m.contains("flush_interval_ms")));
}

#[tokio::test]
async fn test_close_timeout_stops_batcher() {
    let store = store(3);
    store.fail_always(Operation::BulkUpdate, StoreError::Transport("down".into()));
    let queue = queue(
        &store,
        BulkQueueConfig {
            close_timeout_ms: 100,
            ..config()
        },
    );

    for i in 0..3 {
        queue.update_field(&format!("r{i}"), "label", json!("x")).await;
    }
    let err = queue.close().await.unwrap_err();
    assert!(matches!(err, Error::CloseTimeout { pending: 3, .. }));

    wait_for("unfinished writes dropped", || queue.stats().dropped == 3).await;
    let calls = store.calls(Operation::BulkUpdate);
    assert!(calls > 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.calls(Operation::BulkUpdate), calls);
    assert_eq!(queue.stats().pending(), 0);
}

#[tokio::test]
async fn test_dropped_queue_gives_up_on_failing_batch() {
    let store = store(2);
    store.fail_always(Operation::BulkUpdate, StoreError::Transport("down".into()));
    let queue = queue(&store, config());

    queue.update_field("r0", "label", json!("x")).await;
    queue.update_field("r1", "label", json!("y")).await;
    drop(queue);

    // one call plus max_retries retries, then no re-queue
    wait_for("retries used up", || store.calls(Operation::BulkUpdate) == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.calls(Operation::BulkUpdate), 3);
}
