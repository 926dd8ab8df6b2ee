//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 预取器集成测试

use asyncdb::{CacheError, Config, Fetch};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

#[path = "../common/mod.rs"]
mod common;

use common::{wait_until, MockUserStore};

fn config(fetch_size: usize) -> Config {
    Config::new()
        .with_name(common::unique_name("fetch"))
        .with_fetch_size(fetch_size)
        .with_save_size(1)
}

/// 测试取出的ID唯一且递增
#[tokio::test]
async fn test_fetch_unique_increasing_ids() {
    common::setup_logging();
    let store = MockUserStore::new();
    let fetch = Fetch::new(&config(10), store.fetch_fn());

    let mut last = 0;
    for _ in 0..25 {
        let record = fetch.fetch().await.unwrap();
        assert!(record.id > last, "ID没有递增: {} <= {}", record.id, last);
        last = record.id;
    }
    fetch.close().await;
}

/// 测试回收的记录恰好是未被取出的记录
#[tokio::test]
async fn test_delete_rest_returns_unused_records() {
    common::setup_logging();
    let store = MockUserStore::new();
    let fetch = Arc::new(Fetch::new(&config(10), store.fetch_fn()));

    let mut consumed = Vec::new();
    for _ in 0..3 {
        consumed.push(fetch.fetch().await.unwrap().id);
    }
    // 等待缓冲区被补满
    assert!(wait_until(Duration::from_secs(1), || store.allocated() >= 40).await);

    let tracker = TaskTracker::new();
    fetch.delete_rest(store.delete_fn(), &tracker);
    tracker.close();
    tracker.wait().await;

    let deleted: Vec<i64> = store.deleted().iter().map(|r| r.id).collect();
    assert!(!deleted.is_empty());

    let consumed_set: HashSet<i64> = consumed.iter().copied().collect();
    let deleted_set: HashSet<i64> = deleted.iter().copied().collect();
    assert_eq!(deleted_set.len(), deleted.len());
    assert!(consumed_set.is_disjoint(&deleted_set));

    let all: HashSet<i64> = consumed_set.union(&deleted_set).copied().collect();
    let max = all.iter().copied().max().unwrap();
    assert_eq!(all, (1..=max).collect::<HashSet<i64>>());
}

/// 测试关闭后取出返回 Closed
#[tokio::test]
async fn test_fetch_after_close() {
    common::setup_logging();
    let store = MockUserStore::new();
    let fetch = Fetch::new(&config(5), store.fetch_fn());

    fetch.fetch().await.unwrap();
    fetch.close().await;
    assert!(matches!(fetch.fetch().await, Err(CacheError::Closed)));
}

/// 测试取消生命周期上下文后取出返回 Closed
#[tokio::test]
async fn test_context_cancel_closes_fetch() {
    common::setup_logging();
    let store = MockUserStore::new();
    let config = config(5);
    let context = config.context.clone();
    let fetch = Fetch::new(&config, store.fetch_fn());

    context.cancel();
    assert!(matches!(fetch.fetch().await, Err(CacheError::Closed)));
}

/// 测试补充任务意外退出后取出返回 Exhausted
#[tokio::test]
async fn test_refill_panic_exhausts_fetch() {
    common::setup_logging();
    let store = MockUserStore::new();
    store.panic_on_fetch.store(true, Ordering::SeqCst);
    let fetch = Fetch::new(&config(5), store.fetch_fn());

    let result = tokio::time::timeout(Duration::from_secs(1), fetch.fetch()).await;
    assert!(matches!(result, Ok(Err(CacheError::Exhausted))));
}
