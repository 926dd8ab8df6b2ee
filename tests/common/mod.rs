//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了测试的通用工具函数和模拟数据库。

#![allow(dead_code)]

use asyncdb::callback::{
    DeleteFunc, FetchFunc, LoadFromDatabaseFunc, LoadFunc, MarshalFunc, SaveDatabaseFunc,
    SaveFunc,
};
use asyncdb::{CacheError, DbItem, EvictionReason, MemoryItem};
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn setup_logging() {
    asyncdb::utils::setup_logging();
}

pub fn unique_name(base: &str) -> String {
    asyncdb::utils::generate_unique_cache_name(base)
}

/// 轮询直到条件成立或超时
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// 键值缓存使用的模拟数据库
///
/// 可以注入保存延迟、保存失败和保存panic
#[derive(Default)]
pub struct MockDatabase {
    pub rows: DashMap<String, String>,
    saves: Mutex<Vec<(String, String, EvictionReason)>>,
    save_attempts: AtomicUsize,
    load_calls: AtomicUsize,
    pub fail_saves: AtomicBool,
    pub panic_saves: AtomicBool,
    pub save_delay_ms: AtomicU64,
}

impl MockDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn save_fn(self: &Arc<Self>) -> SaveDatabaseFunc<String, String> {
        let db = self.clone();
        Arc::new(move |key: String, value: String, reason: EvictionReason| {
            let db = db.clone();
            async move {
                db.save_attempts.fetch_add(1, Ordering::SeqCst);
                let delay = db.save_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if db.panic_saves.load(Ordering::SeqCst) {
                    panic!("模拟保存 {} 时panic", key);
                }
                if db.fail_saves.load(Ordering::SeqCst) {
                    return false;
                }
                db.rows.insert(key.clone(), value.clone());
                db.saves.lock().unwrap().push((key, value, reason));
                true
            }
            .boxed()
        })
    }

    pub fn load_fn(self: &Arc<Self>) -> LoadFromDatabaseFunc<String, String> {
        let db = self.clone();
        Arc::new(move |key: String| {
            let db = db.clone();
            async move {
                db.load_calls.fetch_add(1, Ordering::SeqCst);
                db.rows
                    .get(&key)
                    .map(|value| value.clone())
                    .ok_or(CacheError::NotFound(key))
            }
            .boxed()
        })
    }

    /// 成功保存的记录
    pub fn saves(&self) -> Vec<(String, String, EvictionReason)> {
        self.saves.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    /// 保存函数被调用的次数，包括失败和panic
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

/// 门面测试使用的内存实体
#[derive(Debug, Default)]
pub struct User {
    id: i64,
    pub name: Mutex<String>,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: Mutex::new(name.to_string()),
        }
    }

    pub fn with_id(id: i64, name: &str) -> Self {
        Self {
            id,
            name: Mutex::new(name.to_string()),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn rename(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }
}

impl MemoryItem for User {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

/// 门面测试使用的数据库记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
}

impl DbItem for UserRecord {
    fn id(&self) -> i64 {
        self.id
    }
}

/// 以自增ID预分配记录的模拟用户表
#[derive(Default)]
pub struct MockUserStore {
    next_id: AtomicI64,
    pub rows: DashMap<i64, UserRecord>,
    batches: Mutex<Vec<Vec<UserRecord>>>,
    deleted: Mutex<Vec<UserRecord>>,
    load_calls: AtomicUsize,
    pub panic_on_fetch: AtomicBool,
}

impl MockUserStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 已分配过的最大ID
    pub fn allocated(&self) -> i64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn fetch_fn(self: &Arc<Self>) -> FetchFunc<UserRecord> {
        let store = self.clone();
        Arc::new(move |token: CancellationToken, size: usize| {
            if store.panic_on_fetch.load(Ordering::SeqCst) {
                panic!("模拟预取panic");
            }
            let (tx, rx) = mpsc::channel(size.max(1));
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..size {
                    let id = store.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let record = UserRecord {
                        id,
                        name: String::new(),
                    };
                    tokio::select! {
                        _ = token.cancelled() => break,
                        res = tx.send(record) => if res.is_err() { break },
                    }
                }
            });
            rx
        })
    }

    pub fn save_fn(self: &Arc<Self>) -> SaveFunc<UserRecord> {
        let store = self.clone();
        Arc::new(move |records: Vec<UserRecord>| {
            let store = store.clone();
            async move {
                for record in &records {
                    store.rows.insert(record.id, record.clone());
                }
                store.batches.lock().unwrap().push(records);
            }
            .boxed()
        })
    }

    pub fn load_fn(self: &Arc<Self>) -> LoadFunc<User, UserRecord> {
        let store = self.clone();
        Arc::new(move |id: i64| {
            let store = store.clone();
            async move {
                store.load_calls.fetch_add(1, Ordering::SeqCst);
                let record = store
                    .rows
                    .get(&id)
                    .map(|record| record.clone())
                    .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
                Ok((User::with_id(id, &record.name), record))
            }
            .boxed()
        })
    }

    pub fn delete_fn(self: &Arc<Self>) -> DeleteFunc<UserRecord> {
        let store = self.clone();
        Arc::new(move |records: Vec<UserRecord>| {
            let store = store.clone();
            async move {
                store.deleted.lock().unwrap().extend(records);
            }
            .boxed()
        })
    }

    pub fn marshal_fn() -> MarshalFunc<User, UserRecord> {
        Arc::new(|user: &User, record: &mut UserRecord| {
            record.name = user.name();
        })
    }

    pub fn saved_records(&self) -> Vec<UserRecord> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn deleted(&self) -> Vec<UserRecord> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}
