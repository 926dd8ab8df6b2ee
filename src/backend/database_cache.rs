//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了带延迟持久化的键值缓存。
//!
//! 条目写入后常驻内存，TTL到期时才通过 `SaveDatabaseFunc` 落库。
//! 保存期间被读取的条目会被恢复而不是删除；保存失败的条目同样恢复，
//! 在下一次自然过期时重试。

use super::status::{CacheEntry, Status};
use super::ttl::{EvictionReason, Expiration, TtlLayer};
use crate::callback::{LoadFromDatabaseFunc, SaveDatabaseFunc};
use crate::metrics::GLOBAL_METRICS;
use crate::utils::{install_panic_backtrace_hook, panic_message, take_panic_backtrace};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

type EntryMap<K, T> = DashMap<String, CacheEntry<K, T>, ahash::RandomState>;

/// 带延迟持久化的键值缓存
///
/// 键通过 `Display` 转成字符串后存放。必须在 Tokio 运行时中创建，
/// 创建时会启动过期清扫任务和过期事件分发任务。
pub struct DataBaseCacheWithKey<K, T> {
    inner: Arc<Inner<K, T>>,
}

struct Inner<K, T> {
    name: String,
    map: EntryMap<K, T>,
    ttl: TtlLayer,
    save_disabled: AtomicBool,
    generation: AtomicU64,
    save_database: SaveDatabaseFunc<K, T>,
    load_from_database: LoadFromDatabaseFunc<K, T>,
    /// 跟踪未处理的过期事件和进行中的保存
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<K, T> DataBaseCacheWithKey<K, T>
where
    K: Display + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// 创建新的缓存
    ///
    /// # 参数
    ///
    /// * `name` - 缓存名称，用于日志和指标
    /// * `ttl` - 条目的存活时间，到期后触发保存
    /// * `save_database` - 持久化单个条目
    /// * `load_from_database` - 缓存未命中时加载条目
    pub fn new(
        name: impl Into<String>,
        ttl: Duration,
        save_database: SaveDatabaseFunc<K, T>,
        load_from_database: LoadFromDatabaseFunc<K, T>,
    ) -> Self {
        Self::new_with_context(
            name,
            ttl,
            CancellationToken::new(),
            save_database,
            load_from_database,
        )
    }

    /// 创建受生命周期上下文控制的缓存
    ///
    /// 上下文取消后清扫和分发任务停止，条目不再自动过期；`close` 仍会保存所有常驻条目
    pub fn new_with_context(
        name: impl Into<String>,
        ttl: Duration,
        context: CancellationToken,
        save_database: SaveDatabaseFunc<K, T>,
        load_from_database: LoadFromDatabaseFunc<K, T>,
    ) -> Self {
        install_panic_backtrace_hook();
        let tracker = TaskTracker::new();
        let (ttl, events) = TtlLayer::new(ttl, tracker.clone());
        let inner = Arc::new(Inner {
            name: name.into(),
            map: DashMap::with_hasher(ahash::RandomState::new()),
            ttl,
            save_disabled: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            save_database,
            load_from_database,
            tracker,
            shutdown: context.child_token(),
        });
        info!(
            "创建缓存 {}: ttl={:?}, sweep_interval={:?}",
            inner.name,
            inner.ttl.ttl(),
            inner.ttl.sweep_interval()
        );

        tokio::spawn(inner.clone().sweep_loop());
        tokio::spawn(inner.clone().dispatch_loop(events));

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 写入条目
    ///
    /// 条目以 `Normal` 状态写入并刷新过期时间。键已存在时记录警告后覆盖。
    #[instrument(skip_all, level = "debug", fields(cache = %self.inner.name, key = %key))]
    pub async fn set(&self, key: K, value: T) {
        self.inner.set(key, value).await
    }

    /// 仅从内存读取
    ///
    /// 如果条目正在保存，会将其标记为 `Update`，保存完成后条目被保留
    pub fn get_pure(&self, key: &K) -> Option<T> {
        self.inner.get_pure(&key.to_string())
    }

    /// 读取条目，内存未命中时从数据库加载
    ///
    /// 加载失败视为未命中
    #[instrument(skip_all, level = "debug", fields(cache = %self.inner.name, key = %key))]
    pub async fn get(&self, key: &K) -> Option<T> {
        self.inner.get(key).await
    }

    /// 删除条目
    ///
    /// 只从过期层移除，条目会和自然过期一样经过保存流程
    #[instrument(skip_all, level = "debug", fields(cache = %self.inner.name, key = %key))]
    pub async fn delete(&self, key: &K) {
        self.inner.ttl.remove(&key.to_string()).await;
    }

    pub fn enable_save(&self) {
        self.inner.enable_save();
    }

    /// 暂停持久化，期间到期的条目只会被续期
    pub fn disable_save(&self) {
        self.inner.disable_save();
    }

    pub fn is_save_disabled(&self) -> bool {
        self.inner.is_save_disabled()
    }

    /// 查询条目当前状态，不存在时返回 `NotFound`
    pub fn status(&self, key: &K) -> Status {
        self.inner
            .map
            .get(&key.to_string())
            .map(|entry| entry.status.load())
            .unwrap_or(Status::NotFound)
    }

    /// 遍历所有条目
    ///
    /// 回调期间持有分片读锁，回调内不要写入本缓存
    pub fn for_each(&self, mut f: impl FnMut(&K, &T)) {
        for entry in self.inner.map.iter() {
            f(&entry.key, &entry.memory_item);
        }
    }

    pub fn count(&self) -> usize {
        self.inner.map.len()
    }

    /// 获取所有条目的快照
    pub fn get_all(&self) -> Vec<(K, T)> {
        self.inner
            .map
            .iter()
            .map(|entry| (entry.key.clone(), entry.memory_item.clone()))
            .collect()
    }

    /// 关闭缓存
    ///
    /// 强制所有常驻条目经过保存流程，等待全部保存完成后清空内存
    #[instrument(skip_all, level = "info", fields(cache = %self.inner.name))]
    pub async fn close(&self) {
        let inner = &self.inner;
        info!("关闭缓存，常驻条目数: {}", inner.map.len());

        inner.ttl.set_closing(true);
        inner.enable_save();

        let keys: Vec<String> = inner.map.iter().map(|entry| entry.key().clone()).collect();
        for key in &keys {
            inner.ttl.remove(key).await;
        }

        inner.tracker.close();
        inner.tracker.wait().await;
        inner.tracker.reopen();

        // 上下文取消后分发任务已退出，过期事件无人处理；保存期间被访问而恢复的条目
        // 关闭时也不会续期。剩余条目在这里直接保存
        let rest: Vec<String> = inner.map.iter().map(|entry| entry.key().clone()).collect();
        if !rest.is_empty() {
            debug!("直接保存剩余的 {} 个条目", rest.len());
            for key in rest {
                let inner = inner.clone();
                inner
                    .tracker
                    .clone()
                    .spawn(async move { inner.save(key, EvictionReason::Closed).await });
            }
            inner.tracker.close();
            inner.tracker.wait().await;
            inner.tracker.reopen();
        }

        inner.disable_save();

        let left = inner.map.len();
        if left > 0 {
            error!("关闭时仍有 {} 个条目未能持久化，已从内存中丢弃", left);
        }
        inner.map.clear();
        inner.shutdown.cancel();
        info!("缓存已关闭");
    }
}

impl<K, T> Drop for DataBaseCacheWithKey<K, T> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl<K, T> Inner<K, T>
where
    K: Display + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn enable_save(&self) {
        self.save_disabled.store(false, Ordering::Release);
    }

    fn disable_save(&self) {
        self.save_disabled.store(true, Ordering::Release);
    }

    fn is_save_disabled(&self) -> bool {
        self.save_disabled.load(Ordering::Acquire)
    }

    async fn set(&self, key: K, value: T) {
        let k = key.to_string();
        let entry = CacheEntry::new(key, value, self.next_generation());
        if let Some(old) = self.map.insert(k.clone(), entry) {
            warn!(
                "BUG: 键已存在，覆盖旧条目: key={}, old_status={:?}",
                k,
                old.status.load()
            );
        }
        self.ttl.arm(&k).await;
    }

    fn get_pure(&self, key: &str) -> Option<T> {
        match self.map.get(key) {
            Some(entry) => {
                if entry.status.transition(Status::Save, Status::Update) {
                    debug!("条目在保存期间被访问，标记为Update: key={}", key);
                }
                GLOBAL_METRICS.record_request(&self.name, "get", "hit");
                Some(entry.memory_item.clone())
            }
            None => {
                GLOBAL_METRICS.record_request(&self.name, "get", "miss");
                None
            }
        }
    }

    async fn get(&self, key: &K) -> Option<T> {
        let k = key.to_string();
        if let Some(value) = self.get_pure(&k) {
            return Some(value);
        }

        let loaded = match (self.load_from_database)(key.clone()).await {
            Ok(value) => value,
            Err(e) => {
                debug!("从数据库加载失败: key={}, error={}", k, e);
                GLOBAL_METRICS.record_request(&self.name, "load", "fail");
                return None;
            }
        };
        GLOBAL_METRICS.record_request(&self.name, "load", "ok");

        // 加载期间可能有并发写入，内存中的值优先
        {
            match self.map.entry(k.clone()) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.get();
                    entry.status.transition(Status::Save, Status::Update);
                    debug!("加载期间键已被写入，保留内存中的值: key={}", k);
                    return Some(entry.memory_item.clone());
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(CacheEntry::new(
                        key.clone(),
                        loaded.clone(),
                        self.next_generation(),
                    ));
                }
            }
        }
        self.ttl.arm(&k).await;
        Some(loaded)
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.ttl.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.ttl.sweep().await,
            }
        }
        debug!("缓存 {} 清扫任务退出", self.name);
    }

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Expiration>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.clone().on_expired(event).await,
                    None => break,
                },
            }
        }
        debug!("缓存 {} 分发任务退出", self.name);
    }

    async fn on_expired(self: Arc<Self>, event: Expiration) {
        let Expiration { key, reason, token } = event;

        if self.is_save_disabled() {
            if self.map.contains_key(&key) {
                debug!("保存已禁用，续期: key={}, reason={:?}", key, reason);
                self.ttl.arm(&key).await;
            }
            drop(token);
            return;
        }

        let inner = self.clone();
        self.tracker.spawn(async move {
            inner.save(key, reason).await;
            drop(token);
        });
    }

    async fn save(&self, key: String, reason: EvictionReason) {
        let (generation, k, value) = {
            let Some(entry) = self.map.get(&key) else {
                error!("BUG: 保存回调对应的键不在内存中: key={}", key);
                return;
            };
            if !entry.status.transition(Status::Normal, Status::Save) {
                warn!(
                    "BUG: 条目已在保存中，忽略重复保存: key={}, status={:?}",
                    key,
                    entry.status.load()
                );
                return;
            }
            (entry.generation, entry.key.clone(), entry.memory_item.clone())
        };

        let saved = match AssertUnwindSafe(async { (self.save_database)(k, value, reason).await })
            .catch_unwind()
            .await
        {
            Ok(saved) => saved,
            Err(payload) => {
                error!(
                    "保存时发生panic，按保存失败处理: key={}, panic={}\n{}",
                    key,
                    panic_message(payload.as_ref()),
                    take_panic_backtrace()
                );
                GLOBAL_METRICS.record_request(&self.name, "save", "panic");
                false
            }
        };

        if saved {
            let removed = self
                .map
                .remove_if(&key, |_, entry| {
                    entry.generation == generation && entry.status.load() == Status::Save
                })
                .is_some();
            if removed {
                debug!("保存成功，从内存移除: key={}, reason={:?}", key, reason);
                GLOBAL_METRICS.record_request(&self.name, "save", "ok");
                return;
            }

            GLOBAL_METRICS.record_request(&self.name, "save", "restore");
            if self.restore(&key, generation) {
                debug!("保存期间条目被访问，恢复为Normal: key={}", key);
                self.rearm(&key).await;
            }
        } else {
            warn!("保存失败，条目保留在内存中等待下次过期: key={}", key);
            GLOBAL_METRICS.record_request(&self.name, "save", "fail");
            if self.restore(&key, generation) {
                self.rearm(&key).await;
            }
        }
    }

    /// 将保存开始时的条目恢复为 `Normal`
    ///
    /// 条目已被新的写入替换时返回 `false`，新条目已自行登记过期
    fn restore(&self, key: &str, generation: u64) -> bool {
        match self.map.get(key) {
            Some(entry) if entry.generation == generation => {
                entry.status.store(Status::Normal);
                true
            }
            _ => false,
        }
    }

    async fn rearm(&self, key: &str) {
        if self.ttl.is_closing() {
            debug!("缓存关闭中，不再续期: key={}", key);
            return;
        }
        self.ttl.arm(key).await;
    }
}
