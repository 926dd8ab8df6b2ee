//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了按自增ID管理实体的回写缓存门面。
//!
//! 门面把预取器、批量保存器和键值缓存组合在一起：新实体从预取器领取ID，
//! 过期时经 `marshal` 转成数据库记录后交给批量保存器落库。

pub mod item;

use crate::backend::database_cache::DataBaseCacheWithKey;
use crate::backend::ttl::EvictionReason;
use crate::callback::{
    DeleteFunc, FetchFunc, LoadFromDatabaseFunc, LoadFunc, MarshalFunc, SaveDatabaseFunc,
    SaveFunc,
};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::sync::fetch::Fetch;
use crate::sync::save::Save;
use futures::FutureExt;
use item::{CacheItem, DbItem, MemoryItem};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

/// 回写缓存门面
pub struct Cache<T, D> {
    name: String,
    fetch: Arc<Fetch<D>>,
    save: Arc<Save<D>>,
    cache: Arc<DataBaseCacheWithKey<i64, CacheItem<T, D>>>,
    delete_fn: DeleteFunc<D>,
}

impl<T: MemoryItem, D: DbItem> Cache<T, D> {
    /// 创建回写缓存
    ///
    /// # 参数
    ///
    /// * `config` - 缓存配置
    /// * `marshal` - 保存前把内存对象写到数据库记录上
    /// * `fetch_fn` - 预分配数据库记录
    /// * `save_fn` - 批量持久化记录
    /// * `load_fn` - 按ID加载实体
    /// * `delete_fn` - 回收未使用的预分配记录
    ///
    /// # 返回值
    ///
    /// 配置无效时返回 `CacheError::ConfigError`
    pub fn new(
        config: Config,
        marshal: MarshalFunc<T, D>,
        fetch_fn: FetchFunc<D>,
        save_fn: SaveFunc<D>,
        load_fn: LoadFunc<T, D>,
        delete_fn: DeleteFunc<D>,
    ) -> Result<Self> {
        config.validate()?;

        let fetch = Arc::new(Fetch::new(&config, fetch_fn));
        let save = Arc::new(Save::new(&config, save_fn));

        let save_database: SaveDatabaseFunc<i64, CacheItem<T, D>> = {
            let save = save.clone();
            Arc::new(move |id: i64, item: CacheItem<T, D>, reason: EvictionReason| {
                let save = save.clone();
                let marshal = marshal.clone();
                async move {
                    let record = item.marshal(&marshal);
                    match save.save(record).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("条目 {} 推入保存器失败 (reason={:?}): {}", id, reason, e);
                            false
                        }
                    }
                }
                .boxed()
            })
        };

        let load_from_database: LoadFromDatabaseFunc<i64, CacheItem<T, D>> =
            Arc::new(move |id: i64| {
                let loading = load_fn(id);
                async move {
                    let (item, record) = loading.await?;
                    Ok(CacheItem::new(Arc::new(item), record))
                }
                .boxed()
            });

        let cache = Arc::new(DataBaseCacheWithKey::new_with_context(
            config.name.clone(),
            config.ttl(),
            config.context.clone(),
            save_database,
            load_from_database,
        ));
        if !config.enable_save {
            cache.disable_save();
        }

        info!(
            "创建回写缓存 {}: ttl={:?}, fetch_size={}, save_size={}, buffer_size={}",
            config.name,
            config.ttl(),
            config.fetch_size,
            config.save_size,
            config.buffer_size()
        );

        Ok(Self {
            name: config.name,
            fetch,
            save,
            cache,
            delete_fn,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 写入新实体
    ///
    /// 实体ID为0时从预取器领取一条记录并把它的ID赋给实体；
    /// ID大于0的实体必须已经在缓存中，否则返回 `CacheError::NotTracked`
    #[instrument(skip_all, level = "debug", fields(cache = %self.name))]
    pub async fn set(&self, mut item: T) -> Result<Arc<T>> {
        let id = item.id();
        if id > 0 {
            return match self.cache.get_pure(&id) {
                Some(tracked) => Ok(tracked.memory_item().clone()),
                None => {
                    error!("BUG: 条目 {} 已有ID但未被缓存跟踪，set 只用于新建条目", id);
                    Err(CacheError::NotTracked(id))
                }
            };
        }

        let record = self.fetch.fetch().await?;
        let id = record.id();
        item.set_id(id);

        let item = Arc::new(item);
        self.cache
            .set(id, CacheItem::new(item.clone(), record))
            .await;
        Ok(item)
    }

    /// 按ID读取实体，内存未命中时通过 `load_fn` 加载
    pub async fn get(&self, id: i64) -> Option<Arc<T>> {
        self.cache
            .get(&id)
            .await
            .map(|item| item.memory_item().clone())
    }

    /// 删除实体，删除前仍会保存一次
    pub async fn delete(&self, id: i64) {
        self.cache.delete(&id).await;
    }

    pub fn count(&self) -> usize {
        self.cache.count()
    }

    pub fn enable_save(&self) {
        self.cache.enable_save();
    }

    pub fn disable_save(&self) {
        self.cache.disable_save();
    }

    pub fn is_save_disabled(&self) -> bool {
        self.cache.is_save_disabled()
    }

    /// 在调用方的任务跟踪器上关闭缓存
    ///
    /// 回收未使用的预取记录与保存全部常驻实体并行进行；
    /// 保存器在键值缓存关闭之后才关闭，确保关闭过程中产生的记录都能落库。
    /// 多个缓存可以共用同一个跟踪器并行关闭。
    pub fn close_with(&self, tracker: &TaskTracker) {
        self.fetch.delete_rest(self.delete_fn.clone(), tracker);

        let cache = self.cache.clone();
        let save = self.save.clone();
        tracker.spawn(async move {
            cache.enable_save();
            cache.close().await;
            save.close().await;
        });
    }

    /// 关闭缓存并等待所有工作完成
    #[instrument(skip_all, level = "info", fields(cache = %self.name))]
    pub async fn close(&self) {
        let tracker = TaskTracker::new();
        self.close_with(&tracker);
        tracker.close();
        tracker.wait().await;
        info!("回写缓存 {} 已关闭", self.name);
    }
}
