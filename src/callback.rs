//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存与持久化层之间的回调函数类型。
//!
//! 回写缓存本身不关心数据库驱动和表结构，所有存储交互都通过这里的函数类型完成。

use crate::backend::ttl::EvictionReason;
use crate::error::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 持久化单个条目，失败时返回 `false`，条目会在下次过期时重试
pub type SaveDatabaseFunc<K, T> =
    Arc<dyn Fn(K, T, EvictionReason) -> BoxFuture<'static, bool> + Send + Sync>;

/// 缓存未命中时从数据库加载单个条目
pub type LoadFromDatabaseFunc<K, T> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// 在持久化之前把内存对象的字段复制到数据库记录上
pub type MarshalFunc<T, D> = Arc<dyn Fn(&T, &mut D) + Send + Sync>;

/// 预分配一批数据库记录，通过返回的通道逐条交付
pub type FetchFunc<D> = Arc<dyn Fn(CancellationToken, usize) -> mpsc::Receiver<D> + Send + Sync>;

/// 回收预取但从未使用的记录
pub type DeleteFunc<D> = Arc<dyn Fn(Vec<D>) -> BoxFuture<'static, ()> + Send + Sync>;

/// 批量持久化记录
pub type SaveFunc<D> = Arc<dyn Fn(Vec<D>) -> BoxFuture<'static, ()> + Send + Sync>;

/// 按ID同时加载内存对象和数据库记录
pub type LoadFunc<T, D> = Arc<dyn Fn(i64) -> BoxFuture<'static, Result<(T, D)>> + Send + Sync>;
