//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了过期通知层，基于Moka的TTL淘汰和淘汰监听器。
//!
//! 监听器不会回调缓存本身，而是把过期事件发送到内部通道，由缓存的分发任务处理。

use moka::future::Cache;
use moka::notification::RemovalCause;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// 淘汰原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// 被显式删除
    Removed,
    /// 超出容量被淘汰
    EvictedSize,
    /// TTL到期
    Expired,
    /// 缓存关闭
    Closed,
}

impl EvictionReason {
    fn from_cause(cause: RemovalCause, closing: bool) -> Option<Self> {
        match cause {
            RemovalCause::Replaced => None,
            RemovalCause::Expired => Some(EvictionReason::Expired),
            RemovalCause::Size => Some(EvictionReason::EvictedSize),
            RemovalCause::Explicit if closing => Some(EvictionReason::Closed),
            RemovalCause::Explicit => Some(EvictionReason::Removed),
        }
    }
}

/// 过期事件
///
/// 持有任务跟踪令牌，在事件被处理完之前等待跟踪器的一方不会返回
#[derive(Debug)]
pub struct Expiration {
    pub key: String,
    pub reason: EvictionReason,
    pub token: TaskTrackerToken,
}

/// TTL过期通知层
pub struct TtlLayer {
    cache: Cache<String, ()>,
    ttl: Duration,
    closing: Arc<AtomicBool>,
}

impl TtlLayer {
    /// 创建新的过期通知层
    ///
    /// # 参数
    ///
    /// * `ttl` - 条目的存活时间
    /// * `tracker` - 用于登记未处理事件的任务跟踪器
    ///
    /// # 返回值
    ///
    /// 返回过期通知层和过期事件的接收端
    pub fn new(ttl: Duration, tracker: TaskTracker) -> (Self, mpsc::UnboundedReceiver<Expiration>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));

        let listener_closing = closing.clone();
        let listener = move |key: Arc<String>, _value: (), cause: RemovalCause| {
            let Some(reason) =
                EvictionReason::from_cause(cause, listener_closing.load(Ordering::Acquire))
            else {
                return;
            };
            let event = Expiration {
                key: key.as_ref().clone(),
                reason,
                token: tracker.token(),
            };
            if let Err(e) = tx.send(event) {
                debug!("过期事件通道已关闭，丢弃事件: key={}", e.0.key);
            }
        };

        let cache = Cache::builder()
            .time_to_live(ttl)
            .eviction_listener(listener)
            .build();

        (
            Self {
                cache,
                ttl,
                closing,
            },
            rx,
        )
    }

    /// 登记或续期一个键
    #[instrument(skip(self), level = "trace")]
    pub async fn arm(&self, key: &str) {
        self.cache.insert(key.to_string(), ()).await;
    }

    /// 移除一个键，触发 `Removed`（关闭期间为 `Closed`）事件
    #[instrument(skip(self), level = "trace")]
    pub async fn remove(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// 执行挂起的维护任务，让已过期的条目发出事件
    pub async fn sweep(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// 键是否仍被登记
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// 标记进入关闭流程，之后的显式移除以 `Closed` 原因上报
    pub fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::Release);
    }

    /// 是否处于关闭流程中
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 后台清扫间隔，取TTL的四分之一并限制在10毫秒到1秒之间
    pub fn sweep_interval(&self) -> Duration {
        (self.ttl / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }
}
