//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了批量保存器，把逐条推入的记录合并成批次交给 `SaveFunc`。
//!
//! 批次在数量达到当前批量大小或刷新定时器到期时提交。数量触发的刷新之后，
//! 根据缓冲区积压调整批量大小：积压超过目标两倍时放大十倍，超过目标时放大五倍，
//! 否则恢复为配置值。
//!
//! 同时进行的批量保存最多 `MAX_INFLIGHT_BATCHES` 个，持久化变慢时刷新任务停下，
//! 缓冲区随之填满，`save` 开始等待。

use crate::callback::SaveFunc;
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::utils::{install_panic_backtrace_hook, panic_message, take_panic_backtrace};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// 单次推入超过该时长时记录警告
const SLOW_PUSH_THRESHOLD: Duration = Duration::from_secs(1);
/// 同时进行的批量保存任务上限
pub const MAX_INFLIGHT_BATCHES: usize = 4;

/// 批量保存器
pub struct Save<D> {
    name: String,
    sender: RwLock<Option<mpsc::Sender<D>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// 跟踪进行中的批量保存任务
    tracker: TaskTracker,
}

impl<D: Send + 'static> Save<D> {
    /// 创建批量保存器并启动后台刷新任务
    ///
    /// # 参数
    ///
    /// * `config` - 提供名称、缓冲区大小、批量大小、刷新超时和生命周期上下文
    /// * `save_fn` - 批量持久化函数
    pub fn new(config: &Config, save_fn: SaveFunc<D>) -> Self {
        install_panic_backtrace_hook();
        let (sender, receiver) = mpsc::channel(config.buffer_size());
        let tracker = TaskTracker::new();

        let worker = SaveLoop {
            name: config.name.clone(),
            save_fn,
            configured_size: config.save_size.max(1),
            timeout: config.save_timeout(),
            context: config.context.clone(),
            tracker: tracker.clone(),
            inflight: Arc::new(Semaphore::new(MAX_INFLIGHT_BATCHES)),
        };
        let handle = tokio::spawn(worker.run(receiver));

        Self {
            name: config.name.clone(),
            sender: RwLock::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            tracker,
        }
    }

    /// 推入一条待保存记录
    ///
    /// 缓冲区已满时等待；关闭后返回 `CacheError::Closed`。
    /// 生命周期上下文取消后仍可推入，记录在 `close` 时全部落库
    pub async fn save(&self, item: D) -> Result<()> {
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(CacheError::Closed)?;

        let start = Instant::now();
        sender.send(item).await.map_err(|_| CacheError::Closed)?;

        let elapsed = start.elapsed();
        if elapsed > SLOW_PUSH_THRESHOLD {
            warn!(
                "保存器 {} 推入耗时 {:?}，缓冲区可能已饱和",
                self.name, elapsed
            );
        }
        Ok(())
    }

    /// 关闭保存器
    ///
    /// 关闭输入、刷新剩余记录，并等待所有批量保存任务完成
    #[instrument(skip(self), level = "info", fields(name = %self.name))]
    pub async fn close(&self) {
        drop(self.sender.write().await.take());

        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("保存器 {} 刷新任务异常退出: {}", self.name, e);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("保存器 {} 已关闭", self.name);
    }
}

struct SaveLoop<D> {
    name: String,
    save_fn: SaveFunc<D>,
    configured_size: usize,
    timeout: Duration,
    context: CancellationToken,
    tracker: TaskTracker,
    inflight: Arc<Semaphore>,
}

impl<D: Send + 'static> SaveLoop<D> {
    async fn run(self, mut receiver: mpsc::Receiver<D>) {
        let mut current_size = self.configured_size;
        let mut batch = Vec::with_capacity(current_size);
        let mut ticker = interval_at(Instant::now() + self.timeout, self.timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancelled = false;

        loop {
            tokio::select! {
                item = receiver.recv() => match item {
                    Some(item) => {
                        batch.push(item);
                        if batch.len() >= current_size {
                            self.flush(&mut batch).await;
                            let backlog = receiver.len();
                            current_size = next_save_size(current_size, self.configured_size, backlog);
                            GLOBAL_METRICS.set_save_buffer_size(&self.name, backlog);
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick(), if !cancelled => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                _ = self.context.cancelled(), if !cancelled => {
                    // 停止定时刷新，继续接收直到 close 关闭输入
                    debug!("保存器 {} 生命周期上下文已取消", self.name);
                    cancelled = true;
                    while let Ok(item) = receiver.try_recv() {
                        batch.push(item);
                    }
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        GLOBAL_METRICS.set_save_buffer_size(&self.name, 0);
        debug!("保存器 {} 刷新任务退出", self.name);
    }

    async fn flush(&self, batch: &mut Vec<D>) {
        let items = std::mem::replace(batch, Vec::with_capacity(self.configured_size));
        // 信号量从不关闭，获取只会等待
        let permit = self.inflight.clone().acquire_owned().await.ok();
        let name = self.name.clone();
        let save_fn = self.save_fn.clone();
        self.tracker.spawn(async move {
            batch_save(name, save_fn, items).await;
            drop(permit);
        });
    }
}

async fn batch_save<D: Send + 'static>(name: String, save_fn: SaveFunc<D>, items: Vec<D>) {
    let size = items.len();
    match AssertUnwindSafe(async move { save_fn(items).await })
        .catch_unwind()
        .await
    {
        Ok(()) => {
            debug!("保存器 {} 批量保存 {} 条", name, size);
            GLOBAL_METRICS.record_batch(&name, size);
        }
        Err(payload) => {
            error!(
                "保存器 {} 批量保存 {} 条时发生panic: {}\n{}",
                name,
                size,
                panic_message(payload.as_ref()),
                take_panic_backtrace()
            );
        }
    }
}

/// 根据积压计算下一次的批量大小
fn next_save_size(current: usize, configured: usize, backlog: usize) -> usize {
    if backlog > current.saturating_mul(2) {
        current.saturating_mul(10)
    } else if backlog > current {
        current.saturating_mul(5)
    } else {
        configured
    }
}
