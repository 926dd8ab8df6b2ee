//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了预取器，后台持续补充预分配的数据库记录。
//!
//! 新条目写入时从缓冲区取出一条已在数据库中预留的记录作为ID来源，
//! 不需要每次插入都同步访问数据库。关闭时未发出的记录交还给 `DeleteFunc` 回收。

use crate::callback::{DeleteFunc, FetchFunc};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::utils::panic_message;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// 预取器
pub struct Fetch<D> {
    name: String,
    receiver: Mutex<mpsc::Receiver<D>>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<Vec<D>>>>,
    /// 补充任务停止时手上尚未放入缓冲区的记录
    leftover: Mutex<Vec<D>>,
}

impl<D: Send + 'static> Fetch<D> {
    /// 创建预取器并启动后台补充任务
    ///
    /// # 参数
    ///
    /// * `config` - 提供名称、缓冲区大小、预取批量大小和生命周期上下文
    /// * `fetch_fn` - 预分配记录的函数
    pub fn new(config: &Config, fetch_fn: FetchFunc<D>) -> Self {
        let (sender, receiver) = mpsc::channel(config.buffer_size());
        let token = config.context.child_token();

        let worker = RefillLoop {
            name: config.name.clone(),
            fetch_fn,
            fetch_size: config.fetch_size.max(1),
            sender,
            token: token.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            name: config.name.clone(),
            receiver: Mutex::new(receiver),
            token,
            handle: Mutex::new(Some(handle)),
            leftover: Mutex::new(Vec::new()),
        }
    }

    /// 取出一条预分配记录
    ///
    /// 缓冲区为空时等待；关闭后返回 `CacheError::Closed`，
    /// 补充任务意外结束时返回 `CacheError::Exhausted`
    pub async fn fetch(&self) -> Result<D> {
        if self.token.is_cancelled() {
            return Err(CacheError::Closed);
        }

        let mut receiver = self.receiver.lock().await;
        let item = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(CacheError::Closed),
            item = receiver.recv() => item,
        };
        match item {
            Some(item) => {
                GLOBAL_METRICS.record_request(&self.name, "fetch", "ok");
                Ok(item)
            }
            None => {
                GLOBAL_METRICS.record_request(&self.name, "fetch", "exhausted");
                Err(CacheError::Exhausted)
            }
        }
    }

    /// 停止补充并等待补充任务退出
    #[instrument(skip(self), level = "info", fields(name = %self.name))]
    pub async fn close(&self) {
        self.token.cancel();

        if let Some(handle) = self.handle.lock().await.take() {
            match handle.await {
                Ok(rest) => self.leftover.lock().await.extend(rest),
                Err(e) => error!("预取器 {} 补充任务异常退出: {}", self.name, e),
            }
        }
    }

    /// 在调用方的任务跟踪器上回收所有未发出的记录
    ///
    /// 先关闭预取器，再把缓冲区和补充任务手上剩余的记录交给 `delete_fn`
    pub fn delete_rest(self: &Arc<Self>, delete_fn: DeleteFunc<D>, tracker: &TaskTracker) {
        let fetch = self.clone();
        tracker.spawn(async move { fetch.drain_and_delete(delete_fn).await });
    }

    async fn drain_and_delete(&self, delete_fn: DeleteFunc<D>) {
        self.close().await;

        let mut rest = std::mem::take(&mut *self.leftover.lock().await);
        {
            let mut receiver = self.receiver.lock().await;
            receiver.close();
            while let Ok(item) = receiver.try_recv() {
                rest.push(item);
            }
        }

        if rest.is_empty() {
            debug!("预取器 {} 没有需要回收的记录", self.name);
            return;
        }

        let size = rest.len();
        info!("预取器 {} 回收 {} 条未使用的记录", self.name, size);
        if let Err(payload) = AssertUnwindSafe(async move { delete_fn(rest).await })
            .catch_unwind()
            .await
        {
            error!(
                "预取器 {} 回收 {} 条记录时发生panic: {}",
                self.name,
                size,
                panic_message(payload.as_ref())
            );
        }
    }
}

struct RefillLoop<D> {
    name: String,
    fetch_fn: FetchFunc<D>,
    fetch_size: usize,
    sender: mpsc::Sender<D>,
    token: CancellationToken,
}

impl<D: Send + 'static> RefillLoop<D> {
    /// 持续补充缓冲区，返回停止时尚未放入缓冲区的记录
    async fn run(self) -> Vec<D> {
        let mut rest = Vec::new();
        let mut backoff = MIN_BACKOFF;

        'refill: loop {
            if self.token.is_cancelled() {
                break;
            }

            let mut batch = (self.fetch_fn)(self.token.clone(), self.fetch_size);
            let mut delivered = 0usize;

            loop {
                let item = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        drain_batch(&mut batch, &mut rest);
                        break 'refill;
                    }
                    item = batch.recv() => item,
                };
                let Some(item) = item else {
                    break;
                };

                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        rest.push(item);
                        drain_batch(&mut batch, &mut rest);
                        break 'refill;
                    }
                    permit = self.sender.reserve() => match permit {
                        Ok(permit) => {
                            permit.send(item);
                            delivered += 1;
                        }
                        Err(_) => {
                            rest.push(item);
                            drain_batch(&mut batch, &mut rest);
                            break 'refill;
                        }
                    },
                }
            }

            if delivered == 0 {
                debug!("预取器 {} 本轮未取得记录，{:?} 后重试", self.name, backoff);
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            } else {
                debug!("预取器 {} 补充 {} 条记录", self.name, delivered);
                backoff = MIN_BACKOFF;
            }
        }

        debug!("预取器 {} 补充任务退出，剩余 {} 条", self.name, rest.len());
        rest
    }
}

fn drain_batch<D>(batch: &mut mpsc::Receiver<D>, rest: &mut Vec<D>) {
    batch.close();
    while let Ok(item) = batch.try_recv() {
        rest.push(item);
    }
}
