//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了回写缓存的指标收集和监控功能。

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::Arc;
use tracing::{span, Level};

/// 指标收集器
///
/// 用于收集和存储回写缓存的各种运行时指标
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// 操作总数统计
    /// key: "cache:op:result"
    pub requests_total: Arc<DashMap<String, u64>>,
    /// 保存缓冲区中等待刷新的条目数
    pub save_buffer_size: Arc<DashMap<String, usize>>,
    /// 批量保存的累计条目数和批次数
    /// key: "cache" -> (total_items, batch_count)
    pub batch_items: Arc<DashMap<String, (u64, u64)>>,
}

lazy_static! {
    /// 全局指标实例
    pub static ref GLOBAL_METRICS: Metrics = Metrics::default();
}

impl Metrics {
    /// 记录操作指标
    ///
    /// # 参数
    ///
    /// * `cache` - 缓存名称
    /// * `op` - 操作类型（get/load/save/fetch）
    /// * `result` - 操作结果（hit/miss/ok/fail/restore）
    pub fn record_request(&self, cache: &str, op: &str, result: &str) {
        let span = span!(Level::TRACE, "cache_request", cache, op, result);
        let _enter = span.enter();
        let key = format!("{}:{}:{}", cache, op, result);
        *self.requests_total.entry(key).or_insert(0) += 1;
    }

    /// 读取某个操作的计数
    pub fn request_count(&self, cache: &str, op: &str, result: &str) -> u64 {
        let key = format!("{}:{}:{}", cache, op, result);
        self.requests_total.get(&key).map(|v| *v).unwrap_or(0)
    }

    /// 设置保存缓冲区大小
    pub fn set_save_buffer_size(&self, cache: &str, size: usize) {
        self.save_buffer_size.insert(cache.to_string(), size);
    }

    /// 记录一次批量保存
    pub fn record_batch(&self, cache: &str, size: usize) {
        let mut entry = self.batch_items.entry(cache.to_string()).or_insert((0, 0));
        entry.0 += size as u64;
        entry.1 += 1;
    }
}

/// 获取指标字符串
///
/// 将所有指标格式化为字符串返回，用于监控系统采集
pub fn get_metrics_string() -> String {
    let metrics = &GLOBAL_METRICS;

    let mut output = String::new();
    for entry in metrics.requests_total.iter() {
        output.push_str(&format!(
            "asyncdb_requests_total{{labels=\"{}\"}} {}\n",
            entry.key(),
            entry.value()
        ));
    }
    for entry in metrics.save_buffer_size.iter() {
        output.push_str(&format!(
            "asyncdb_save_buffer_size{{cache=\"{}\"}} {}\n",
            entry.key(),
            entry.value()
        ));
    }
    for entry in metrics.batch_items.iter() {
        let (items, batches) = *entry.value();
        output.push_str(&format!(
            "asyncdb_batch_items_sum{{cache=\"{}\"}} {}\n",
            entry.key(),
            items
        ));
        output.push_str(&format!(
            "asyncdb_batch_items_count{{cache=\"{}\"}} {}\n",
            entry.key(),
            batches
        ));
    }
    output
}
