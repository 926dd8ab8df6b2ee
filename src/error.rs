//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了回写缓存的错误类型和处理机制。

use thiserror::Error;

/// 缓存系统错误类型枚举
///
/// 定义了回写缓存中可能发生的各种错误类型
#[derive(Error, Debug)]
pub enum CacheError {
    /// 组件已关闭
    #[error("Component is closed")]
    Closed,

    /// 预取任务已结束，缓冲区中没有可用记录
    #[error("Fetch buffer exhausted")]
    Exhausted,

    /// 数据库中不存在该键
    #[error("Not found: {0}")]
    NotFound(String),

    /// 带ID的条目并未被缓存跟踪
    #[error("Item {0} is not tracked by the cache")]
    NotTracked(i64),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO错误
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML配置解析错误
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// 缓存操作结果类型别名
///
/// 简化错误处理，所有缓存操作都返回此类型
pub type Result<T> = std::result::Result<T, CacheError>;
