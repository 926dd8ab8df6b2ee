//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了回写缓存的配置结构和解析逻辑。

use crate::error::{CacheError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 默认预取批量大小
pub const DEFAULT_FETCH_SIZE: usize = 10;
/// 默认保存批量大小
pub const DEFAULT_SAVE_SIZE: usize = 10;
/// 默认保存刷新超时（毫秒）
pub const DEFAULT_SAVE_TIMEOUT_MS: u64 = 1000;
/// 默认缓存过期时间（毫秒）
pub const DEFAULT_TTL_MS: u64 = 60_000;

/// 回写缓存配置
///
/// 构造后不可变，通过 `with_*` 方法链式设置选项，
/// 也可以从TOML文件中加载。
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// 缓存名称，用于日志和指标
    pub name: String,
    /// 每次预取的记录数量
    pub fetch_size: usize,
    /// 每批保存的记录数量
    pub save_size: usize,
    /// 保存刷新超时（毫秒），到期后即使批次未满也会刷新
    pub save_timeout_ms: u64,
    /// 是否启用保存，关闭时过期条目只会被重新续期
    pub enable_save: bool,
    /// 缓存条目的过期时间（毫秒）
    pub ttl_ms: u64,
    /// 生命周期上下文，取消后后台任务停止
    #[serde(skip)]
    pub context: CancellationToken,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            fetch_size: DEFAULT_FETCH_SIZE,
            save_size: DEFAULT_SAVE_SIZE,
            save_timeout_ms: DEFAULT_SAVE_TIMEOUT_MS,
            enable_save: true,
            ttl_ms: DEFAULT_TTL_MS,
            context: CancellationToken::new(),
        }
    }
}

impl Config {
    /// 使用默认值创建配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置缓存名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// 设置预取批量大小
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = size;
        self
    }

    /// 设置是否启用保存
    pub fn with_enable_save(mut self, enable: bool) -> Self {
        self.enable_save = enable;
        self
    }

    /// 设置保存批量大小
    pub fn with_save_size(mut self, size: usize) -> Self {
        self.save_size = size;
        self
    }

    /// 设置保存刷新超时
    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置生命周期上下文
    pub fn with_context(mut self, context: CancellationToken) -> Self {
        self.context = context;
        self
    }

    /// 设置缓存条目的过期时间
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// 缓冲区大小，取预取与保存批量中较大者的四倍
    pub fn buffer_size(&self) -> usize {
        4 * self.fetch_size.max(self.save_size).max(1)
    }

    /// 保存刷新超时
    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }

    /// 缓存条目的过期时间
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// 从TOML字符串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从TOML文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 验证配置
    ///
    /// 检查所有数值在合理范围内，名称非空且不超过64个字符
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CacheError::ConfigError(
                "Cache name cannot be empty".to_string(),
            ));
        }

        if self.name.len() > 64 {
            return Err(CacheError::ConfigError(format!(
                "Cache name '{}' exceeds maximum length of 64 characters",
                self.name
            )));
        }

        if self.fetch_size == 0 {
            return Err(CacheError::ConfigError(
                "fetch_size cannot be zero".to_string(),
            ));
        }

        if self.save_size == 0 {
            return Err(CacheError::ConfigError(
                "save_size cannot be zero".to_string(),
            ));
        }

        if self.save_timeout_ms == 0 {
            return Err(CacheError::ConfigError(
                "save_timeout_ms cannot be zero".to_string(),
            ));
        }

        if self.ttl_ms == 0 {
            return Err(CacheError::ConfigError("ttl_ms cannot be zero".to_string()));
        }

        Ok(())
    }
}
