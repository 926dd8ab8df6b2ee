//! asyncdb - 带延迟批量持久化的内存回写缓存
//!
//! 条目常驻内存并可随时读写，TTL到期时才被批量写回数据库；
//! 保存期间被访问的条目会被保留，保存失败的条目会在下次过期时重试。

pub use tokio;

pub mod backend;
pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod sync;
pub mod utils;

// Re-export commonly used items
pub use backend::database_cache::DataBaseCacheWithKey;
pub use backend::status::Status;
pub use backend::ttl::EvictionReason;
pub use client::item::{CacheItem, DbItem, MemoryItem};
pub use client::Cache;
pub use config::Config;
pub use error::{CacheError, Result};
pub use sync::fetch::Fetch;
pub use sync::save::Save;

/// asyncdb 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
