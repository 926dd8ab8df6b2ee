//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了带延迟持久化的缓存后端，包括条目状态机和TTL过期通知层。

pub mod database_cache;
pub mod status;
pub mod ttl;
