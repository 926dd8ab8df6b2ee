//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了与持久化层之间的异步批处理机制，包括批量保存和记录预取。

pub mod fetch;
pub mod save;
