//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存条目及其状态机。
//!
//! 后台保存与前台读写之间的竞争完全依靠每个条目上的原子状态解决，
//! 不存在串行化 set/get/save 的全局锁。

use std::sync::atomic::{AtomicU8, Ordering};

/// 缓存条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// 常驻内存，没有正在进行的持久化
    Normal = 0,
    /// 正在持久化
    Save = 1,
    /// 持久化期间被访问过，完成后需要恢复而不是删除
    Update = 2,
    /// 查找哨兵值
    NotFound = 3,
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0 => Status::Normal,
            1 => Status::Save,
            2 => Status::Update,
            _ => Status::NotFound,
        }
    }
}

/// 原子状态
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> Status {
        Status::from(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// 仅当当前状态等于 `current` 时切换到 `new`，返回是否成功
    pub fn transition(&self, current: Status, new: Status) -> bool {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// 缓存条目
///
/// `generation` 在每次插入时分配，保存流程据此识别它开始时面对的是不是同一个条目
#[derive(Debug)]
pub struct CacheEntry<K, T> {
    pub status: AtomicStatus,
    pub generation: u64,
    pub key: K,
    pub memory_item: T,
}

impl<K, T> CacheEntry<K, T> {
    pub fn new(key: K, memory_item: T, generation: u64) -> Self {
        Self {
            status: AtomicStatus::new(Status::Normal),
            generation,
            key,
            memory_item,
        }
    }
}
