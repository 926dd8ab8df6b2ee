//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存实体的能力接口，以及内存对象与数据库记录的配对。

use crate::callback::MarshalFunc;
use std::sync::Arc;

/// 内存中的实体
///
/// 缓存以 `Arc<T>` 的形式交出实体，需要修改字段的实现应使用内部可变性
pub trait MemoryItem: Send + Sync + 'static {
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
}

/// 数据库形态的记录
pub trait DbItem: Clone + Send + Sync + 'static {
    fn id(&self) -> i64;
}

/// 内存对象与其数据库记录的配对
#[derive(Debug)]
pub struct CacheItem<T, D> {
    memory_item: Arc<T>,
    db_item: Arc<D>,
}

impl<T, D> Clone for CacheItem<T, D> {
    fn clone(&self) -> Self {
        Self {
            memory_item: self.memory_item.clone(),
            db_item: self.db_item.clone(),
        }
    }
}

impl<T, D: Clone> CacheItem<T, D> {
    pub fn new(memory_item: Arc<T>, db_item: D) -> Self {
        Self {
            memory_item,
            db_item: Arc::new(db_item),
        }
    }

    pub fn memory_item(&self) -> &Arc<T> {
        &self.memory_item
    }

    pub fn db_item(&self) -> &D {
        &self.db_item
    }

    /// 在数据库记录的副本上应用 `marshal`，返回待保存的记录
    pub fn marshal(&self, marshal: &MarshalFunc<T, D>) -> D {
        let mut record = (*self.db_item).clone();
        marshal(&self.memory_item, &mut record);
        record
    }
}
