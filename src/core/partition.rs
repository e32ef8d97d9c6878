use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::core::{Item, ItemId, PartitionId};
use crate::error::PartitionError;
use crate::event::{ChangeEvent, ChangeSender};
use crate::query::{FilterCriteria, SortCriteria};

/// 分区抽象：一个可独立查询、本地已排序的数据源。
///
/// ## 契约
/// - `query_ids` 返回满足 `filter` 的 id，且必须已按 `sort` 排好序
///   （引擎只做 k 路归并，不做全局排序）。
/// - `resolve` 按输入顺序返回条目；任一 id 无法解析时返回错误。
pub trait PartitionSource: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    fn query_ids(
        &self,
        filter: &FilterCriteria,
        sort: &SortCriteria,
    ) -> Result<Vec<ItemId>, PartitionError>;

    fn resolve(&self, ids: &[ItemId]) -> Result<Vec<Item>, PartitionError>;
}

/// 内存分区（DashMap 实现）：参考实现，也用于测试与 demo。
pub struct MemoryPartition {
    id: PartitionId,
    items: DashMap<u64, Item>,
    next_local: AtomicU64,
    available: AtomicBool,
    feed: Option<ChangeSender>,
}

impl MemoryPartition {
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            items: DashMap::new(),
            next_local: AtomicU64::new(1),
            available: AtomicBool::new(true),
            feed: None,
        }
    }

    /// 挂接变更通道：此后每次写入都会发布 ChangeEvent
    pub fn with_feed(mut self, feed: ChangeSender) -> Self {
        self.feed = Some(feed);
        self
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            feed.publish(event);
        }
    }

    /// 插入新记录，分配本分区内的 local id
    pub fn insert(&self, mut item: Item) -> ItemId {
        let local = self.next_local.fetch_add(1, Ordering::Relaxed);
        let id = ItemId::new(self.id, local);
        item.id = id;
        self.items.insert(local, item);
        self.publish(ChangeEvent::added(vec![id]));
        id
    }

    /// 覆盖已有记录的属性；id 不存在时返回 false
    pub fn update(&self, id: ItemId, mut item: Item) -> bool {
        if id.partition != self.id {
            return false;
        }
        let Some(mut slot) = self.items.get_mut(&id.local) else {
            return false;
        };
        item.id = id;
        *slot = item;
        drop(slot);
        self.publish(ChangeEvent::updated(vec![id]));
        true
    }

    pub fn remove(&self, id: ItemId) -> Option<Item> {
        if id.partition != self.id {
            return None;
        }
        let removed = self.items.remove(&id.local).map(|(_, v)| v);
        if removed.is_some() {
            self.publish(ChangeEvent::removed(vec![id]));
        }
        removed
    }

    pub fn get(&self, id: ItemId) -> Option<Item> {
        if id.partition != self.id {
            return None;
        }
        self.items.get(&id.local).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 模拟数据源不可达（查询返回错误）
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl PartitionSource for MemoryPartition {
    fn partition_id(&self) -> PartitionId {
        self.id
    }

    fn query_ids(
        &self,
        filter: &FilterCriteria,
        sort: &SortCriteria,
    ) -> Result<Vec<ItemId>, PartitionError> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(PartitionError::Unavailable(self.id));
        }
        // 非法条件 fail closed
        let Ok(compiled) = filter.compile() else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<Item> = self
            .items
            .iter()
            .filter(|e| compiled.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        // 本地 id 作为最终平局键，保证同一数据多次查询顺序稳定
        hits.sort_by(|a, b| sort.compare(a, b).then(a.id.local.cmp(&b.id.local)));
        Ok(hits.into_iter().map(|i| i.id).collect())
    }

    fn resolve(&self, ids: &[ItemId]) -> Result<Vec<Item>, PartitionError> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(PartitionError::Unavailable(self.id));
        }
        if let Some(foreign) = ids.iter().find(|id| id.partition != self.id) {
            return Err(PartitionError::Unknown(foreign.partition));
        }
        let out: Vec<Item> = ids.iter().filter_map(|id| self.get(*id)).collect();
        if out.len() != ids.len() {
            return Err(PartitionError::Resolve {
                partition: self.id,
                missing: ids.len() - out.len(),
            });
        }
        Ok(out)
    }
}
