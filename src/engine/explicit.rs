use std::cmp::Ordering;
use std::sync::Arc;

use crate::core::{Item, ItemId};
use crate::query::SortCriteria;

/// 显式条目列表：与过滤无关、仅存在于内存的条目。
///
/// 始终按当前 SortCriteria 有序，重算时作为一个额外“分区”参与归并。
/// 内部用 `Arc<Vec<_>>` 存放，快照给 worker 时只克隆指针。
#[derive(Clone, Debug, Default)]
pub struct ExplicitList {
    entries: Arc<Vec<Item>>,
    next_local: u64,
}

impl ExplicitList {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Vec::new()),
            next_local: 1,
        }
    }

    /// 分配新的显式 id 并按序插入（相等元素之后，保持稳定）
    pub fn insert(&mut self, mut item: Item, sort: &SortCriteria) -> ItemId {
        // Default 构造时计数器为 0，0 保留给 DETACHED
        self.next_local = self.next_local.max(1);
        let id = ItemId::explicit(self.next_local);
        self.next_local += 1;
        item.id = id;
        let entries = Arc::make_mut(&mut self.entries);
        let at = entries.partition_point(|e| sort.compare(e, &item) != Ordering::Greater);
        entries.insert(at, item);
        id
    }

    /// 按 id 删除；游离条目（无显式 id）按内容匹配第一项
    pub fn remove(&mut self, item: &Item) -> Option<Item> {
        let pos = if item.id.is_explicit() && !item.id.is_detached() {
            self.entries.iter().position(|e| e.id == item.id)
        } else {
            self.entries.iter().position(|e| e.same_content(item))
        }?;
        Some(Arc::make_mut(&mut self.entries).remove(pos))
    }

    pub fn resort(&mut self, sort: &SortCriteria) {
        Arc::make_mut(&mut self.entries).sort_by(|a, b| sort.compare(a, b));
    }

    pub fn clear(&mut self) {
        self.entries = Arc::new(Vec::new());
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.get(id).is_some()
    }

    pub fn items(&self) -> &[Item] {
        &self.entries
    }

    pub fn snapshot(&self) -> Arc<Vec<Item>> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
