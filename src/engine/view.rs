use std::sync::Arc;

use crate::core::ItemId;

/// 可见序列的一次不可变发布。
///
/// 重算过程中同时存在旧序列（primary）与新序列（secondary），
/// 一对过渡标记把索引空间一分为二：
/// - `index < secondary_cutoff`：取 `secondary[index]`
/// - 否则：取 `primary[index - secondary_cutoff + primary_offset]`
///
/// 整个结构经 ArcSwap 原子替换，读者永远拿到一致的 (序列, 标记) 组合。
#[derive(Clone, Debug, Default)]
pub struct ViewState {
    pub primary: Arc<Vec<ItemId>>,
    pub secondary: Option<Arc<Vec<ItemId>>>,
    pub primary_offset: usize,
    pub secondary_cutoff: usize,
}

impl ViewState {
    pub fn settled(primary: Arc<Vec<ItemId>>) -> Self {
        Self {
            primary,
            secondary: None,
            primary_offset: 0,
            secondary_cutoff: 0,
        }
    }

    /// 过渡起点：标记归零，读者看到的仍是完整旧序列
    pub fn begin(primary: Arc<Vec<ItemId>>, secondary: Arc<Vec<ItemId>>) -> Self {
        Self {
            primary,
            secondary: Some(secondary),
            primary_offset: 0,
            secondary_cutoff: 0,
        }
    }

    pub fn with_markers(&self, primary_offset: usize, secondary_cutoff: usize) -> Self {
        debug_assert!(primary_offset <= self.primary.len());
        debug_assert!(secondary_cutoff <= self.secondary.as_ref().map_or(0, |s| s.len()));
        Self {
            primary: self.primary.clone(),
            secondary: self.secondary.clone(),
            primary_offset,
            secondary_cutoff,
        }
    }

    /// 交换：secondary 晋升为 primary，标记复位
    pub fn promote(&self) -> Self {
        match &self.secondary {
            Some(s) => Self::settled(s.clone()),
            None => self.clone(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.secondary.is_none()
    }

    pub fn count(&self) -> usize {
        self.secondary_cutoff + self.primary.len().saturating_sub(self.primary_offset)
    }

    pub fn id_at(&self, index: usize) -> Option<ItemId> {
        if index < self.secondary_cutoff {
            return self.secondary.as_ref()?.get(index).copied();
        }
        self.primary
            .get(index - self.secondary_cutoff + self.primary_offset)
            .copied()
    }

    pub fn ids_in(&self, index: usize, count: usize) -> Vec<ItemId> {
        let end = (index + count).min(self.count());
        (index..end).filter_map(|i| self.id_at(i)).collect()
    }

    pub fn position_of(&self, id: ItemId) -> Option<usize> {
        (0..self.count()).find(|&i| self.id_at(i) == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PartitionId;

    fn ids(v: &[u64]) -> Arc<Vec<ItemId>> {
        Arc::new(v.iter().map(|&l| ItemId::new(PartitionId(0), l)).collect())
    }

    #[test]
    fn markers_split_index_space() {
        // old [1,2,3,4] → new [1,9,3,4]，已处理到“删除 2、插入 9”之后
        let v = ViewState::begin(ids(&[1, 2, 3, 4]), ids(&[1, 9, 3, 4])).with_markers(2, 2);
        assert_eq!(v.count(), 4);
        let seen: Vec<u64> = (0..4).map(|i| v.id_at(i).unwrap().local).collect();
        assert_eq!(seen, vec![1, 9, 3, 4]);
        assert_eq!(v.promote().ids_in(0, 10).len(), 4);
    }
}
