use serde::{Deserialize, Serialize};
use std::fmt;

/// 分区标识：一个可独立查询的数据源
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// 保留哨兵：显式条目（不经过任何分区查询，仅存在于内存）
    pub const EXPLICIT: PartitionId = PartitionId(u32::MAX);

    pub fn is_explicit(self) -> bool {
        self == Self::EXPLICIT
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_explicit() {
            f.write_str("explicit")
        } else {
            write!(f, "p{}", self.0)
        }
    }
}

/// 条目全局标识 `(partition, local)`。
///
/// 只用于身份判断；可见序列的顺序由内容比较（SortCriteria）决定，与 id 数值无关。
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub partition: PartitionId,
    pub local: u64,
}

impl ItemId {
    /// 尚未挂入任何集合的“游离”条目（显式计数器从 1 开始，0 永不分配）
    pub const DETACHED: ItemId = ItemId {
        partition: PartitionId::EXPLICIT,
        local: 0,
    };

    pub fn new(partition: PartitionId, local: u64) -> Self {
        Self { partition, local }
    }

    pub fn explicit(local: u64) -> Self {
        Self::new(PartitionId::EXPLICIT, local)
    }

    pub fn is_explicit(&self) -> bool {
        self.partition.is_explicit()
    }

    pub fn is_detached(&self) -> bool {
        *self == Self::DETACHED
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.local)
    }
}
