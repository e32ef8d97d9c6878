use serde::{Deserialize, Serialize};

use crate::core::ItemId;

/// 外部变更类型
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// 分区发出的变更通知：一批 id + 变更类型
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub ids: Vec<ItemId>,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, ids: Vec<ItemId>) -> Self {
        Self { ids, kind }
    }

    pub fn added(ids: Vec<ItemId>) -> Self {
        Self::new(ChangeKind::Added, ids)
    }

    pub fn updated(ids: Vec<ItemId>) -> Self {
        Self::new(ChangeKind::Updated, ids)
    }

    pub fn removed(ids: Vec<ItemId>) -> Self {
        Self::new(ChangeKind::Removed, ids)
    }
}
