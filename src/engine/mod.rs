pub mod contract;
pub mod diff;
pub mod explicit;
pub mod merge;
pub mod merge_diff;
pub mod view;
mod worker;

use serde::{Deserialize, Serialize};

use crate::core::{Item, ItemId};

pub use contract::{EngineBase, SetEngine};
pub use diff::{synchronize_single_set, Edit, EditKind};
pub use explicit::ExplicitList;
pub use merge::{merge_sorted, MergeSource, DEFAULT_LOOKAHEAD};
pub use merge_diff::MergeDiffEngine;
pub use view::ViewState;

/// 更新模式
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// 在调用线程的 `flush()` 内重算；`update()` 立即发出 `Reset`
    #[default]
    Synchronous,
    /// 在引擎持有的 worker 线程上重算，增量编辑回到 owner 线程按序应用
    Asynchronous,
}

/// 引擎状态：`Idle → PendingUpdate → (Updating →) Idle`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    PendingUpdate,
    Updating,
}

/// 一次重算周期所处阶段
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CycleStage {
    Clean,
    Dirty,
    Merging,
    Diffing,
    Swapping,
}

/// 观察者收到的通知。区间均为闭区间 `[start, end]`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetEvent {
    AboutToBeInserted { start: usize, end: usize },
    Inserted,
    AboutToBeRemoved { start: usize, end: usize },
    Removed,
    Changed { start: usize, end: usize },
    Reset,
    UpdateStarted,
    UpdateFinished,
}

/// 只读视图：通知回调期间观察者看到的引擎状态（不会触发 flush）
pub trait SetView {
    fn value_count(&self) -> usize;
    fn id_at(&self, index: usize) -> Option<ItemId>;
    fn item_at(&self, index: usize) -> Option<Item>;
}

pub trait SetObserver: Send {
    fn notify(&mut self, event: &SetEvent, view: &dyn SetView);
}

impl<F> SetObserver for F
where
    F: FnMut(&SetEvent, &dyn SetView) + Send,
{
    fn notify(&mut self, event: &SetEvent, view: &dyn SetView) {
        self(event, view)
    }
}
