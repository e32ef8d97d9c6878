use crate::core::{Item, ItemId, PartitionId};
use crate::engine::explicit::ExplicitList;
use crate::engine::{EngineState, SetEvent, SetObserver, SetView, UpdateMode};
use crate::query::{FilterCriteria, SortCriteria};

/// 所有内容集引擎共有的状态：条件、模式、显式条目、延迟更新标记与观察者
pub struct EngineBase {
    filter: FilterCriteria,
    sort: SortCriteria,
    mode: UpdateMode,
    explicit: ExplicitList,
    state: EngineState,
    update_pending: bool,
    updating: bool,
    observers: Vec<Box<dyn SetObserver>>,
}

impl EngineBase {
    pub fn new(filter: FilterCriteria, sort: SortCriteria, mode: UpdateMode) -> Self {
        Self {
            filter,
            sort,
            mode,
            explicit: ExplicitList::new(),
            state: EngineState::Idle,
            update_pending: false,
            updating: false,
            observers: Vec::new(),
        }
    }

    pub fn filter(&self) -> &FilterCriteria {
        &self.filter
    }

    pub fn sort(&self) -> &SortCriteria {
        &self.sort
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn explicit(&self) -> &ExplicitList {
        &self.explicit
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn update_pending(&self) -> bool {
        self.update_pending
    }
}

/// 内容集引擎契约。
///
/// 实现者只需提供状态访问与 `commit_changes`（真正的重算）；条件变更、
/// 延迟更新的合并、同步模式下的 flush-on-read 以及显式条目管理都在这里完成。
///
/// 延迟任务用 `update_pending` 表示：`update()` 只登记一次，
/// owner 的任务循环下一轮调用 `process_events()` 时触发，或由 `flush()` 提前执行。
pub trait SetEngine: SetView + Sized {
    fn base(&self) -> &EngineBase;
    fn base_mut(&mut self) -> &mut EngineBase;

    /// 执行重算（同步模式在当前线程完成，异步模式交给 worker）
    fn commit_changes(&mut self);

    fn has_partition(&self, partition: PartitionId) -> bool;

    /// 模式切换钩子，在新模式生效前调用
    fn update_mode_changing(&mut self, _from: UpdateMode, _to: UpdateMode) {}

    /// owner 任务循环的一轮：触发到期的延迟更新
    fn process_events(&mut self) {
        self.flush();
    }

    fn filter(&self) -> &FilterCriteria {
        &self.base().filter
    }

    fn sort_criteria(&self) -> &SortCriteria {
        &self.base().sort
    }

    fn update_mode(&self) -> UpdateMode {
        self.base().mode
    }

    fn state(&self) -> EngineState {
        self.base().state
    }

    fn set_filter(&mut self, filter: FilterCriteria) {
        if self.base().filter == filter {
            return;
        }
        self.base_mut().filter = filter;
        self.update();
    }

    fn set_sort_criteria(&mut self, sort: SortCriteria) {
        if self.base().sort == sort {
            return;
        }
        let base = self.base_mut();
        base.explicit.resort(&sort);
        base.sort = sort;
        self.update();
    }

    fn set_update_mode(&mut self, mode: UpdateMode) {
        let from = self.base().mode;
        if from == mode {
            return;
        }
        self.update_mode_changing(from, mode);
        self.base_mut().mode = mode;
        self.update();
    }

    /// 登记一次延迟重算；已登记时合并。同步模式立即发出 `Reset`。
    fn update(&mut self) {
        let base = self.base_mut();
        if base.update_pending {
            tracing::debug!("update already pending, coalesced");
            return;
        }
        base.update_pending = true;
        if !base.updating {
            base.state = EngineState::PendingUpdate;
        }
        if base.mode == UpdateMode::Synchronous {
            self.emit(SetEvent::Reset);
        }
    }

    /// 有待处理的更新则立即执行
    fn flush(&mut self) {
        if !self.base().update_pending {
            return;
        }
        self.base_mut().update_pending = false;
        self.commit_changes();
        let base = self.base_mut();
        if base.mode == UpdateMode::Synchronous && !base.updating && !base.update_pending {
            base.state = EngineState::Idle;
        }
    }

    fn count(&mut self) -> usize {
        if self.update_mode() == UpdateMode::Synchronous {
            self.flush();
        }
        self.value_count()
    }

    fn is_empty(&mut self) -> bool {
        self.count() == 0
    }

    fn content(&mut self, index: usize) -> Option<Item> {
        if self.update_mode() == UpdateMode::Synchronous {
            self.flush();
        }
        self.item_at(index)
    }

    fn content_id(&mut self, index: usize) -> Option<ItemId> {
        if self.update_mode() == UpdateMode::Synchronous {
            self.flush();
        }
        self.id_at(index)
    }

    /// 当前可见的全部条目（逐个经窗口缓存取回）
    fn items(&mut self) -> Vec<Item> {
        let n = self.count();
        (0..n).filter_map(|i| self.item_at(i)).collect()
    }

    /// 显式条目要求仍在显式列表中，且其存储的内容满足当前过滤条件；
    /// 分区条目要求其分区已注册且满足当前过滤条件
    fn contains(&self, item: &Item) -> bool {
        if item.id.is_explicit() {
            let base = self.base();
            return base
                .explicit
                .get(item.id)
                .is_some_and(|stored| base.filter.matches(stored));
        }
        self.has_partition(item.id.partition) && self.base().filter.matches(item)
    }

    /// 与过滤无关地加入一条显式条目，返回分配的 id
    fn insert_content(&mut self, item: Item) -> ItemId {
        let base = self.base_mut();
        let id = base.explicit.insert(item, &base.sort);
        self.update();
        id
    }

    fn remove_content(&mut self, item: &Item) -> bool {
        if self.base_mut().explicit.remove(item).is_none() {
            return false;
        }
        self.update();
        true
    }

    /// 过滤条件与显式条目都清空；重算结果为空集
    fn clear(&mut self) {
        let base = self.base_mut();
        base.filter = FilterCriteria::Empty;
        base.explicit.clear();
        self.update();
    }

    fn start_update(&mut self) {
        let base = self.base_mut();
        if base.updating {
            return;
        }
        base.updating = true;
        base.state = EngineState::Updating;
        self.emit(SetEvent::UpdateStarted);
    }

    fn finish_update(&mut self) {
        let base = self.base_mut();
        if !base.updating {
            return;
        }
        base.updating = false;
        base.state = if base.update_pending {
            EngineState::PendingUpdate
        } else {
            EngineState::Idle
        };
        self.emit(SetEvent::UpdateFinished);
    }

    fn update_in_progress(&self) -> bool {
        self.base().updating
    }

    fn subscribe(&mut self, observer: Box<dyn SetObserver>) {
        self.base_mut().observers.push(observer);
    }

    /// 派发通知：回调期间观察者只拿到只读视图
    fn emit(&mut self, event: SetEvent) {
        let mut observers = std::mem::take(&mut self.base_mut().observers);
        for o in observers.iter_mut() {
            o.notify(&event, &*self);
        }
        self.base_mut().observers = observers;
    }
}
