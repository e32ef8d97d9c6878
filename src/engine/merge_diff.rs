use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::{RangeSource, WindowedCache};
use crate::config::EngineConfig;
use crate::core::{Item, ItemId, PartitionId, PartitionSource};
use crate::engine::contract::{EngineBase, SetEngine};
use crate::engine::diff::{Edit, EditKind};
use crate::engine::merge::{recompute, CycleRequest};
use crate::engine::view::ViewState;
use crate::engine::worker::{self, Shared, WorkerMessage};
use crate::engine::{CycleStage, SetEvent, SetView, UpdateMode};
use crate::error::PartitionError;
use crate::event::{ChangeEvent, ChangeKind, ChangeReceiver};
use crate::query::{FilterCriteria, SortCriteria};
use crate::stats::EngineStats;

/// 多分区归并 + 最小差分的内容集引擎。
///
/// - 每个周期：各分区并行下推查询 → k 路归并 → 与当前可见序列求差；
/// - 同步模式在 `flush()` 内就地完成，`update()` 时已发出 `Reset`；
/// - 异步模式交给引擎持有的 worker 线程，编辑脚本经通道回到 owner，
///   由 `process_events()` 逐条应用并发出成对的增量通知，再经屏障让 worker 完成交换。
///
/// 可见序列与过渡标记作为一个 `ViewState` 经 ArcSwap 发布；
/// 条目内容经窗口缓存按需取回，缓存的索引空间始终与可见序列一致。
pub struct MergeDiffEngine {
    base: EngineBase,
    config: EngineConfig,
    partitions: Arc<Vec<Arc<dyn PartitionSource>>>,
    shared: Arc<Shared>,
    cache: RefCell<WindowedCache<Item>>,
    tx: Sender<WorkerMessage>,
    rx: Receiver<WorkerMessage>,
    worker: Option<JoinHandle<()>>,
    /// 已派发的最新周期
    generation: u64,
    /// 已完成交换的最新周期
    finished: u64,
    /// 下个周期需要发出 Refresh 的 id
    pending_dirty: HashSet<ItemId>,
    /// 当前可见序列（primary）里显式 id 对应的条目
    explicit_shown: Arc<Vec<Item>>,
    /// 过渡期间新序列（secondary）里显式 id 对应的条目
    explicit_incoming: Option<Arc<Vec<Item>>>,
    stats: EngineStats,
}

impl MergeDiffEngine {
    pub fn new(
        partitions: Vec<Arc<dyn PartitionSource>>,
        filter: FilterCriteria,
        sort: SortCriteria,
        mode: UpdateMode,
    ) -> Self {
        let config = EngineConfig {
            update_mode: mode,
            ..EngineConfig::default()
        };
        Self::with_config(partitions, filter, sort, config)
    }

    pub fn with_config(
        partitions: Vec<Arc<dyn PartitionSource>>,
        filter: FilterCriteria,
        sort: SortCriteria,
        config: EngineConfig,
    ) -> Self {
        let (tx, rx) = channel::unbounded();
        let mut engine = Self {
            base: EngineBase::new(filter, sort, config.update_mode),
            cache: RefCell::new(WindowedCache::new(config.frame_size, config.frame_count)),
            config,
            partitions: Arc::new(partitions),
            shared: Arc::new(Shared::new()),
            tx,
            rx,
            worker: None,
            generation: 0,
            finished: 0,
            pending_dirty: HashSet::new(),
            explicit_shown: Arc::new(Vec::new()),
            explicit_incoming: None,
            stats: EngineStats::default(),
        };
        engine.update();
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn partitions(&self) -> &[Arc<dyn PartitionSource>] {
        &self.partitions
    }

    /// 注册新分区；分区 id 已存在时返回 false
    pub fn add_partition(&mut self, source: Arc<dyn PartitionSource>) -> bool {
        let id = source.partition_id();
        if id.is_explicit() || self.has_partition(id) {
            tracing::warn!("partition {} already registered", id);
            return false;
        }
        Arc::make_mut(&mut self.partitions).push(source);
        self.update();
        true
    }

    pub fn remove_partition(&mut self, id: PartitionId) -> bool {
        let Some(pos) = self.partitions.iter().position(|p| p.partition_id() == id) else {
            return false;
        };
        Arc::make_mut(&mut self.partitions).remove(pos);
        self.update();
        true
    }

    pub fn stage(&self) -> CycleStage {
        self.shared.state.lock().stage
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.stats.clone();
        stats.visible = self.value_count();
        if let Ok(cache) = self.cache.try_borrow() {
            stats.cache = cache.stats();
            stats.cache_resident = cache.resident();
        }
        stats
    }

    /// 泵 owner 任务循环直到当前周期完成交换；超时返回 false
    pub fn wait_for_update(&mut self, timeout: Duration) -> bool {
        if self.base.mode() == UpdateMode::Synchronous {
            self.flush();
            return true;
        }
        let deadline = Instant::now() + timeout;
        self.process_events();
        while self.cycle_outstanding() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(msg) => {
                    self.handle_message(msg);
                    self.process_events();
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    /// 处理一次外部变更。
    ///
    /// `Updated`：可见且仍满足过滤、仍在相邻条目之间的记录直接刷新（不重算）；
    /// 其余情况标记 dirty 并登记一次合并后的重算。
    /// `Removed`：只有可见 id 才触发重算。
    pub fn apply_change(&mut self, event: &ChangeEvent) {
        // 周期进行中时快照可能早于变更，一律重算
        let quiescent = self.is_quiescent();
        match event.kind {
            ChangeKind::Added => {
                if event.ids.iter().any(|id| self.has_partition(id.partition)) {
                    self.update();
                }
            }
            ChangeKind::Removed => {
                if !quiescent || self.any_visible(&event.ids) {
                    self.update();
                }
            }
            ChangeKind::Updated => {
                let mut needs_update = false;
                for id in &event.ids {
                    if quiescent && !needs_update && self.try_fast_refresh(*id) {
                        continue;
                    }
                    self.pending_dirty.insert(*id);
                    needs_update = true;
                }
                if needs_update {
                    self.update();
                }
            }
        }
    }

    /// 取出变更通道里的全部事件并处理；发生过溢出时全量重算，返回处理的事件数
    pub fn drain_changes(&mut self, feed: &mut ChangeReceiver) -> usize {
        let drained = feed.drain();
        if drained.overflowed {
            self.stats.feed_drops += drained.dropped;
            tracing::warn!(
                "change feed dropped {} events ({} in total), scheduling full recompute",
                drained.dropped,
                feed.overflow_drops()
            );
            // 增量标记已不可信：所有可见条目都按 dirty 处理
            let view = self.shared.view.load_full();
            self.pending_dirty.extend(view.ids_in(0, view.count()));
            self.update();
            return drained.events.len();
        }
        for event in &drained.events {
            self.apply_change(event);
        }
        drained.events.len()
    }

    fn is_quiescent(&self) -> bool {
        !self.base.update_pending()
            && !self.update_in_progress()
            && self.finished >= self.generation
            && self.shared.view.load().is_settled()
    }

    fn cycle_outstanding(&self) -> bool {
        self.base.update_pending() || self.update_in_progress() || self.finished < self.generation
    }

    fn any_visible(&self, ids: &[ItemId]) -> bool {
        let wanted: HashSet<ItemId> = ids.iter().copied().collect();
        let view = self.shared.view.load();
        (0..view.count()).any(|i| view.id_at(i).is_some_and(|id| wanted.contains(&id)))
    }

    fn partition(&self, id: PartitionId) -> Option<&Arc<dyn PartitionSource>> {
        self.partitions.iter().find(|p| p.partition_id() == id)
    }

    /// 归并平局时的来源次序：分区按注册顺序，显式条目最后
    fn source_rank(&self, id: PartitionId) -> Option<usize> {
        if id.is_explicit() {
            return Some(self.partitions.len());
        }
        self.partitions.iter().position(|p| p.partition_id() == id)
    }

    fn precedes(&self, a: &Item, b: &Item) -> bool {
        match self.base.sort().compare(a, b) {
            Ordering::Less => true,
            Ordering::Greater => false,
            // 同一来源内的平局次序由分区决定，无从判断
            Ordering::Equal => matches!(
                (self.source_rank(a.id.partition), self.source_rank(b.id.partition)),
                (Some(x), Some(y)) if x < y
            ),
        }
    }

    fn try_fast_refresh(&mut self, id: ItemId) -> bool {
        if id.is_explicit() {
            return false;
        }
        let view = self.shared.view.load_full();
        let Some(index) = view.position_of(id) else {
            return false;
        };
        let Some(part) = self.partition(id.partition) else {
            return false;
        };
        let item = match part.resolve(&[id]) {
            Ok(mut items) if items.len() == 1 => items.remove(0),
            _ => return false,
        };
        if !self.base.filter().matches(&item) {
            return false;
        }
        if index > 0 {
            match self.item_at(index - 1) {
                Some(prev) if self.precedes(&prev, &item) => {}
                _ => return false,
            }
        }
        if index + 1 < view.count() {
            match self.item_at(index + 1) {
                Some(next) if self.precedes(&item, &next) => {}
                _ => return false,
            }
        }

        self.cache
            .borrow_mut()
            .refresh_range(index, 1, &self.fetcher(&view));
        self.stats.fast_refreshes += 1;
        tracing::debug!("fast refresh of {} at {}", id, index);
        self.emit(SetEvent::Changed {
            start: index,
            end: index,
        });
        true
    }

    fn fetcher<'a>(&'a self, view: &'a ViewState) -> Fetcher<'a> {
        let mut explicit: Vec<&'a [Item]> = Vec::with_capacity(3);
        if let Some(incoming) = &self.explicit_incoming {
            explicit.push(incoming);
        }
        explicit.push(&self.explicit_shown);
        explicit.push(self.base.explicit().items());
        Fetcher {
            view,
            partitions: &self.partitions,
            explicit,
        }
    }

    fn next_request(&mut self) -> CycleRequest {
        self.generation += 1;
        CycleRequest {
            generation: self.generation,
            filter: self.base.filter().clone(),
            sort: self.base.sort().clone(),
            explicit: self.base.explicit().snapshot(),
            dirty: std::mem::take(&mut self.pending_dirty),
            partitions: self.partitions.clone(),
            lookahead: self.config.merge_lookahead,
        }
    }

    /// 同步周期：在当前线程重算并静默应用
    fn run_inline(&mut self, request: CycleRequest) {
        let shared = self.shared.clone();
        shared.set_stage(CycleStage::Merging);
        let primary = shared.view.load_full().primary.clone();
        let Some(outcome) = recompute(&request, &primary, &shared.cancel, || {
            shared.set_stage(CycleStage::Diffing)
        }) else {
            tracing::warn!("cycle {} cancelled", request.generation);
            shared.set_stage(CycleStage::Clean);
            self.finished = request.generation;
            return;
        };
        shared.set_stage(CycleStage::Swapping);
        self.apply_cycle(
            outcome.secondary,
            &outcome.edits,
            outcome.failures,
            request.explicit,
            false,
        );
        self.promote_view();
        shared.set_stage(CycleStage::Clean);
        self.finished = request.generation;
        self.stats.cycles += 1;
    }

    fn dispatch(&mut self, request: CycleRequest) {
        if !self.ensure_worker() {
            self.run_inline(request);
            return;
        }
        if self.shared.submit(request) {
            self.stats.coalesced += 1;
        }
    }

    fn ensure_worker(&mut self) -> bool {
        if self.worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return true;
        }
        if let Some(stale) = self.worker.take() {
            let _ = stale.join();
        }
        match worker::spawn(self.shared.clone(), self.tx.clone(), self.config.barrier_wait()) {
            Ok(handle) => {
                self.worker = Some(handle);
                true
            }
            Err(e) => {
                tracing::warn!("failed to spawn merge worker, running cycle inline: {}", e);
                false
            }
        }
    }

    /// 第二阶段：按序应用编辑脚本。
    ///
    /// 每条编辑前后各发布一次过渡标记，观察者在 “about to” 与 “done”
    /// 两个时刻分别看到编辑前与编辑后的索引空间；缓存随之同步平移。
    fn apply_cycle(
        &mut self,
        secondary: Arc<Vec<ItemId>>,
        edits: &[Edit],
        failures: usize,
        explicit: Arc<Vec<Item>>,
        notify: bool,
    ) {
        let old = self.shared.view.load_full();
        debug_assert!(old.is_settled());
        let base = ViewState::begin(old.primary.clone(), secondary.clone());
        self.shared.view.store(Arc::new(base.clone()));
        self.explicit_incoming = Some(explicit);

        let (mut inserted, mut removed, mut refreshed) = (0usize, 0usize, 0usize);
        for e in edits {
            match e.kind {
                EditKind::Insert => {
                    self.publish_markers(&base, e.primary, e.secondary);
                    if notify {
                        self.emit(SetEvent::AboutToBeInserted {
                            start: e.start,
                            end: e.end(),
                        });
                    }
                    self.publish_markers(&base, e.primary, e.secondary + e.count);
                    self.cache.borrow_mut().insert_range(e.start, e.count);
                    if notify {
                        self.emit(SetEvent::Inserted);
                    }
                    inserted += e.count;
                }
                EditKind::Remove => {
                    self.publish_markers(&base, e.primary, e.secondary);
                    if notify {
                        self.emit(SetEvent::AboutToBeRemoved {
                            start: e.start,
                            end: e.end(),
                        });
                    }
                    self.publish_markers(&base, e.primary + e.count, e.secondary);
                    self.cache.borrow_mut().remove_range(e.start, e.count);
                    if notify {
                        self.emit(SetEvent::Removed);
                    }
                    removed += e.count;
                }
                EditKind::Refresh => {
                    self.publish_markers(&base, e.primary + e.count, e.secondary + e.count);
                    let view = self.shared.view.load_full();
                    self.cache
                        .borrow_mut()
                        .refresh_range(e.start, e.count, &self.fetcher(&view));
                    if notify {
                        self.emit(SetEvent::Changed {
                            start: e.start,
                            end: e.end(),
                        });
                    }
                    refreshed += e.count;
                }
            }
        }
        self.publish_markers(&base, old.primary.len(), secondary.len());

        self.stats.inserts += inserted as u64;
        self.stats.removes += removed as u64;
        self.stats.refreshes += refreshed as u64;
        self.stats.partition_failures += failures as u64;
        tracing::debug!(
            "applied cycle: +{} -{} ~{} ({} visible)",
            inserted,
            removed,
            refreshed,
            secondary.len()
        );
    }

    fn publish_markers(&self, base: &ViewState, primary_offset: usize, secondary_cutoff: usize) {
        self.shared
            .view
            .store(Arc::new(base.with_markers(primary_offset, secondary_cutoff)));
    }

    /// 第三阶段的 owner 侧：secondary 晋升，显式条目快照随之切换
    fn promote_view(&mut self) {
        let current = self.shared.view.load_full();
        if !current.is_settled() {
            self.shared.view.store(Arc::new(current.promote()));
        }
        if let Some(explicit) = self.explicit_incoming.take() {
            self.explicit_shown = explicit;
        }
    }

    fn handle_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Started { generation } => {
                tracing::debug!("cycle {} started", generation);
                self.start_update();
            }
            WorkerMessage::Ready {
                generation,
                secondary,
                edits,
                failures,
                explicit,
            } => {
                self.apply_cycle(secondary, &edits, failures, explicit, true);
                self.shared.mark_drained(generation);
            }
            WorkerMessage::Finished { generation } => {
                // worker 已完成交换，这里只切换显式条目快照
                if let Some(explicit) = self.explicit_incoming.take() {
                    self.explicit_shown = explicit;
                }
                self.finished = self.finished.max(generation);
                self.stats.cycles += 1;
                if self.finished >= self.generation {
                    self.finish_update();
                }
            }
        }
    }

    /// 放弃仍卡在分区查询里的 worker：它保留旧的共享状态（取消标记保持置位）
    /// 与旧通道，醒来后只会看到取消并退出；引擎换用新的共享状态与通道
    fn detach_worker(&mut self, handle: JoinHandle<()>) {
        drop(handle);
        let fresh = Shared::new();
        fresh.view.store(self.shared.view.load_full());
        self.shared = Arc::new(fresh);
        let (tx, rx) = channel::unbounded();
        self.tx = tx;
        self.rx = rx;
    }

    /// 停止 worker 并补做已应用周期的交换；返回是否丢弃了未完成的周期
    fn shutdown_worker(&mut self) -> bool {
        let Some(handle) = self.worker.take() else {
            return false;
        };
        self.shared.request_shutdown();
        let mut retries = 0;
        while !handle.is_finished() && retries < self.config.shutdown_retries {
            self.shared.wake.notify_all();
            std::thread::sleep(self.config.barrier_wait());
            retries += 1;
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::warn!("merge worker panicked");
            }
        } else {
            tracing::warn!(
                "merge worker still busy after {} retries, detaching",
                retries
            );
            self.detach_worker(handle);
        }

        // 已应用编辑但 worker 未来得及交换
        if !self.shared.view.load().is_settled() {
            self.promote_view();
        }
        // 未应用的 Ready 直接丢弃：可见序列从未被它修改
        while self.rx.try_recv().is_ok() {}
        self.shared.reset_after_shutdown();

        let abandoned = self.finished < self.generation;
        self.finished = self.generation;
        if abandoned {
            tracing::debug!("abandoned cycle {} on shutdown", self.generation);
        }
        abandoned
    }
}

impl SetView for MergeDiffEngine {
    fn value_count(&self) -> usize {
        self.shared.view.load().count()
    }

    fn id_at(&self, index: usize) -> Option<ItemId> {
        self.shared.view.load().id_at(index)
    }

    fn item_at(&self, index: usize) -> Option<Item> {
        let view = self.shared.view.load_full();
        let fetcher = self.fetcher(&view);
        match self.cache.try_borrow_mut() {
            Ok(mut cache) => cache.value(index, &fetcher),
            // 缓存正被编辑（只会发生在重入读取时）：绕过缓存直接取
            Err(_) => fetcher.fetch_range(index, 1).pop(),
        }
    }
}

impl SetEngine for MergeDiffEngine {
    fn base(&self) -> &EngineBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EngineBase {
        &mut self.base
    }

    fn commit_changes(&mut self) {
        let request = self.next_request();
        match self.base.mode() {
            UpdateMode::Synchronous => self.run_inline(request),
            UpdateMode::Asynchronous => self.dispatch(request),
        }
    }

    fn has_partition(&self, partition: PartitionId) -> bool {
        self.partition(partition).is_some()
    }

    fn update_mode_changing(&mut self, from: UpdateMode, _to: UpdateMode) {
        if from != UpdateMode::Asynchronous {
            return;
        }
        let grace = self.config.barrier_wait() * self.config.shutdown_retries.max(1);
        if !self.wait_for_update(grace) {
            tracing::warn!("pending cycle did not finish before mode switch");
        }
        self.shutdown_worker();
        self.finish_update();
    }

    fn process_events(&mut self) {
        self.flush();
        while let Ok(msg) = self.rx.try_recv() {
            self.handle_message(msg);
        }
    }
}

impl Drop for MergeDiffEngine {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

/// 窗口缓存的取数端：把可见索引翻译成 id，再按来源成批解析
struct Fetcher<'a> {
    view: &'a ViewState,
    partitions: &'a [Arc<dyn PartitionSource>],
    /// 按优先级排列的显式条目来源
    explicit: Vec<&'a [Item]>,
}

impl Fetcher<'_> {
    fn resolve_explicit(&self, ids: &[ItemId]) -> Vec<Item> {
        ids.iter()
            .map_while(|id| {
                self.explicit
                    .iter()
                    .find_map(|list| list.iter().find(|e| e.id == *id))
                    .cloned()
            })
            .collect()
    }

    fn resolve_partition(&self, partition: PartitionId, ids: &[ItemId]) -> Vec<Item> {
        let Some(source) = self.partitions.iter().find(|p| p.partition_id() == partition) else {
            tracing::warn!(
                "cannot resolve {} ids: {}",
                ids.len(),
                PartitionError::Unknown(partition)
            );
            return Vec::new();
        };
        match source.resolve(ids) {
            Ok(mut items) => {
                items.truncate(ids.len());
                items
            }
            Err(e) => {
                tracing::warn!("resolve from partition {} failed: {}", partition, e);
                Vec::new()
            }
        }
    }
}

impl RangeSource<Item> for Fetcher<'_> {
    fn value_count(&self) -> usize {
        self.view.count()
    }

    /// 相邻同分区的 id 合成一次 resolve；某段解析不全时到此为止
    fn fetch_range(&self, index: usize, count: usize) -> Vec<Item> {
        let ids = self.view.ids_in(index, count);
        let mut out = Vec::with_capacity(ids.len());
        let mut i = 0;
        while i < ids.len() {
            let partition = ids[i].partition;
            let run = ids[i..]
                .iter()
                .take_while(|id| id.partition == partition)
                .count();
            let batch = &ids[i..i + run];
            let items = if partition.is_explicit() {
                self.resolve_explicit(batch)
            } else {
                self.resolve_partition(partition, batch)
            };
            let complete = items.len() == batch.len();
            out.extend(items);
            if !complete {
                break;
            }
            i += run;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MemoryPartition, Value};
    use crate::event::ChangeFeed;
    use crate::query::Operator;
    use parking_lot::Mutex;

    const WAIT: Duration = Duration::from_secs(10);

    fn partition(id: u32, values: &[i64]) -> Arc<MemoryPartition> {
        let p = MemoryPartition::new(PartitionId(id));
        for v in values {
            p.insert(Item::detached().with("n", *v));
        }
        Arc::new(p)
    }

    fn engine(parts: &[Arc<MemoryPartition>], mode: UpdateMode) -> MergeDiffEngine {
        let dyns = parts
            .iter()
            .map(|p| p.clone() as Arc<dyn PartitionSource>)
            .collect();
        MergeDiffEngine::new(dyns, FilterCriteria::All, SortCriteria::ascending("n"), mode)
    }

    fn n(item: &Item) -> i64 {
        match item.get("n") {
            Some(Value::Int(n)) => *n,
            other => panic!("unexpected n: {:?}", other),
        }
    }

    fn visible(e: &mut MergeDiffEngine) -> Vec<i64> {
        e.items().iter().map(n).collect()
    }

    fn recorder(e: &mut MergeDiffEngine) -> Arc<Mutex<Vec<SetEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        e.subscribe(Box::new(move |ev: &SetEvent, _: &dyn SetView| {
            sink.lock().push(ev.clone())
        }));
        log
    }

    #[test]
    fn sync_merges_partitions_in_order() {
        let parts = vec![partition(0, &[1, 3, 5]), partition(1, &[2, 4, 6])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        assert_eq!(e.count(), 6);
        assert_eq!(visible(&mut e), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(e.state(), crate::engine::EngineState::Idle);
        assert_eq!(e.stage(), CycleStage::Clean);
    }

    #[test]
    fn sync_update_resets_once_and_applies_silently() {
        let parts = vec![partition(0, &[1, 3, 5]), partition(1, &[2, 4, 6])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        e.count();
        let log = recorder(&mut e);

        e.set_filter(FilterCriteria::clause("n", Operator::Less, 4i64));
        e.update();
        assert_eq!(*log.lock(), vec![SetEvent::Reset]);
        assert_eq!(visible(&mut e), vec![1, 2, 3]);
        assert_eq!(*log.lock(), vec![SetEvent::Reset]);
    }

    #[test]
    fn explicit_items_round_trip() {
        let parts = vec![partition(0, &[1, 3]), partition(1, &[5])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        let id = e.insert_content(Item::detached().with("n", 4i64));
        assert_eq!(visible(&mut e), vec![1, 3, 4, 5]);
        assert!(e.contains(&Item::new(id)));
        assert_eq!(e.content_id(2), Some(id));

        // 加入与过滤无关，可见性仍受过滤约束
        e.set_filter(FilterCriteria::clause("n", Operator::Less, 2i64));
        assert_eq!(visible(&mut e), vec![1]);
        assert!(!e.contains(&Item::new(id)));

        e.set_filter(FilterCriteria::clause("n", Operator::Less, 5i64));
        assert_eq!(visible(&mut e), vec![1, 3, 4]);
        assert!(e.contains(&Item::new(id)));
        assert_eq!(e.content_id(2), Some(id));

        assert!(e.remove_content(&Item::new(id)));
        assert_eq!(visible(&mut e), vec![1, 3]);
        assert!(!e.contains(&Item::new(id)));
        assert!(!e.remove_content(&Item::new(id)));
    }

    #[test]
    fn explicit_items_hidden_by_empty_or_invalid_filter() {
        let parts = vec![partition(0, &[1])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        let id = e.insert_content(Item::detached().with("n", 2i64));
        assert_eq!(visible(&mut e), vec![1, 2]);

        e.set_filter(FilterCriteria::Empty);
        assert!(e.is_empty());
        assert!(!e.contains(&Item::new(id)));

        e.set_filter(FilterCriteria::clause("n", Operator::Regex, "(["));
        assert!(e.is_empty());

        e.set_filter(FilterCriteria::All);
        assert_eq!(visible(&mut e), vec![1, 2]);
        assert!(e.contains(&Item::new(id)));
    }

    #[test]
    fn recompute_without_changes_emits_no_edits() {
        let parts = vec![partition(0, &[1, 3, 5]), partition(1, &[2, 4, 6])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        e.count();
        let before = e.stats();
        assert_eq!(before.inserts, 6);

        e.update();
        e.flush();
        let after = e.stats();
        assert_eq!(after.cycles, before.cycles + 1);
        assert_eq!((after.inserts, after.removes, after.refreshes), (6, 0, 0));
    }

    #[test]
    fn clear_empties_the_set() {
        let parts = vec![partition(0, &[1, 2])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        e.insert_content(Item::detached().with("n", 9i64));
        assert_eq!(e.count(), 3);
        e.clear();
        assert!(e.is_empty());
        assert!(e.filter().is_empty());
        assert!(!e.contains(&parts[0].get(ItemId::new(PartitionId(0), 1)).unwrap()));
    }

    #[test]
    fn contains_checks_partition_and_filter() {
        let parts = vec![partition(0, &[1, 5])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        e.set_filter(FilterCriteria::clause("n", Operator::Greater, 3i64));
        let low = parts[0].get(ItemId::new(PartitionId(0), 1)).unwrap();
        let high = parts[0].get(ItemId::new(PartitionId(0), 2)).unwrap();
        assert!(!e.contains(&low));
        assert!(e.contains(&high));
        let mut foreign = high.clone();
        foreign.id = ItemId::new(PartitionId(7), 2);
        assert!(!e.contains(&foreign));
    }

    #[test]
    fn failing_partition_gives_best_effort_result() {
        let parts = vec![partition(0, &[1, 3, 5]), partition(1, &[2, 4, 6])];
        parts[1].set_available(false);
        let mut e = engine(&parts, UpdateMode::Synchronous);
        assert_eq!(visible(&mut e), vec![1, 3, 5]);
        assert_eq!(e.stats().partition_failures, 1);
    }

    #[test]
    fn small_window_still_serves_every_row() {
        let values: Vec<i64> = (0..40).collect();
        let parts = vec![partition(0, &values)];
        let dyns = vec![parts[0].clone() as Arc<dyn PartitionSource>];
        let config = EngineConfig {
            frame_size: 3,
            frame_count: 2,
            ..EngineConfig::default()
        };
        let mut e =
            MergeDiffEngine::with_config(dyns, FilterCriteria::All, SortCriteria::descending("n"), config);
        let expected: Vec<i64> = (0..40).rev().collect();
        assert_eq!(visible(&mut e), expected);
        let stats = e.stats();
        assert!(stats.cache.evictions > 0);
        assert!(stats.cache_resident <= 6);
    }

    #[test]
    fn updated_record_in_place_takes_fast_path() {
        let parts = vec![partition(0, &[10, 20, 30])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        assert_eq!(visible(&mut e), vec![10, 20, 30]);
        let log = recorder(&mut e);
        let id = e.content_id(1).unwrap();

        parts[0].update(id, Item::detached().with("n", 25i64));
        e.apply_change(&ChangeEvent::updated(vec![id]));
        assert_eq!(*log.lock(), vec![SetEvent::Changed { start: 1, end: 1 }]);
        assert_eq!(e.content(1).map(|i| n(&i)), Some(25));
        let stats = e.stats();
        assert_eq!(stats.fast_refreshes, 1);
        assert_eq!(stats.cycles, 1);

        // 越过相邻条目：需要重算
        parts[0].update(id, Item::detached().with("n", 40i64));
        e.apply_change(&ChangeEvent::updated(vec![id]));
        assert_eq!(log.lock().last(), Some(&SetEvent::Reset));
        assert_eq!(visible(&mut e), vec![10, 30, 40]);
    }

    #[test]
    fn invisible_removal_is_ignored() {
        let parts = vec![partition(0, &[1, 2, 3])];
        let mut e = engine(&parts, UpdateMode::Synchronous);
        e.set_filter(FilterCriteria::clause("n", Operator::Less, 3i64));
        assert_eq!(e.count(), 2);
        let hidden = ItemId::new(PartitionId(0), 3);
        parts[0].remove(hidden);
        e.apply_change(&ChangeEvent::removed(vec![hidden]));
        assert!(!e.base().update_pending());

        let shown = ItemId::new(PartitionId(0), 1);
        parts[0].remove(shown);
        e.apply_change(&ChangeEvent::removed(vec![shown]));
        assert_eq!(visible(&mut e), vec![2]);
    }

    #[test]
    fn feed_events_and_overflow_schedule_recompute() {
        let (tx, mut rx) = ChangeFeed::bounded(1);
        let part = Arc::new(MemoryPartition::new(PartitionId(0)).with_feed(tx));
        let mut e = engine(&[part.clone()], UpdateMode::Synchronous);
        assert_eq!(e.count(), 0);

        part.insert(Item::detached().with("n", 1i64));
        assert_eq!(e.drain_changes(&mut rx), 1);
        assert_eq!(e.count(), 1);

        for v in 2..5i64 {
            part.insert(Item::detached().with("n", v));
        }
        e.drain_changes(&mut rx);
        assert_eq!(e.stats().feed_drops, 2);
        assert_eq!(visible(&mut e), vec![1, 2, 3, 4]);
    }

    #[test]
    fn async_cycle_emits_bracketed_notifications() {
        let parts = vec![partition(0, &[1, 3, 5]), partition(1, &[2, 4, 6])];
        let mut e = engine(&parts, UpdateMode::Asynchronous);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let mut before = 0usize;
        e.subscribe(Box::new(move |ev: &SetEvent, view: &dyn SetView| {
            match ev {
                SetEvent::AboutToBeInserted { .. } | SetEvent::AboutToBeRemoved { .. } => {
                    before = view.value_count();
                }
                _ => {}
            }
            if let Some(SetEvent::AboutToBeInserted { start, end }) = sink.lock().last() {
                if *ev == SetEvent::Inserted {
                    assert_eq!(view.value_count(), before + end - start + 1);
                    for i in *start..=*end {
                        assert!(view.item_at(i).is_some());
                    }
                }
            }
            if let Some(SetEvent::AboutToBeRemoved { start, end }) = sink.lock().last() {
                if *ev == SetEvent::Removed {
                    assert_eq!(view.value_count() + end - start + 1, before);
                }
            }
            sink.lock().push(ev.clone());
        }));

        assert!(e.wait_for_update(WAIT));
        assert_eq!(
            *log.lock(),
            vec![
                SetEvent::UpdateStarted,
                SetEvent::AboutToBeInserted { start: 0, end: 5 },
                SetEvent::Inserted,
                SetEvent::UpdateFinished,
            ]
        );
        assert_eq!(visible(&mut e), vec![1, 2, 3, 4, 5, 6]);

        // 尾部连续新增：恰好一对插入通知
        log.lock().clear();
        parts[0].insert(Item::detached().with("n", 7i64));
        parts[1].insert(Item::detached().with("n", 8i64));
        e.update();
        assert!(e.wait_for_update(WAIT));
        let inserts: Vec<SetEvent> = log
            .lock()
            .iter()
            .filter(|ev| matches!(ev, SetEvent::AboutToBeInserted { .. }))
            .cloned()
            .collect();
        assert_eq!(inserts, vec![SetEvent::AboutToBeInserted { start: 6, end: 7 }]);

        log.lock().clear();
        parts[0].remove(ItemId::new(PartitionId(0), 2));
        e.update();
        assert!(e.wait_for_update(WAIT));
        assert!(log
            .lock()
            .contains(&SetEvent::AboutToBeRemoved { start: 2, end: 2 }));
        assert_eq!(visible(&mut e), vec![1, 2, 4, 5, 6, 7, 8]);
        assert!(!e.update_in_progress());
    }

    #[test]
    fn async_refresh_follows_dirty_marks() {
        let parts = vec![partition(0, &[1, 2, 3])];
        let mut e = engine(&parts, UpdateMode::Asynchronous);
        assert!(e.wait_for_update(WAIT));
        let log = recorder(&mut e);

        // 周期进行中到达的 Updated 一律标记 dirty
        let id = ItemId::new(PartitionId(0), 2);
        e.update();
        parts[0].update(id, Item::detached().with("n", 2i64).with("tag", "x"));
        e.apply_change(&ChangeEvent::updated(vec![id]));
        assert!(e.wait_for_update(WAIT));
        assert!(log.lock().contains(&SetEvent::Changed { start: 1, end: 1 }));
        assert_eq!(
            e.content(1).and_then(|i| i.get("tag").cloned()),
            Some(Value::text("x"))
        );
    }

    #[test]
    fn switching_to_sync_stops_the_worker() {
        let parts = vec![partition(0, &[3, 1, 2])];
        let mut e = engine(&parts, UpdateMode::Asynchronous);
        assert!(e.wait_for_update(WAIT));
        assert!(e.worker.is_some());

        e.set_update_mode(UpdateMode::Synchronous);
        assert!(e.worker.is_none());
        assert_eq!(visible(&mut e), vec![1, 2, 3]);

        e.set_update_mode(UpdateMode::Asynchronous);
        e.set_sort_criteria(SortCriteria::descending("n"));
        assert!(e.wait_for_update(WAIT));
        assert_eq!(visible(&mut e), vec![3, 2, 1]);
    }

    /// 第一次查询阻塞 `stall`，之后照常
    struct StallingPartition {
        inner: Arc<MemoryPartition>,
        stall: Duration,
        stalled: std::sync::atomic::AtomicBool,
    }

    impl PartitionSource for StallingPartition {
        fn partition_id(&self) -> PartitionId {
            self.inner.partition_id()
        }

        fn query_ids(
            &self,
            filter: &FilterCriteria,
            sort: &SortCriteria,
        ) -> Result<Vec<ItemId>, PartitionError> {
            if !self.stalled.swap(true, std::sync::atomic::Ordering::SeqCst) {
                std::thread::sleep(self.stall);
            }
            self.inner.query_ids(filter, sort)
        }

        fn resolve(&self, ids: &[ItemId]) -> Result<Vec<Item>, PartitionError> {
            self.inner.resolve(ids)
        }
    }

    fn stalling_engine(values: &[i64]) -> MergeDiffEngine {
        let source = StallingPartition {
            inner: partition(0, values),
            stall: Duration::from_secs(3),
            stalled: std::sync::atomic::AtomicBool::new(false),
        };
        let config = EngineConfig {
            update_mode: UpdateMode::Asynchronous,
            barrier_wait_ms: 5,
            shutdown_retries: 2,
            ..EngineConfig::default()
        };
        let mut e = MergeDiffEngine::with_config(
            vec![Arc::new(source)],
            FilterCriteria::All,
            SortCriteria::ascending("n"),
            config,
        );
        e.process_events();
        e
    }

    #[test]
    fn drop_with_stalled_query_is_bounded() {
        let e = stalling_engine(&[1, 2]);
        let started = Instant::now();
        drop(e);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn detached_worker_does_not_block_mode_switch() {
        let mut e = stalling_engine(&[3, 1, 2]);
        e.set_update_mode(UpdateMode::Synchronous);
        assert!(e.worker.is_none());
        assert!(!e.update_in_progress());
        assert_eq!(visible(&mut e), vec![1, 2, 3]);
        assert_eq!(e.stage(), CycleStage::Clean);
    }

    #[test]
    fn drop_while_cycle_runs_does_not_hang() {
        let values: Vec<i64> = (0..5000).collect();
        let parts = vec![partition(0, &values), partition(1, &values)];
        let mut e = engine(&parts, UpdateMode::Asynchronous);
        e.process_events();
        drop(e);
    }
}
