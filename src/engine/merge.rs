use rayon::prelude::*;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::{Item, ItemId, PartitionId, PartitionSource};
use crate::engine::diff::{synchronize_single_set, Edit};
use crate::error::PartitionError;
use crate::query::{CompiledFilter, FilterCriteria, SortCriteria};

/// 归并时每个游标一次解析的条目数
pub const DEFAULT_LOOKAHEAD: usize = 20;

/// 参与归并的一路有序 id 列表
pub enum MergeSource {
    Partition {
        source: Arc<dyn PartitionSource>,
        ids: Vec<ItemId>,
    },
    /// 显式条目：已按同一比较器排好序，条目本身已在内存中
    Explicit(Arc<Vec<Item>>),
}

impl MergeSource {
    fn len(&self) -> usize {
        match self {
            MergeSource::Partition { ids, .. } => ids.len(),
            MergeSource::Explicit(items) => items.len(),
        }
    }

    fn into_ids(self) -> Vec<ItemId> {
        match self {
            MergeSource::Partition { ids, .. } => ids,
            MergeSource::Explicit(items) => items.iter().map(|i| i.id).collect(),
        }
    }
}

struct Cursor {
    source: MergeSource,
    pos: usize,
    /// 已解析的前瞻窗口：对应 ids[pos..pos + window.len()]
    window: VecDeque<Item>,
    /// 解析失败后截断到此处
    limit: usize,
}

impl Cursor {
    fn new(source: MergeSource) -> Self {
        let limit = source.len();
        Self {
            source,
            pos: 0,
            window: VecDeque::new(),
            limit,
        }
    }

    fn fill(&mut self, lookahead: usize) -> Result<(), PartitionError> {
        if !self.window.is_empty() || self.pos >= self.limit {
            return Ok(());
        }
        let end = (self.pos + lookahead.max(1)).min(self.limit);
        match &self.source {
            MergeSource::Partition { source, ids } => {
                let batch = &ids[self.pos..end];
                let items = source.resolve(batch)?;
                if items.len() != batch.len() {
                    return Err(PartitionError::Resolve {
                        partition: source.partition_id(),
                        missing: batch.len().saturating_sub(items.len()),
                    });
                }
                self.window.extend(items);
            }
            MergeSource::Explicit(items) => {
                self.window.extend(items[self.pos..end].iter().cloned());
            }
        }
        Ok(())
    }

    fn current(&self) -> Option<&Item> {
        self.window.front()
    }

    fn advance(&mut self) -> ItemId {
        self.window.pop_front();
        let id = match &self.source {
            MergeSource::Partition { ids, .. } => ids[self.pos],
            MergeSource::Explicit(items) => items[self.pos].id,
        };
        self.pos += 1;
        id
    }

    fn partition(&self) -> PartitionId {
        match &self.source {
            MergeSource::Partition { source, .. } => source.partition_id(),
            MergeSource::Explicit(_) => PartitionId::EXPLICIT,
        }
    }
}

/// k 路归并：各路已按 `sort` 有序，输出整体有序的 id 序列。
///
/// 只有一路非空时直接返回该路（无需解析条目）。平局按来源顺序打破（靠前的先出）。
/// 某一路解析失败时记录日志并截断该路剩余部分，其余各路照常归并。
/// 返回 `None` 表示被取消。
pub fn merge_sorted(
    sources: Vec<MergeSource>,
    sort: &SortCriteria,
    lookahead: usize,
    cancel: &AtomicBool,
) -> Option<(Vec<ItemId>, usize)> {
    let mut sources: Vec<MergeSource> = sources.into_iter().filter(|s| s.len() > 0).collect();
    match sources.len() {
        0 => return Some((Vec::new(), 0)),
        1 => return sources.pop().map(|s| (s.into_ids(), 0)),
        _ => {}
    }

    let total: usize = sources.iter().map(|s| s.len()).sum();
    let mut out = Vec::with_capacity(total);
    let mut failures = 0;
    let mut cursors: Vec<Cursor> = sources.into_iter().map(Cursor::new).collect();

    loop {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        for c in cursors.iter_mut() {
            if let Err(e) = c.fill(lookahead) {
                tracing::warn!(
                    "merge: partition {} dropped after {} ids: {}",
                    c.partition(),
                    c.pos,
                    e
                );
                c.limit = c.pos;
                failures += 1;
            }
        }

        let mut best: Option<(usize, &Item)> = None;
        for (i, c) in cursors.iter().enumerate() {
            let Some(item) = c.current() else { continue };
            best = match best {
                Some((_, b)) if sort.compare(item, b) != std::cmp::Ordering::Less => best,
                _ => Some((i, item)),
            };
        }
        let Some((winner, _)) = best else { break };
        out.push(cursors[winner].advance());
    }
    Some((out, failures))
}

/// 各分区并行执行下推查询；失败的分区记日志并按空列表处理
pub fn query_partitions(
    partitions: &[Arc<dyn PartitionSource>],
    filter: &FilterCriteria,
    sort: &SortCriteria,
) -> (Vec<MergeSource>, usize) {
    let results: Vec<(Arc<dyn PartitionSource>, Result<Vec<ItemId>, PartitionError>)> = partitions
        .par_iter()
        .map(|p| (p.clone(), p.query_ids(filter, sort)))
        .collect();

    let mut failures = 0;
    let mut sources = Vec::with_capacity(results.len());
    for (source, res) in results {
        match res {
            Ok(ids) => sources.push(MergeSource::Partition { source, ids }),
            Err(e) => {
                tracing::warn!(
                    "partition {} query failed, treating as empty: {}",
                    source.partition_id(),
                    e
                );
                failures += 1;
            }
        }
    }
    (sources, failures)
}

/// 一次重算所需的全部输入快照（取自引擎共享状态，之后无锁使用）
#[derive(Clone)]
pub(crate) struct CycleRequest {
    pub generation: u64,
    pub filter: FilterCriteria,
    pub sort: SortCriteria,
    pub explicit: Arc<Vec<Item>>,
    pub dirty: HashSet<ItemId>,
    pub partitions: Arc<Vec<Arc<dyn PartitionSource>>>,
    pub lookahead: usize,
}

pub(crate) struct CycleOutcome {
    pub secondary: Arc<Vec<ItemId>>,
    pub edits: Vec<Edit>,
    pub failures: usize,
}

/// 显式条目中满足过滤条件的部分（保持原有次序）；全部通过时共享原快照
fn filter_explicit(explicit: &Arc<Vec<Item>>, filter: &CompiledFilter) -> Arc<Vec<Item>> {
    if explicit.iter().all(|item| filter.matches(item)) {
        return explicit.clone();
    }
    Arc::new(
        explicit
            .iter()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect(),
    )
}

/// 查询 → 归并 → 与旧序列求差。取消时返回 `None`。
pub(crate) fn recompute(
    request: &CycleRequest,
    primary: &[ItemId],
    cancel: &AtomicBool,
    on_diff: impl FnOnce(),
) -> Option<CycleOutcome> {
    let mut failures = 0;
    let mut sources = Vec::new();

    // 空过滤条件或非法条件：分区与显式条目都不贡献任何条目
    let compiled = if request.filter.is_empty() {
        None
    } else {
        match request.filter.compile() {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("invalid filter, nothing is visible: {}", e);
                None
            }
        }
    };
    if let Some(compiled) = &compiled {
        let (found, failed) = query_partitions(&request.partitions, &request.filter, &request.sort);
        sources = found;
        failures += failed;
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        let admitted = filter_explicit(&request.explicit, compiled);
        if !admitted.is_empty() {
            sources.push(MergeSource::Explicit(admitted));
        }
    }

    let (merged, merge_failures) =
        merge_sorted(sources, &request.sort, request.lookahead, cancel)?;
    failures += merge_failures;
    if cancel.load(Ordering::Relaxed) {
        return None;
    }

    on_diff();
    let edits = synchronize_single_set(primary, &merged, &request.dirty);
    tracing::debug!(
        "cycle {}: {} -> {} ids, {} edits",
        request.generation,
        primary.len(),
        merged.len(),
        edits.len()
    );
    Some(CycleOutcome {
        secondary: Arc::new(merged),
        edits,
        failures,
    })
}
