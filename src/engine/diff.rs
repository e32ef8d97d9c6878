use std::collections::{HashMap, HashSet};

use crate::core::ItemId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EditKind {
    Insert,
    Remove,
    Refresh,
}

/// 一条增量编辑。
///
/// `start` 为编辑发生时可见索引空间中的起点；`primary` / `secondary`
/// 是此刻旧序列与新序列上的游标，owner 应用时据此设置过渡标记。
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Edit {
    pub kind: EditKind,
    pub start: usize,
    pub count: usize,
    pub primary: usize,
    pub secondary: usize,
}

impl Edit {
    fn insert(count: usize, primary: usize, secondary: usize) -> Self {
        Self {
            kind: EditKind::Insert,
            start: secondary,
            count,
            primary,
            secondary,
        }
    }

    fn remove(count: usize, primary: usize, secondary: usize) -> Self {
        Self {
            kind: EditKind::Remove,
            start: secondary,
            count,
            primary,
            secondary,
        }
    }

    /// 闭区间终点（用于通知）
    pub fn end(&self) -> usize {
        self.start + self.count.saturating_sub(1)
    }
}

struct RefreshRun {
    primary: usize,
    secondary: usize,
    count: usize,
}

struct Emitter<'a> {
    edits: Vec<Edit>,
    run: Option<RefreshRun>,
    dirty: &'a HashSet<ItemId>,
}

impl Emitter<'_> {
    fn matched(&mut self, id: ItemId, p: usize, s: usize) {
        if !self.dirty.contains(&id) {
            self.close_run();
            return;
        }
        match &mut self.run {
            Some(r) if r.secondary + r.count == s => r.count += 1,
            _ => {
                self.close_run();
                self.run = Some(RefreshRun {
                    primary: p,
                    secondary: s,
                    count: 1,
                });
            }
        }
    }

    fn close_run(&mut self) {
        if let Some(r) = self.run.take() {
            self.edits.push(Edit {
                kind: EditKind::Refresh,
                start: r.secondary,
                count: r.count,
                primary: r.primary,
                secondary: r.secondary,
            });
        }
    }

    fn push(&mut self, edit: Edit) {
        self.close_run();
        if edit.count > 0 {
            self.edits.push(edit);
        }
    }
}

/// 计算把 `primary`（旧可见序列）变成 `secondary`（新序列）的编辑脚本。
///
/// 两个只进游标线性扫描：
/// - 相同 id：一起前进；若该 id 在 `dirty` 中，合并为 `Refresh`；
/// - 旧 id 在新序列后方重现：其间新 id 为 `Insert`；
/// - 新 id 在旧序列后方找到：跳过的旧 id 为 `Remove`；
/// - 两者都重现（换位）：取较短的一侧；
/// - 都不重现：把分歧段按“先删后插”替换，直到下一个双方共有的 id。
///
/// 任意输入下脚本都正确（应用后恰好得到 `secondary`）；对单段连续插入或删除是最小的。
/// 一般情况下不保证最小编辑距离，这是 O(n) 扫描的取舍。
pub fn synchronize_single_set(
    primary: &[ItemId],
    secondary: &[ItemId],
    dirty: &HashSet<ItemId>,
) -> Vec<Edit> {
    let mut out = Emitter {
        edits: Vec::new(),
        run: None,
        dirty,
    };

    if primary.is_empty() {
        out.push(Edit::insert(secondary.len(), 0, 0));
        return out.edits;
    }
    if secondary.is_empty() {
        out.push(Edit::remove(primary.len(), 0, 0));
        return out.edits;
    }

    let old_pos: HashMap<ItemId, usize> = primary.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let new_pos: HashMap<ItemId, usize> =
        secondary.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let (mut p, mut s) = (0usize, 0usize);
    while p < primary.len() && s < secondary.len() {
        let (old_id, new_id) = (primary[p], secondary[s]);
        if old_id == new_id {
            out.matched(old_id, p, s);
            p += 1;
            s += 1;
            continue;
        }

        let old_later = new_pos.get(&old_id).copied().filter(|&j| j > s);
        let new_later = old_pos.get(&new_id).copied().filter(|&k| k > p);

        match (old_later, new_later) {
            (Some(j), None) => {
                out.push(Edit::insert(j - s, p, s));
                s = j;
            }
            (None, Some(k)) => {
                out.push(Edit::remove(k - p, p, s));
                p = k;
            }
            (Some(j), Some(k)) => {
                if j - s <= k - p {
                    out.push(Edit::insert(j - s, p, s));
                    s = j;
                } else {
                    out.push(Edit::remove(k - p, p, s));
                    p = k;
                }
            }
            (None, None) => {
                let p2 = (p + 1..primary.len())
                    .find(|&q| new_pos.get(&primary[q]).is_some_and(|&j| j >= s))
                    .unwrap_or(primary.len());
                let s2 = (s + 1..secondary.len())
                    .find(|&t| old_pos.get(&secondary[t]).is_some_and(|&k| k >= p))
                    .unwrap_or(secondary.len());
                out.push(Edit::remove(p2 - p, p, s));
                p = p2;
                out.push(Edit::insert(s2 - s, p, s));
                s = s2;
            }
        }
    }

    if p < primary.len() {
        out.push(Edit::remove(primary.len() - p, p, s));
    }
    if s < secondary.len() {
        out.push(Edit::insert(secondary.len() - s, primary.len(), s));
    }
    out.close_run();
    out.edits
}

/// 把编辑脚本作用到旧序列上（测试与校验用）
pub fn apply_edits(primary: &[ItemId], secondary: &[ItemId], edits: &[Edit]) -> Vec<ItemId> {
    let mut visible = primary.to_vec();
    for e in edits {
        match e.kind {
            EditKind::Insert => {
                let fresh = secondary[e.secondary..e.secondary + e.count].iter().copied();
                visible.splice(e.start..e.start, fresh);
            }
            EditKind::Remove => {
                visible.drain(e.start..e.start + e.count);
            }
            EditKind::Refresh => {}
        }
    }
    visible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PartitionId;
    use proptest::prelude::*;

    fn ids(v: &[u64]) -> Vec<ItemId> {
        v.iter().map(|&l| ItemId::new(PartitionId(0), l)).collect()
    }

    fn diff(old: &[u64], new: &[u64]) -> Vec<Edit> {
        synchronize_single_set(&ids(old), &ids(new), &HashSet::new())
    }

    #[test]
    fn contiguous_insert_is_a_single_edit() {
        let e = diff(&[1, 2, 3, 4], &[1, 2, 7, 8, 9, 3, 4]);
        assert_eq!(e, vec![Edit::insert(3, 2, 2)]);
        let e = diff(&[1, 2], &[1, 2, 3]);
        assert_eq!(e, vec![Edit::insert(1, 2, 2)]);
    }

    #[test]
    fn contiguous_remove_is_a_single_edit() {
        let e = diff(&[1, 2, 7, 8, 9, 3, 4], &[1, 2, 3, 4]);
        assert_eq!(e, vec![Edit::remove(3, 2, 2)]);
        let e = diff(&[5, 1, 2], &[1, 2]);
        assert_eq!(e, vec![Edit::remove(1, 0, 0)]);
    }

    #[test]
    fn empty_sides_are_full_range_edits() {
        assert_eq!(diff(&[], &[7]), vec![Edit::insert(1, 0, 0)]);
        assert_eq!(diff(&[1, 2, 3], &[]), vec![Edit::remove(3, 0, 0)]);
        assert!(diff(&[], &[]).is_empty());
    }

    #[test]
    fn unchanged_sequences_emit_nothing() {
        assert!(diff(&[1, 2, 3], &[1, 2, 3]).is_empty());
    }

    #[test]
    fn divergent_span_is_replaced() {
        let old = ids(&[1, 2, 3, 9]);
        let new = ids(&[1, 5, 6, 9]);
        let e = synchronize_single_set(&old, &new, &HashSet::new());
        assert_eq!(e, vec![Edit::remove(2, 1, 1), Edit::insert(2, 3, 1)]);
        assert_eq!(apply_edits(&old, &new, &e), new);
    }

    #[test]
    fn dirty_matches_become_refresh_runs() {
        let old = ids(&[1, 2, 3, 4, 5]);
        let new = ids(&[1, 2, 3, 4, 5]);
        let dirty: HashSet<ItemId> = ids(&[2, 3, 5]).into_iter().collect();
        let e = synchronize_single_set(&old, &new, &dirty);
        assert_eq!(e.len(), 2);
        assert_eq!((e[0].kind, e[0].start, e[0].count), (EditKind::Refresh, 1, 2));
        assert_eq!((e[1].kind, e[1].start, e[1].count), (EditKind::Refresh, 4, 1));
    }

    #[test]
    fn swapped_neighbours_round_trip() {
        let old = ids(&[1, 2, 3, 4]);
        let new = ids(&[1, 3, 2, 4]);
        let e = synchronize_single_set(&old, &new, &HashSet::new());
        assert_eq!(apply_edits(&old, &new, &e), new);
        assert!(e.iter().all(|x| x.count == 1));
    }

    proptest! {
        #[test]
        fn script_always_reproduces_new_sequence(
            old in proptest::sample::subsequence((0u64..60).collect::<Vec<_>>(), 0..60).prop_shuffle(),
            new in proptest::sample::subsequence((0u64..60).collect::<Vec<_>>(), 0..60).prop_shuffle(),
        ) {
            let (old, new) = (ids(&old), ids(&new));
            let e = synchronize_single_set(&old, &new, &HashSet::new());
            prop_assert_eq!(apply_edits(&old, &new, &e), new);
        }

        #[test]
        fn contiguous_insert_yields_one_edit(
            base in proptest::sample::subsequence((0u64..60).collect::<Vec<_>>(), 0..60).prop_shuffle(),
            k in 1usize..10,
            at in any::<proptest::sample::Index>(),
        ) {
            let p = at.index(base.len() + 1);
            let mut grown = base.clone();
            grown.splice(p..p, (100..100 + k as u64).collect::<Vec<_>>());
            let e = diff(&base, &grown);
            prop_assert_eq!(e.len(), 1);
            prop_assert_eq!((e[0].kind, e[0].start, e[0].count), (EditKind::Insert, p, k));
        }

        #[test]
        fn contiguous_remove_yields_one_edit(
            base in proptest::sample::subsequence((0u64..60).collect::<Vec<_>>(), 1..60).prop_shuffle(),
            k in 1usize..10,
            at in any::<proptest::sample::Index>(),
        ) {
            let k = k.min(base.len());
            let p = at.index(base.len() - k + 1);
            let mut shrunk = base.clone();
            shrunk.drain(p..p + k);
            let e = diff(&base, &shrunk);
            prop_assert_eq!(e.len(), 1);
            prop_assert_eq!((e[0].kind, e[0].start, e[0].count), (EditKind::Remove, p, k));
        }
    }
}
