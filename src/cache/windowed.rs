use std::ops::Range;

/// 取数钩子：窗口缓存缺页时按区间批量取值
pub trait RangeSource<T> {
    /// 虚拟索引空间大小：合法索引为 `0..value_count()`
    fn value_count(&self) -> usize;

    /// 取 `[index, index + count)` 的值；可以少给（尾部越界），不能多给
    fn fetch_range(&self, index: usize, count: usize) -> Vec<T>;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Frame<T> {
    /// 与前一帧末尾之间未缓存的索引个数
    offset: usize,
    values: Vec<T>,
    prev: Option<usize>,
    next: Option<usize>,
    /// 淘汰链：hotter 方向是最近命中
    hotter: Option<usize>,
    colder: Option<usize>,
    live: bool,
}

enum Locate {
    Hit {
        frame: usize,
        pos: usize,
    },
    Gap {
        prev: Option<usize>,
        prev_end: usize,
        next: Option<usize>,
        next_start: Option<usize>,
    },
}

/// 窗口缓存：把 `0..N` 的虚拟索引映射到按需取回的值，常驻内存只有有限个定长帧。
///
/// 帧放在 arena 里，用下标串成两条互相独立的双向链：
/// - 索引序链（`prev/next` + `offset`）：从表头累加 offset 与帧长即得每帧起点；
/// - 热度链（`hotter/colder`）：只用于淘汰，命中时前移一格。
///
/// 池满时回收最冷的一帧并原地搬迁到新位置（O(1) 改链，不整体失效）。
/// 结构编辑（insert/remove/refresh）就地调整帧边界，供增量更新同步索引空间。
pub struct WindowedCache<T> {
    frames: Vec<Frame<T>>,
    frame_size: usize,
    head: Option<usize>,
    coldest: Option<usize>,
    hottest: Option<usize>,
    free: Vec<usize>,
    stats: CacheStats,
}

impl<T: Clone> WindowedCache<T> {
    pub fn new(frame_size: usize, frame_count: usize) -> Self {
        let frame_size = frame_size.max(1);
        let frame_count = frame_count.max(1);
        let frames = (0..frame_count)
            .map(|_| Frame {
                offset: 0,
                values: Vec::with_capacity(frame_size),
                prev: None,
                next: None,
                hotter: None,
                colder: None,
                live: false,
            })
            .collect();
        Self {
            frames,
            frame_size,
            head: None,
            coldest: None,
            hottest: None,
            free: (0..frame_count).rev().collect(),
            stats: CacheStats::default(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// 当前常驻的值个数
    pub fn resident(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.live)
            .map(|f| f.values.len())
            .sum()
    }

    /// 已缓存区间（按索引序）
    pub fn cached_ranges(&self) -> Vec<Range<usize>> {
        self.layout()
            .into_iter()
            .map(|(f, start)| start..start + self.frames[f].values.len())
            .collect()
    }

    pub fn value(&mut self, index: usize, source: &impl RangeSource<T>) -> Option<T> {
        let total = source.value_count();
        if index >= total {
            return None;
        }

        let (prev, prev_end, next, next_start) = match self.locate(index) {
            Locate::Hit { frame, pos } => {
                self.stats.hits += 1;
                self.promote(frame);
                return Some(self.frames[frame].values[pos].clone());
            }
            Locate::Gap {
                prev,
                prev_end,
                next,
                next_start,
            } => (prev, prev_end, next, next_start),
        };
        self.stats.misses += 1;
        let gap_end = next_start.unwrap_or(total).min(total);

        // 紧接前一帧末尾且该帧还有空间：直接延长
        if let Some(p) = prev {
            let len = self.frames[p].values.len();
            if index == prev_end && len < self.frame_size {
                let want = (self.frame_size - len).min(gap_end - index);
                let fetched = source.fetch_range(index, want);
                let n = fetched.len().min(want);
                if n == 0 {
                    return None;
                }
                let v = fetched[0].clone();
                self.frames[p].values.extend(fetched.into_iter().take(n));
                if let Some(nx) = next {
                    self.frames[nx].offset -= n;
                }
                self.promote(p);
                return Some(v);
            }
        }

        let want = self.frame_size.min(gap_end - index);
        let fetched = source.fetch_range(index, want);
        let n = fetched.len().min(want);
        if n == 0 {
            return None;
        }
        let v = fetched[0].clone();

        // 分配可能淘汰并摘除某一帧，链结构已变化，需要重新定位缺口
        let f = self.allocate();
        let (prev, prev_end, next) = match self.locate(index) {
            Locate::Gap {
                prev,
                prev_end,
                next,
                ..
            } => (prev, prev_end, next),
            Locate::Hit { .. } => {
                // 摘除一帧不会让缺口变成命中
                debug_assert!(false, "gap turned into a hit after eviction");
                self.retire(f);
                return Some(v);
            }
        };
        let lead = index - prev_end;
        self.frames[f].offset = lead;
        self.frames[f].values.extend(fetched.into_iter().take(n));
        if let Some(nx) = next {
            self.frames[nx].offset -= lead + n;
        }
        self.link_after(prev, f);
        self.push_hottest(f);
        #[cfg(debug_assertions)]
        self.assert_invariants();
        Some(v)
    }

    /// 在 `index` 处插入 `count` 个尚未缓存的索引。
    /// 跨越插入点的帧截断尾部（尾部值之后按需重取）。
    pub fn insert_range(&mut self, index: usize, count: usize) {
        if count == 0 {
            return;
        }
        let mut order = self.layout();
        for (f, start) in order.iter_mut() {
            let len = self.frames[*f].values.len();
            if *start >= index {
                *start += count;
            } else if *start + len > index {
                self.frames[*f].values.truncate(index - *start);
            }
        }
        self.relayout(&order);
    }

    /// 删除 `[index, index + count)`：与之重叠的帧收缩，完全被吞掉的帧归还空闲池
    pub fn remove_range(&mut self, index: usize, count: usize) {
        if count == 0 {
            return;
        }
        let end = index + count;
        let mut kept = Vec::new();
        for (f, start) in self.layout() {
            let fend = start + self.frames[f].values.len();
            if fend <= index {
                kept.push((f, start));
                continue;
            }
            if start >= end {
                kept.push((f, start - count));
                continue;
            }
            let lo = index.max(start) - start;
            let hi = end.min(fend) - start;
            self.frames[f].values.drain(lo..hi);
            if self.frames[f].values.is_empty() {
                self.retire(f);
                continue;
            }
            // 保留段必然连续：前半在 index 之前，后半平移到 index 处
            kept.push((f, start.min(index)));
        }
        self.relayout(&kept);
    }

    /// 位置不变但内容已过期：重取 `[index, index + count)` 中已缓存的部分
    pub fn refresh_range(&mut self, index: usize, count: usize, source: &impl RangeSource<T>) {
        if count == 0 {
            return;
        }
        let end = index + count;
        let mut kept = Vec::new();
        for (f, start) in self.layout() {
            let fend = start + self.frames[f].values.len();
            let lo = index.max(start);
            let hi = end.min(fend);
            if lo >= hi {
                kept.push((f, start));
                continue;
            }
            let fetched = source.fetch_range(lo, hi - lo);
            let got = fetched.len().min(hi - lo);
            let base = lo - start;
            for (k, v) in fetched.into_iter().take(got).enumerate() {
                self.frames[f].values[base + k] = v;
            }
            if got < hi - lo {
                // 数据源少给：截断到已确认的部分
                self.frames[f].values.truncate(base + got);
            }
            if self.frames[f].values.is_empty() {
                self.retire(f);
            } else {
                kept.push((f, start));
            }
        }
        self.relayout(&kept);
    }

    /// 丢弃所有缓存（帧全部归还空闲池）
    pub fn clear(&mut self) {
        for (f, _) in self.layout() {
            self.retire(f);
        }
        self.head = None;
    }

    fn locate(&self, index: usize) -> Locate {
        let mut prev = None;
        let mut prev_end = 0;
        let mut cur = self.head;
        while let Some(f) = cur {
            let frame = &self.frames[f];
            let start = prev_end + frame.offset;
            if index < start {
                return Locate::Gap {
                    prev,
                    prev_end,
                    next: Some(f),
                    next_start: Some(start),
                };
            }
            let end = start + frame.values.len();
            if index < end {
                return Locate::Hit {
                    frame: f,
                    pos: index - start,
                };
            }
            prev = Some(f);
            prev_end = end;
            cur = frame.next;
        }
        Locate::Gap {
            prev,
            prev_end,
            next: None,
            next_start: None,
        }
    }

    /// (帧, 起始索引)，按索引序
    fn layout(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut pos = 0;
        let mut cur = self.head;
        while let Some(f) = cur {
            let frame = &self.frames[f];
            let start = pos + frame.offset;
            out.push((f, start));
            pos = start + frame.values.len();
            cur = frame.next;
        }
        out
    }

    /// 按给定的 (帧, 新起点) 重建索引序链与 offset
    fn relayout(&mut self, order: &[(usize, usize)]) {
        self.head = order.first().map(|(f, _)| *f);
        let mut prev: Option<usize> = None;
        let mut prev_end = 0;
        for &(f, start) in order {
            debug_assert!(start >= prev_end, "frames overlap after structural edit");
            let frame = &mut self.frames[f];
            frame.offset = start - prev_end;
            frame.prev = prev;
            frame.next = None;
            prev_end = start + frame.values.len();
            if let Some(p) = prev {
                self.frames[p].next = Some(f);
            }
            prev = Some(f);
        }
        #[cfg(debug_assertions)]
        self.assert_invariants();
    }

    fn allocate(&mut self) -> usize {
        if let Some(f) = self.free.pop() {
            self.frames[f].live = true;
            self.frames[f].values.clear();
            return f;
        }
        // 池满：回收最冷的一帧，摘出索引链后复用
        let Some(f) = self.coldest else {
            unreachable!("frame pool is empty but no live frames exist");
        };
        self.stats.evictions += 1;
        self.unlink_index(f);
        self.unlink_heat(f);
        self.frames[f].values.clear();
        f
    }

    fn retire(&mut self, f: usize) {
        self.unlink_heat(f);
        let frame = &mut self.frames[f];
        frame.live = false;
        frame.values.clear();
        frame.prev = None;
        frame.next = None;
        frame.offset = 0;
        self.free.push(f);
    }

    /// 摘出索引序链：本帧跨度并入后继的 offset
    fn unlink_index(&mut self, f: usize) {
        let (prev, next, span) = {
            let frame = &self.frames[f];
            (frame.prev, frame.next, frame.offset + frame.values.len())
        };
        match prev {
            Some(p) => self.frames[p].next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.frames[n].prev = prev;
            self.frames[n].offset += span;
        }
        self.frames[f].prev = None;
        self.frames[f].next = None;
        self.frames[f].offset = 0;
    }

    fn link_after(&mut self, prev: Option<usize>, f: usize) {
        let next = match prev {
            Some(p) => self.frames[p].next,
            None => self.head,
        };
        self.frames[f].prev = prev;
        self.frames[f].next = next;
        match prev {
            Some(p) => self.frames[p].next = Some(f),
            None => self.head = Some(f),
        }
        if let Some(n) = next {
            self.frames[n].prev = Some(f);
        }
    }

    fn unlink_heat(&mut self, f: usize) {
        let (hotter, colder) = (self.frames[f].hotter, self.frames[f].colder);
        match hotter {
            Some(h) => self.frames[h].colder = colder,
            None => self.hottest = colder,
        }
        match colder {
            Some(c) => self.frames[c].hotter = hotter,
            None => self.coldest = hotter,
        }
        self.frames[f].hotter = None;
        self.frames[f].colder = None;
    }

    fn push_hottest(&mut self, f: usize) {
        self.frames[f].colder = self.hottest;
        self.frames[f].hotter = None;
        match self.hottest {
            Some(h) => self.frames[h].hotter = Some(f),
            None => self.coldest = Some(f),
        }
        self.hottest = Some(f);
    }

    /// 命中：与更热的邻居交换位置（前移一格）
    fn promote(&mut self, f: usize) {
        let Some(h) = self.frames[f].hotter else {
            return;
        };
        self.unlink_heat(f);
        let above = self.frames[h].hotter;
        self.frames[f].colder = Some(h);
        self.frames[f].hotter = above;
        self.frames[h].hotter = Some(f);
        match above {
            Some(a) => self.frames[a].colder = Some(f),
            None => self.hottest = Some(f),
        }
    }

    /// 结构不变量：帧不重叠、链表双向一致、热度链恰好覆盖所有活跃帧。
    /// 违反即编程错误，直接 panic。
    pub fn assert_invariants(&self) {
        let mut live_in_order = 0;
        let mut prev: Option<usize> = None;
        let mut cur = self.head;
        while let Some(f) = cur {
            let frame = &self.frames[f];
            assert!(frame.live, "retired frame {} still linked", f);
            assert!(!frame.values.is_empty(), "empty frame {} linked", f);
            assert!(frame.values.len() <= self.frame_size, "frame {} overfull", f);
            assert_eq!(frame.prev, prev, "frame {} back link broken", f);
            live_in_order += 1;
            prev = Some(f);
            cur = frame.next;
        }

        let mut live_in_heat = 0;
        let mut colder: Option<usize> = None;
        let mut cur = self.coldest;
        while let Some(f) = cur {
            assert!(self.frames[f].live, "retired frame {} in heat list", f);
            assert_eq!(self.frames[f].colder, colder, "heat back link broken at {}", f);
            live_in_heat += 1;
            colder = Some(f);
            cur = self.frames[f].hotter;
        }
        assert_eq!(self.hottest, colder);

        assert_eq!(live_in_order, live_in_heat, "index and heat lists disagree");
        assert_eq!(live_in_order + self.free.len(), self.frames.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::{Cell, RefCell};

    struct VecSource {
        data: RefCell<Vec<u32>>,
        fetches: Cell<usize>,
    }

    impl VecSource {
        fn new(data: Vec<u32>) -> Self {
            Self {
                data: RefCell::new(data),
                fetches: Cell::new(0),
            }
        }
    }

    impl RangeSource<u32> for VecSource {
        fn value_count(&self) -> usize {
            self.data.borrow().len()
        }

        fn fetch_range(&self, index: usize, count: usize) -> Vec<u32> {
            self.fetches.set(self.fetches.get() + 1);
            let d = self.data.borrow();
            let end = (index + count).min(d.len());
            d.get(index..end).map(|s| s.to_vec()).unwrap_or_default()
        }
    }

    #[test]
    fn sequential_reads_extend_one_frame() {
        let src = VecSource::new((0..100).collect());
        let mut c = WindowedCache::new(8, 4);
        assert_eq!(c.value(0, &src), Some(0));
        // 第一次取满一帧，之后 1..8 全命中
        for i in 1..8 {
            assert_eq!(c.value(i, &src), Some(i as u32));
        }
        assert_eq!(src.fetches.get(), 1);
        assert_eq!(c.value(8, &src), Some(8));
        assert_eq!(c.cached_ranges(), vec![0..8, 8..16]);
        assert_eq!(c.value(100, &src), None);
    }

    #[test]
    fn frame_extends_when_gap_follows_partial_frame() {
        let src = VecSource::new((0..10).collect());
        let mut c = WindowedCache::new(8, 2);
        assert_eq!(c.value(6, &src), Some(6));
        assert_eq!(c.cached_ranges(), vec![6..10]);
        // 缺口在帧之前：新帧只填到下一帧起点
        assert_eq!(c.value(0, &src), Some(0));
        assert_eq!(c.cached_ranges(), vec![0..6, 6..10]);
    }

    #[test]
    fn full_pool_relocates_coldest_frame() {
        let src = VecSource::new((0..1000).collect());
        let mut c = WindowedCache::new(10, 3);
        c.value(0, &src);
        c.value(100, &src);
        c.value(200, &src);
        // 命中 0 号帧，使其不再最冷
        c.value(5, &src);
        c.value(5, &src);
        c.value(300, &src);
        assert_eq!(c.stats().evictions, 1);
        let ranges = c.cached_ranges();
        assert_eq!(ranges.len(), 3);
        assert!(ranges.contains(&(0..10)));
        assert!(ranges.contains(&(300..310)));
        assert_eq!(c.value(305, &src), Some(305));
        c.assert_invariants();
    }

    #[test]
    fn insert_range_shifts_and_truncates() {
        let src = VecSource::new((0..40).collect());
        let mut c = WindowedCache::new(10, 4);
        c.value(0, &src);
        c.value(20, &src);
        c.insert_range(5, 3);
        assert_eq!(c.cached_ranges(), vec![0..5, 23..33]);

        // 同步数据源
        src.data.borrow_mut().splice(5..5, [900, 901, 902]);
        for i in 0..43 {
            assert_eq!(c.value(i, &src), Some(src.data.borrow()[i]));
        }
    }

    #[test]
    fn remove_range_merges_and_retires() {
        let src = VecSource::new((0..50).collect());
        let mut c = WindowedCache::new(10, 4);
        c.value(0, &src);
        c.value(10, &src);
        c.value(30, &src);
        c.remove_range(5, 10);
        assert_eq!(c.cached_ranges(), vec![0..5, 5..10, 20..30]);
        c.remove_range(0, 12);
        assert_eq!(c.cached_ranges(), vec![8..18]);
        assert_eq!(c.resident(), 10);
        c.assert_invariants();
    }

    #[test]
    fn refresh_range_refetches_only_cached_positions() {
        let src = VecSource::new((0..30).collect());
        let mut c = WindowedCache::new(10, 2);
        c.value(0, &src);
        src.data.borrow_mut()[3] = 333;
        src.data.borrow_mut()[25] = 555;
        assert_eq!(c.value(3, &src), Some(3));
        c.refresh_range(2, 25, &src);
        assert_eq!(c.value(3, &src), Some(333));
        assert_eq!(c.value(25, &src), Some(555));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Read(usize),
        Insert(usize, usize),
        Remove(usize, usize),
        Refresh(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0usize..120).prop_map(Op::Read),
            1 => (0usize..120, 1usize..15).prop_map(|(i, n)| Op::Insert(i, n)),
            1 => (0usize..120, 1usize..15).prop_map(|(i, n)| Op::Remove(i, n)),
            1 => (0usize..120, 1usize..15).prop_map(|(i, n)| Op::Refresh(i, n)),
        ]
    }

    proptest! {
        #[test]
        fn cache_matches_fresh_derivation(ops in proptest::collection::vec(op(), 1..80)) {
            let src = VecSource::new((0..100).collect());
            let mut c = WindowedCache::new(7, 4);
            let mut next_val = 10_000u32;
            for op in ops {
                let len = src.data.borrow().len();
                match op {
                    Op::Read(i) => {
                        let expected = src.data.borrow().get(i).copied();
                        prop_assert_eq!(c.value(i, &src), expected);
                    }
                    Op::Insert(i, n) => {
                        let i = i.min(len);
                        let fresh: Vec<u32> = (0..n as u32).map(|k| next_val + k).collect();
                        next_val += n as u32;
                        src.data.borrow_mut().splice(i..i, fresh);
                        c.insert_range(i, n);
                    }
                    Op::Remove(i, n) => {
                        if len == 0 { continue; }
                        let i = i.min(len - 1);
                        let n = n.min(len - i);
                        src.data.borrow_mut().drain(i..i + n);
                        c.remove_range(i, n);
                    }
                    Op::Refresh(i, n) => {
                        if len == 0 { continue; }
                        let i = i.min(len - 1);
                        let n = n.min(len - i);
                        for k in i..i + n {
                            src.data.borrow_mut()[k] = next_val;
                            next_val += 1;
                        }
                        c.refresh_range(i, n, &src);
                    }
                }
                c.assert_invariants();
            }
            let all = src.data.borrow().clone();
            for (i, v) in all.iter().enumerate() {
                prop_assert_eq!(c.value(i, &src), Some(*v));
            }
        }
    }
}
