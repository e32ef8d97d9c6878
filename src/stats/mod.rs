use std::fmt;

use crate::cache::CacheStats;

/// 引擎运行统计
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// 完成的重算周期数
    pub cycles: u64,
    /// 被合并掉的 update 请求数
    pub coalesced: u64,
    pub inserts: u64,
    pub removes: u64,
    pub refreshes: u64,
    /// 走快速路径、未触发重算的 Updated 变更数
    pub fast_refreshes: u64,
    /// 查询或解析失败的分区次数
    pub partition_failures: u64,
    /// 变更通道溢出丢弃数
    pub feed_drops: u64,
    /// 当前可见条目数
    pub visible: usize,
    pub cache: CacheStats,
    /// 窗口缓存常驻条目数
    pub cache_resident: usize,
}

impl EngineStats {
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache.hits + self.cache.misses;
        if total == 0 {
            return 0.0;
        }
        self.cache.hits as f64 / total as f64
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           content-set Engine Report              ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ visible:        {:>10}                       ║", self.visible)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Cycles:                                          ║")?;
        writeln!(f, "║   completed:    {:>10}                       ║", self.cycles)?;
        writeln!(f, "║   coalesced:    {:>10}                       ║", self.coalesced)?;
        writeln!(f, "║   inserts:      {:>10}                       ║", self.inserts)?;
        writeln!(f, "║   removes:      {:>10}                       ║", self.removes)?;
        writeln!(f, "║   refreshes:    {:>10}                       ║", self.refreshes)?;
        writeln!(f, "║   fast path:    {:>10}                       ║", self.fast_refreshes)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Partitions / Feed:                               ║")?;
        writeln!(f, "║   failures:     {:>10}                       ║", self.partition_failures)?;
        writeln!(f, "║   feed drops:   {:>10}                       ║", self.feed_drops)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Window Cache:                                    ║")?;
        writeln!(f, "║   resident:     {:>10}                       ║", self.cache_resident)?;
        writeln!(f, "║   hits:         {:>10}                       ║", self.cache.hits)?;
        writeln!(f, "║   misses:       {:>10}                       ║", self.cache.misses)?;
        writeln!(f, "║   evictions:    {:>10}                       ║", self.cache.evictions)?;
        writeln!(
            f,
            "║   hit ratio:    {:>9.1}%                       ║",
            self.cache_hit_ratio() * 100.0
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_renders_counters() {
        let stats = EngineStats {
            cycles: 3,
            visible: 42,
            cache: CacheStats {
                hits: 3,
                misses: 1,
                evictions: 0,
            },
            ..Default::default()
        };
        assert!((stats.cache_hit_ratio() - 0.75).abs() < 1e-9);
        let text = stats.to_string();
        assert!(text.contains("content-set Engine Report"));
        assert!(text.contains("75.0%"));
        assert!(text.contains("42"));
    }
}
