use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{UpdateMode, DEFAULT_LOOKAHEAD};

/// 引擎配置（TOML）。
///
/// ```toml
/// frame_size = 20
/// frame_count = 16
/// merge_lookahead = 20
/// update_mode = "asynchronous"
/// barrier_wait_ms = 50
/// shutdown_retries = 100
/// change_feed_capacity = 4096
/// ```
///
/// 缺省字段取默认值；未知字段拒绝。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// 窗口缓存每帧的条目数
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// 窗口缓存常驻帧数
    #[serde(default = "default_frame_count")]
    pub frame_count: usize,
    /// 归并时每个游标一次解析的条目数
    #[serde(default = "default_lookahead")]
    pub merge_lookahead: usize,
    #[serde(default)]
    pub update_mode: UpdateMode,
    /// worker 在条件变量上的轮询间隔
    #[serde(default = "default_barrier_wait_ms")]
    pub barrier_wait_ms: u64,
    /// 关闭时等待 worker 退出的最大轮数
    #[serde(default = "default_shutdown_retries")]
    pub shutdown_retries: u32,
    #[serde(default = "default_feed_capacity")]
    pub change_feed_capacity: usize,
}

fn default_frame_size() -> usize {
    20
}

fn default_frame_count() -> usize {
    16
}

fn default_lookahead() -> usize {
    DEFAULT_LOOKAHEAD
}

fn default_barrier_wait_ms() -> u64 {
    50
}

fn default_shutdown_retries() -> u32 {
    100
}

fn default_feed_capacity() -> usize {
    4096
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_size: default_frame_size(),
            frame_count: default_frame_count(),
            merge_lookahead: default_lookahead(),
            update_mode: UpdateMode::default(),
            barrier_wait_ms: default_barrier_wait_ms(),
            shutdown_retries: default_shutdown_retries(),
            change_feed_capacity: default_feed_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// `<config_dir>/content-set/config.toml`；文件不存在时使用默认值
    pub fn load_default() -> anyhow::Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("loading engine config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("content-set").join("config.toml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.frame_size == 0 {
            anyhow::bail!("frame_size must be positive");
        }
        if self.frame_count == 0 {
            anyhow::bail!("frame_count must be positive");
        }
        if self.merge_lookahead == 0 {
            anyhow::bail!("merge_lookahead must be positive");
        }
        if self.change_feed_capacity == 0 {
            anyhow::bail!("change_feed_capacity must be positive");
        }
        Ok(())
    }

    pub fn barrier_wait(&self) -> Duration {
        Duration::from_millis(self.barrier_wait_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let c = EngineConfig::from_toml("update_mode = \"asynchronous\"\nframe_size = 8\n").unwrap();
        assert_eq!(c.update_mode, UpdateMode::Asynchronous);
        assert_eq!(c.frame_size, 8);
        assert_eq!(c.frame_count, 16);
        assert_eq!(c.barrier_wait(), Duration::from_millis(50));
    }

    #[test]
    fn zero_frame_geometry_is_rejected() {
        assert!(EngineConfig::from_toml("frame_size = 0").is_err());
        assert!(EngineConfig::from_toml("frame_count = 0").is_err());
        assert!(EngineConfig::from_toml("bogus = 1").is_err());
    }

    #[test]
    fn load_reads_file() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("content-set-config-{}", nanos));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "frame_count = 4\nshutdown_retries = 3\n").unwrap();

        let c = EngineConfig::load(&path).unwrap();
        assert_eq!((c.frame_count, c.shutdown_retries), (4, 3));
        assert!(EngineConfig::load(&dir.join("absent.toml")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
