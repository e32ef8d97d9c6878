use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::PartitionSource;
use crate::engine::{MergeDiffEngine, SetEngine, UpdateMode};
use crate::error::{CriteriaError, StorageError};
use crate::query::{FilterCriteria, SortCriteria};

/// 保存下来的内容集定义：名字 + 条件 + 模式
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSetDefinition {
    pub name: String,
    #[serde(default)]
    pub filter: FilterCriteria,
    #[serde(default)]
    pub sort: SortCriteria,
    #[serde(default)]
    pub mode: UpdateMode,
}

impl ContentSetDefinition {
    pub fn new(name: impl Into<String>, filter: FilterCriteria, sort: SortCriteria) -> Self {
        Self {
            name: name.into(),
            filter,
            sort,
            mode: UpdateMode::default(),
        }
    }

    /// 旧格式排序列表（`"attribute[/scope] [asc|desc]"`）
    pub fn with_legacy_sort<S: AsRef<str>>(
        name: impl Into<String>,
        filter: FilterCriteria,
        legacy: &[S],
    ) -> Result<Self, CriteriaError> {
        Ok(Self::new(name, filter, SortCriteria::from_legacy(legacy)?))
    }

    pub fn with_mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn legacy_sort(&self) -> Vec<String> {
        self.sort.to_legacy()
    }

    /// 记录引擎当前的条件与模式
    pub fn capture(name: impl Into<String>, engine: &MergeDiffEngine) -> Self {
        Self {
            name: name.into(),
            filter: engine.filter().clone(),
            sort: engine.sort_criteria().clone(),
            mode: engine.update_mode(),
        }
    }

    /// 按定义构建引擎（首次重算已登记，由第一次读取或事件循环触发）
    pub fn build(&self, partitions: Vec<Arc<dyn PartitionSource>>) -> MergeDiffEngine {
        MergeDiffEngine::new(partitions, self.filter.clone(), self.sort.clone(), self.mode)
    }

    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, StorageError> {
        Ok(serde_json::from_str(text)?)
    }
}
