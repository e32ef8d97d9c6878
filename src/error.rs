use thiserror::Error;

use crate::core::PartitionId;

/// 过滤 / 排序条件错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CriteriaError {
    #[error("empty attribute name in criteria")]
    EmptyAttribute,
    #[error("invalid legacy sort key `{0}` (expected \"attribute[/scope] [asc|desc]\")")]
    InvalidLegacySort(String),
    #[error("invalid regex `{pattern}`: {reason}")]
    InvalidRegex { pattern: String, reason: String },
}

/// 分区查询错误（best-effort：由引擎记录日志后按空列表处理）
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("partition {0} is unavailable")]
    Unavailable(PartitionId),
    #[error("unknown partition {0}")]
    Unknown(PartitionId),
    #[error("partition {partition}: failed to resolve {missing} id(s)")]
    Resolve { partition: PartitionId, missing: usize },
}

/// 定义文件读写错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported definition version {0}")]
    UnsupportedVersion(u32),
    #[error("definition truncated: header says {expected} bytes, found {found}")]
    Truncated { expected: u64, found: u64 },
    #[error("checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    Checksum { stored: u64, computed: u64 },
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
