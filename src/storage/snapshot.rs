use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::StorageError;
use crate::storage::definition::ContentSetDefinition;

/// 定义文件 Header
const MAGIC: u32 = 0xC5E7_0001;
const VERSION_CURRENT: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 8 + 8; // magic + version + data_len + checksum

/// 内容集定义的原子存储（atomic replacement）
///
/// 落盘流程：
/// 1) bincode 序列化 body，计算 xxh3 校验
/// 2) 写 `<path>.tmp`（header + body）并 fsync
/// 3) rename(tmp, target)，原子替换
/// 4) fsync(dir)
///
/// 加载时校验 magic + version + data_len + checksum，任何不一致都拒绝。
pub struct DefinitionStore {
    path: PathBuf,
}

impl DefinitionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<config_dir>/content-set/<name>.set`
    pub fn in_config_dir(name: &str) -> Option<Self> {
        dirs::config_dir().map(|d| Self::new(d.join("content-set").join(format!("{name}.set"))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在返回 `Ok(None)`；存在但损坏返回错误
    pub async fn load(&self) -> Result<Option<ContentSetDefinition>, StorageError> {
        let data = match fs::read(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let def = decode(&data)?;
        tracing::debug!("loaded definition `{}` from {}", def.name, self.path.display());
        Ok(Some(def))
    }

    pub async fn save(&self, def: &ContentSetDefinition) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = encode(def)?;
        let tmp_path = self.path.with_extension("set.tmp");

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.path).await?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }

        tracing::info!(
            "definition `{}` written: {} bytes",
            def.name,
            bytes.len()
        );
        Ok(())
    }
}

pub fn encode(def: &ContentSetDefinition) -> Result<Vec<u8>, StorageError> {
    let body = bincode::serialize(def)?;
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION_CURRENT.to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&xxh3_64(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<ContentSetDefinition, StorageError> {
    if data.len() < HEADER_SIZE {
        return Err(StorageError::Truncated {
            expected: HEADER_SIZE as u64,
            found: data.len() as u64,
        });
    }
    let magic = read_u32(&data[0..4]);
    let version = read_u32(&data[4..8]);
    let data_len = read_u64(&data[8..16]);
    let stored = read_u64(&data[16..24]);

    if magic != MAGIC {
        return Err(StorageError::BadMagic(magic));
    }
    if version != VERSION_CURRENT {
        return Err(StorageError::UnsupportedVersion(version));
    }
    let body = &data[HEADER_SIZE..];
    if body.len() as u64 != data_len {
        return Err(StorageError::Truncated {
            expected: data_len,
            found: body.len() as u64,
        });
    }
    let computed = xxh3_64(body);
    if computed != stored {
        return Err(StorageError::Checksum { stored, computed });
    }
    Ok(bincode::deserialize(body)?)
}

fn read_u32(b: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(b);
    u32::from_le_bytes(buf)
}

fn read_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    u64::from_le_bytes(buf)
}
