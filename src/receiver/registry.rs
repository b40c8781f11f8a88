// 分片会话登记表
//
// 磁盘上的已完成分片文件（`<n>`，写入中为 `<n>.part`）是唯一可信的接收集合；
// 内存中的 BitSet 只是它的缓存，进程重启后按目录内容重建

use crate::error::{Result, UploadError};
use bit_set::BitSet;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 会话元数据文件
pub const META_FILE: &str = "meta.json";

/// 写入中的分片文件后缀
pub const PART_SUFFIX: &str = ".part";

pub fn chunk_file_name(chunk_number: u64) -> String {
    chunk_number.to_string()
}

pub fn part_file_name(chunk_number: u64) -> String {
    format!("{}{}", chunk_number, PART_SUFFIX)
}

/// 已完成分片文件名 -> 分片序号
fn parse_chunk_file(name: &str) -> Option<usize> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// 会话元数据（随最后一个分片写入）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub chunks_total: u64,
    /// 原始文件名
    pub file_name: String,
    /// 随最后一个分片提交的表单字段
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    pub created_at: i64,
}

impl SessionMeta {
    pub fn new(chunks_total: u64, file_name: String, fields: BTreeMap<String, String>) -> Self {
        Self {
            chunks_total,
            file_name,
            fields,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub async fn write(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)
            .map_err(|e| UploadError::Io(std::io::Error::other(e)))?;
        tokio::fs::write(dir.join(META_FILE), content).await?;
        Ok(())
    }

    pub async fn read(dir: &Path) -> Result<Option<Self>> {
        let content = match tokio::fs::read(dir.join(META_FILE)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta = serde_json::from_slice(&content)
            .map_err(|e| UploadError::assembly(dir.join(META_FILE), format!("元数据损坏: {}", e)))?;
        Ok(Some(meta))
    }
}

/// 单个分片会话的接收状态
#[derive(Debug)]
pub struct SessionSlot {
    chunks_total: u64,
    received: Mutex<BitSet>,
    meta: Mutex<Option<SessionMeta>>,
    /// 合并只执行一次
    assembling: AtomicBool,
}

impl SessionSlot {
    fn new(chunks_total: u64) -> Self {
        Self {
            chunks_total,
            received: Mutex::new(BitSet::new()),
            meta: Mutex::new(None),
            assembling: AtomicBool::new(false),
        }
    }

    /// 记录分片已落盘，返回已接收的分片数
    pub fn mark(&self, chunk_number: u64) -> u64 {
        let mut received = self.received.lock();
        received.insert(chunk_number as usize);
        received.len() as u64
    }

    pub fn contains(&self, chunk_number: u64) -> bool {
        self.received.lock().contains(chunk_number as usize)
    }

    pub fn received_count(&self) -> u64 {
        self.received.lock().len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.chunks_total
    }

    pub fn set_meta(&self, meta: SessionMeta) {
        *self.meta.lock() = Some(meta);
    }

    pub fn meta(&self) -> Option<SessionMeta> {
        self.meta.lock().clone()
    }

    /// 抢占合并权，只有第一个调用者返回 true
    pub fn try_begin_assembly(&self) -> bool {
        self.assembling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_assembling(&self) -> bool {
        self.assembling.load(Ordering::SeqCst)
    }

    /// 合并失败后释放合并权，允许重发的分片再次触发
    pub fn abort_assembly(&self) {
        self.assembling.store(false, Ordering::SeqCst);
    }
}

/// 所有进行中的分片会话
#[derive(Debug, Default)]
pub struct SessionRegistry {
    slots: DashMap<String, Arc<SessionSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取会话状态，不在内存中时从会话目录重建
    pub async fn slot(
        &self,
        session_id: &str,
        chunks_total: u64,
        dir: &Path,
    ) -> Result<Arc<SessionSlot>> {
        if let Some(slot) = self.get(session_id) {
            return check_total(slot, session_id, chunks_total);
        }

        let rebuilt = rebuild(chunks_total, dir).await?;
        let slot = self
            .slots
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(rebuilt))
            .clone();
        check_total(slot, session_id, chunks_total)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.get(session_id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, session_id: &str) {
        self.slots.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn check_total(
    slot: Arc<SessionSlot>,
    session_id: &str,
    chunks_total: u64,
) -> Result<Arc<SessionSlot>> {
    if slot.chunks_total != chunks_total {
        return Err(UploadError::validation(format!(
            "会话 {} 的总分片数不一致: 已登记 {}, 请求 {}",
            session_id, slot.chunks_total, chunks_total
        )));
    }
    Ok(slot)
}

async fn rebuild(chunks_total: u64, dir: &Path) -> Result<SessionSlot> {
    let slot = SessionSlot::new(chunks_total);

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(slot),
        Err(e) => return Err(e.into()),
    };

    if let Some(meta) = SessionMeta::read(dir).await? {
        if meta.chunks_total != chunks_total {
            return Err(UploadError::validation(format!(
                "会话目录 {:?} 的总分片数为 {}，请求为 {}",
                dir, meta.chunks_total, chunks_total
            )));
        }
        slot.set_meta(meta);
    }

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(number) = name.to_str().and_then(parse_chunk_file) else {
            continue;
        };
        if (1..=chunks_total as usize).contains(&number) {
            slot.mark(number as u64);
        }
    }

    let recovered = slot.received_count();
    if recovered > 0 {
        info!("从磁盘恢复会话 {:?}: {}/{} 个分片", dir, recovered, chunks_total);
    } else {
        debug!("新建分片会话 {:?}", dir);
    }
    Ok(slot)
}
