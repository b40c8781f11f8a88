// 上传会话定义
//
// 一个会话对应一次文件上传尝试，会话 ID 每次新建时生成

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use uuid::Uuid;

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 未开始
    Idle,
    /// 上传中
    Running,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// 上传会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// 会话 ID（UUID v4，仅多分片会话发送给服务端）
    pub session_id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件名（随最后一个分片发送）
    pub file_name: String,
    /// 文件大小
    pub total_size: u64,
    /// 分片大小（会话内不变）
    pub chunk_size: u64,
    /// 总分片数
    pub total_chunks: usize,
    /// 会话状态
    pub state: SessionState,
    /// 每个分片已用的重试次数
    #[serde(default)]
    pub retries_used: HashMap<usize, u32>,
    /// 已被服务端接受的分片
    #[serde(default)]
    pub accepted: BTreeSet<usize>,
    /// 进度百分比
    pub progress: u8,
    /// 完成后服务端返回的定位地址
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadSession {
    /// 创建新的上传会话
    pub fn new(local_path: PathBuf, file_name: String, total_size: u64, chunk_size: u64) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            local_path,
            file_name,
            total_size,
            chunk_size,
            total_chunks: crate::uploader::chunk::total_chunks(total_size, chunk_size),
            state: SessionState::Idle,
            retries_used: HashMap::new(),
            accepted: BTreeSet::new(),
            progress: 0,
            locator: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 只有一个分片时走单次上传
    pub fn is_single_shot(&self) -> bool {
        self.total_chunks <= 1
    }

    pub fn is_last_chunk(&self, index: usize) -> bool {
        index == self.total_chunks
    }

    /// 标记为上传中
    pub fn mark_running(&mut self) {
        self.state = SessionState::Running;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Paused;
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, locator: Option<String>) {
        self.state = SessionState::Completed;
        self.locator = locator;
        self.progress = 100;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.state = SessionState::Failed;
        self.error = Some(error);
    }

    /// 记录分片被接受，返回最新进度
    ///
    /// 进度按分片序号计算: round(100 * index / total_chunks)
    pub fn record_accepted(&mut self, index: usize) -> u8 {
        self.accepted.insert(index);
        self.retries_used.remove(&index);
        self.progress = progress_for(index, self.total_chunks);
        self.progress
    }

    /// 新一轮发送开始时清空所有分片的重试计数
    pub fn reset_retries(&mut self) {
        self.retries_used.clear();
    }

    /// 分片已用重试次数
    pub fn retries_for(&self, index: usize) -> u32 {
        self.retries_used.get(&index).copied().unwrap_or(0)
    }

    /// 增加分片重试次数，返回增加后的值
    pub fn record_retry(&mut self, index: usize) -> u32 {
        let used = self.retries_used.entry(index).or_insert(0);
        *used += 1;
        *used
    }
}

fn progress_for(index: usize, total_chunks: usize) -> u8 {
    if total_chunks == 0 {
        return 0;
    }
    let percent = (100.0 * index as f64 / total_chunks as f64).round();
    percent.clamp(0.0, 100.0) as u8
}
