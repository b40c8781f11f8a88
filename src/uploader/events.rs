//! 上传事件
//!
//! 调度器按发生顺序推送事件，替代回调：
//! Started → Progress/Retry/Error ... → Finished

use crate::error::{ErrorKind, UploadError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 开始发送（每次 start / resume 都会推送）
    Started {
        session_id: String,
        total_chunks: usize,
        total_size: u64,
    },
    /// 分片被接受
    Progress {
        session_id: String,
        chunk_index: usize,
        progress: u8,
    },
    /// 分片即将重试
    Retry {
        session_id: String,
        chunk_index: usize,
        /// 第几次重试（从 1 开始）
        attempt: u32,
        /// 剩余重试次数
        attempts_remaining: u32,
        reason: String,
    },
    /// 错误
    Error {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_index: Option<usize>,
        kind: ErrorKind,
        message: String,
    },
    /// 已暂停
    Paused { session_id: String },
    /// 已恢复
    Resumed { session_id: String },
    /// 上传完成
    Finished {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        locator: Option<String>,
    },
}

impl UploadEvent {
    pub fn error(session_id: &str, chunk_index: Option<usize>, error: &UploadError) -> Self {
        UploadEvent::Error {
            session_id: session_id.to_string(),
            chunk_index,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            UploadEvent::Started { .. } => "started",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::Retry { .. } => "retry",
            UploadEvent::Error { .. } => "error",
            UploadEvent::Paused { .. } => "paused",
            UploadEvent::Resumed { .. } => "resumed",
            UploadEvent::Finished { .. } => "finished",
        }
    }
}

/// 事件发送端
///
/// 接收端被丢弃后静默忽略
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: UploadEvent) {
        let _ = self.tx.send(event);
    }
}
