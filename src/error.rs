// 上传错误类型
//
// 客户端调度器与服务端接收器共用同一套错误分类：
// - Validation: 参数 / 协议头 / 扩展名不合法，发生在任何 I/O 之前
// - SizeLimit: 文件或分片超出上限，触发残留清理
// - TransientTransport: 可重试的状态码或网络故障
// - FatalTransport: 不可重试的状态码（413 额外触发全局停止）
// - Assembly: 合并分片时分片缺失或不可读

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, UploadError>;

/// 错误种类（用于事件推送和 HTTP 响应体）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    SizeLimit,
    TransientTransport,
    FatalTransport,
    Assembly,
    Io,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::SizeLimit => "size_limit",
            ErrorKind::TransientTransport => "transient_transport",
            ErrorKind::FatalTransport => "fatal_transport",
            ErrorKind::Assembly => "assembly",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("超出大小限制: {0}")]
    SizeLimit(String),

    #[error("传输失败（可重试）: {0}")]
    TransientTransport(String),

    #[error("传输失败（状态码 {status}）: {message}")]
    FatalTransport { status: u16, message: String },

    #[error("合并分片失败: {message} ({path:?})")]
    Assembly { path: PathBuf, message: String },

    #[error("文件操作失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Config(String),
}

impl UploadError {
    pub fn validation(message: impl Into<String>) -> Self {
        UploadError::Validation(message.into())
    }

    pub fn size_limit(message: impl Into<String>) -> Self {
        UploadError::SizeLimit(message.into())
    }

    pub fn assembly(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        UploadError::Assembly {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Validation(_) => ErrorKind::Validation,
            UploadError::SizeLimit(_) => ErrorKind::SizeLimit,
            UploadError::TransientTransport(_) => ErrorKind::TransientTransport,
            UploadError::FatalTransport { .. } => ErrorKind::FatalTransport,
            UploadError::Assembly { .. } => ErrorKind::Assembly,
            UploadError::Io(_) => ErrorKind::Io,
            UploadError::Config(_) => ErrorKind::Config,
        }
    }

    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, UploadError::TransientTransport(_))
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        // 网络层异常一律按可重试处理
        UploadError::TransientTransport(e.to_string())
    }
}
