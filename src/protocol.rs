// 分片上传线协议
//
// 客户端与服务端唯一的约定：
// - chibi-uuid: 会话 ID（UUID v4），仅多分片会话携带
// - chibi-chunk-number: 本次请求的分片序号（从 1 开始）
// - chibi-chunks-total: 会话总分片数
// 单次上传（仅 1 个分片）不携带以上三个请求头

use serde::{Deserialize, Serialize};

/// 会话 ID 请求头
pub const HEADER_SESSION_ID: &str = "chibi-uuid";

/// 分片序号请求头
pub const HEADER_CHUNK_NUMBER: &str = "chibi-chunk-number";

/// 总分片数请求头
pub const HEADER_CHUNKS_TOTAL: &str = "chibi-chunks-total";

/// multipart 中文件字段名
pub const FILE_FIELD: &str = "file";

/// 非最后分片使用的占位文件名（真实文件名只随最后一个分片发送）
pub const PLACEHOLDER_FILE_NAME: &str = "blob";

/// 服务端响应分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 200 / 201 / 204
    Accepted,
    /// 408 / 502 / 503 / 504，可重试
    Transient,
    /// 413，超出大小限制，停止整个会话
    Oversize,
    /// 其他状态码，不可重试
    Fatal,
}

impl ResponseClass {
    pub fn classify(status: u16) -> Self {
        match status {
            200 | 201 | 204 => ResponseClass::Accepted,
            408 | 502 | 503 | 504 => ResponseClass::Transient,
            413 => ResponseClass::Oversize,
            _ => ResponseClass::Fatal,
        }
    }
}

/// 请求的上传模式（由请求头决定）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UploadMode {
    /// 单次上传：整个文件在一个请求里
    Single,
    /// 分片上传
    Chunked {
        session_id: String,
        chunk_number: u64,
        chunks_total: u64,
    },
}
