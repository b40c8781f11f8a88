// 协议请求头校验
//
// 没有 chibi-uuid 时按单次上传处理；有 chibi-uuid 时三个请求头都必须合法

use crate::config::ReceiverConfig;
use crate::error::{Result, UploadError};
use crate::protocol::{UploadMode, HEADER_CHUNKS_TOTAL, HEADER_CHUNK_NUMBER, HEADER_SESSION_ID};
use axum::http::HeaderMap;
use regex::Regex;

const UUID_V4_PATTERN: &str =
    r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$";
const DIGITS_PATTERN: &str = r"^\d+$";

/// 请求头校验器（正则只编译一次）
#[derive(Debug, Clone)]
pub struct HeaderValidator {
    uuid: Regex,
    digits: Regex,
    max_chunk_size: u64,
    max_file_size: u64,
}

impl HeaderValidator {
    pub fn new(config: &ReceiverConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| UploadError::Config(format!("正则编译失败: {}", e)))
        };
        Ok(Self {
            uuid: compile(UUID_V4_PATTERN)?,
            digits: compile(DIGITS_PATTERN)?,
            max_chunk_size: config.max_chunk_size,
            max_file_size: config.max_file_size,
        })
    }

    /// 判断上传模式
    pub fn validate(&self, headers: &HeaderMap) -> Result<UploadMode> {
        let Some(session_id) = header_str(headers, HEADER_SESSION_ID)? else {
            return Ok(UploadMode::Single);
        };

        if session_id.len() != 36 || !self.uuid.is_match(session_id) {
            return Err(UploadError::validation(format!(
                "{} 不是合法的 UUID v4: {:?}",
                HEADER_SESSION_ID, session_id
            )));
        }

        let chunk_number = self.number(headers, HEADER_CHUNK_NUMBER)?;
        let chunks_total = self.number(headers, HEADER_CHUNKS_TOTAL)?;

        // 按最坏情况估算：每个分片都达到上限
        let fits = self
            .max_chunk_size
            .checked_mul(chunks_total)
            .is_some_and(|declared| declared <= self.max_file_size);
        if !fits {
            return Err(UploadError::validation(format!(
                "分片计划超出文件大小上限: {} x {} bytes > {} bytes",
                chunks_total, self.max_chunk_size, self.max_file_size
            )));
        }

        Ok(UploadMode::Chunked {
            session_id: session_id.to_ascii_lowercase(),
            chunk_number,
            chunks_total,
        })
    }

    fn number(&self, headers: &HeaderMap, name: &str) -> Result<u64> {
        let value = header_str(headers, name)?
            .ok_or_else(|| UploadError::validation(format!("缺少请求头 {}", name)))?;
        if !self.digits.is_match(value) {
            return Err(UploadError::validation(format!(
                "请求头 {} 不是数字: {:?}",
                name, value
            )));
        }
        value
            .parse::<u64>()
            .map_err(|_| UploadError::validation(format!("请求头 {} 超出范围: {}", name, value)))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()))
            .map_err(|_| UploadError::validation(format!("请求头 {} 含非法字符", name))),
    }
}
