// 上传客户端配置
//
// 所有字段都有默认值，调用方至少需要提供 endpoint

use crate::error::{Result, UploadError};
use crate::extension::ExtensionFilter;
use crate::uploader::chunk::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// 上传客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderOptions {
    /// 上传地址
    pub endpoint: String,
    /// HTTP 方法（默认 POST）
    #[serde(default = "default_method")]
    pub method: String,
    /// 额外请求头
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// 附加表单字段（分片上传时只随最后一个分片发送）
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// 单文件大小上限（字节，0 表示不限制）
    #[serde(default)]
    pub max_file_size: u64,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 每个分片的最大重试次数
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// 重试前等待时间（秒）
    #[serde(default = "default_delay_before_retry_secs")]
    pub delay_before_retry_secs: f64,
    /// 每批最多并发上传的分片数
    #[serde(default = "default_max_parallel_uploads")]
    pub max_parallel_uploads: usize,
    /// 允许的扩展名（为空表示全部允许）
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    /// 禁止的扩展名
    #[serde(default)]
    pub blocked_extensions: Vec<String>,
    /// 输出分片级诊断日志
    #[serde(default)]
    pub debug: bool,
    /// 完成响应中定位地址的 JSON Pointer
    #[serde(default = "default_locator_pointer")]
    pub locator_pointer: String,
    /// 单个请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_retries() -> u32 {
    5
}

fn default_delay_before_retry_secs() -> f64 {
    5.0
}

fn default_max_parallel_uploads() -> usize {
    3
}

fn default_locator_pointer() -> String {
    "/data/url".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl UploaderOptions {
    /// 使用默认值创建配置
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            max_file_size: 0,
            chunk_size: default_chunk_size(),
            retries: default_retries(),
            delay_before_retry_secs: default_delay_before_retry_secs(),
            max_parallel_uploads: default_max_parallel_uploads(),
            allowed_extensions: Vec::new(),
            blocked_extensions: Vec::new(),
            debug: false,
            locator_pointer: default_locator_pointer(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn delay_before_retry(&self) -> Duration {
        Duration::from_secs_f64(self.delay_before_retry_secs.max(0.0))
    }

    pub fn extension_filter(&self) -> ExtensionFilter {
        ExtensionFilter::new(
            self.allowed_extensions.clone(),
            self.blocked_extensions.clone(),
        )
    }

    /// 解析 HTTP 方法
    pub fn http_method(&self) -> Result<reqwest::Method> {
        reqwest::Method::from_bytes(self.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| UploadError::validation(format!("无效的 HTTP 方法: {}", self.method)))
    }

    /// 校验配置以及待上传文件
    ///
    /// 在任何网络请求之前调用，失败时返回 Validation 或 SizeLimit 错误
    pub fn validate(&self, file_name: &str, file_size: u64) -> Result<()> {
        reqwest::Url::parse(&self.endpoint).map_err(|e| {
            UploadError::validation(format!("无效的上传地址 {:?}: {}", self.endpoint, e))
        })?;
        self.http_method()?;

        if self.chunk_size == 0 {
            return Err(UploadError::validation("chunk_size 必须大于 0"));
        }
        if self.max_parallel_uploads == 0 {
            return Err(UploadError::validation("max_parallel_uploads 必须大于 0"));
        }
        if !self.delay_before_retry_secs.is_finite() || self.delay_before_retry_secs < 0.0 {
            return Err(UploadError::validation("delay_before_retry_secs 必须为非负数"));
        }
        if file_name.trim().is_empty() {
            return Err(UploadError::validation("文件名不能为空"));
        }

        self.extension_filter().check(file_name)?;

        if self.max_file_size > 0 && file_size > self.max_file_size {
            return Err(UploadError::size_limit(format!(
                "文件大小 {} bytes 超过上限 {} bytes",
                file_size, self.max_file_size
            )));
        }

        Ok(())
    }
}
