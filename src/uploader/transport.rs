// 传输适配器
//
// 负责把一个分片（或单次上传时的整个文件）作为一个 HTTP 请求发出，
// 返回统一的响应结构，不修改调度器状态

use crate::error::{Result, UploadError};
use crate::protocol::{
    FILE_FIELD, HEADER_CHUNKS_TOTAL, HEADER_CHUNK_NUMBER, HEADER_SESSION_ID, PLACEHOLDER_FILE_NAME,
};
use crate::uploader::UploaderOptions;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{multipart, Client, Method, Url};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// 一次发送请求
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    /// 会话 ID，单次上传时为 None
    pub session_id: Option<String>,
    /// 分片序号（从 1 开始）
    pub index: usize,
    /// 总分片数
    pub total_chunks: usize,
    /// 分片数据
    pub data: Vec<u8>,
    /// 原始文件名
    pub file_name: String,
}

impl ChunkRequest {
    pub fn is_last(&self) -> bool {
        self.index == self.total_chunks
    }

    pub fn is_single_shot(&self) -> bool {
        self.session_id.is_none()
    }
}

/// 统一的响应
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResponse {
    /// HTTP 状态码
    pub status: u16,
    /// 最后一个分片（或单次上传）的 JSON 响应体
    pub body: Option<Value>,
}

impl NormalizedResponse {
    pub fn new(status: u16) -> Self {
        Self { status, body: None }
    }

    pub fn with_body(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    /// 按 JSON Pointer 提取完成地址
    pub fn locator(&self, pointer: &str) -> Option<String> {
        match self.body.as_ref()?.pointer(pointer)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

/// 分片传输接口
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// 发送一个分片
    ///
    /// 网络异常返回 TransientTransport，HTTP 状态码原样放进响应由调度器分类
    async fn send(&self, request: ChunkRequest) -> Result<NormalizedResponse>;
}

/// 基于 reqwest 的 HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    method: Method,
    headers: HeaderMap,
    params: BTreeMap<String, String>,
}

impl HttpTransport {
    pub fn new(options: &UploaderOptions) -> Result<Self> {
        let endpoint = Url::parse(&options.endpoint)
            .map_err(|e| UploadError::validation(format!("无效的上传地址: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs.max(1)))
            .build()
            .map_err(|e| UploadError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            method: options.http_method()?,
            headers: build_header_map(&options.headers)?,
            params: options.params.clone(),
        })
    }

    fn build_form(&self, request: ChunkRequest) -> Result<multipart::Form> {
        let single_shot = request.is_single_shot();
        let is_last = request.is_last();

        // 文件名只随最后一个分片发送
        let part_name = if single_shot || is_last {
            request.file_name
        } else {
            PLACEHOLDER_FILE_NAME.to_string()
        };
        let part = multipart::Part::bytes(request.data)
            .file_name(part_name)
            .mime_str("application/octet-stream")
            .map_err(|e| UploadError::validation(format!("构建 multipart 失败: {}", e)))?;

        let mut form = multipart::Form::new().part(FILE_FIELD, part);

        // 附加字段只在文件完整时才有意义
        if single_shot || is_last {
            for (key, value) in &self.params {
                form = form.text(key.clone(), value.clone());
            }
        }

        Ok(form)
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn send(&self, request: ChunkRequest) -> Result<NormalizedResponse> {
        let index = request.index;
        let read_body = request.is_last();

        let mut builder = self
            .client
            .request(self.method.clone(), self.endpoint.clone())
            .headers(self.headers.clone());

        if let Some(session_id) = &request.session_id {
            builder = builder
                .header(HEADER_SESSION_ID, session_id.as_str())
                .header(HEADER_CHUNK_NUMBER, request.index.to_string())
                .header(HEADER_CHUNKS_TOTAL, request.total_chunks.to_string());
        }

        let form = self.build_form(request)?;
        let response = builder.multipart(form).send().await?;
        let status = response.status().as_u16();

        if !read_body {
            debug!("分片 #{} 响应: status={}", index, status);
            return Ok(NormalizedResponse::new(status));
        }

        let text = response.text().await?;
        debug!("分片 #{} 响应: status={}, body={}", index, status, text);

        // 响应体不是 JSON 时交给调度器按“缺少定位地址”处理
        let body = serde_json::from_str::<Value>(&text).ok();
        Ok(NormalizedResponse { status, body })
    }
}

fn build_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| UploadError::validation(format!("无效的请求头名称: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| UploadError::validation(format!("无效的请求头值: {}", value)))?;
        map.insert(name, value);
    }
    Ok(map)
}
