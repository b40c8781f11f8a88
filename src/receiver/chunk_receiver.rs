// 分片接收
//
// 一次请求的处理顺序：
// 1. open: 校验协议头，确定上传模式，越界分片在这里拒绝（不落盘）
// 2. push_field / write_part: 收集表单字段，流式写入文件部分（边写边检查大小）
// 3. finish: 分片落盘确认，接收集合满时触发合并

use crate::config::ReceiverConfig;
use crate::error::{Result, UploadError};
use crate::extension::{extension_of, ExtensionFilter};
use crate::protocol::{UploadMode, PLACEHOLDER_FILE_NAME};
use crate::receiver::assembler;
use crate::receiver::headers::HeaderValidator;
use crate::receiver::registry::{chunk_file_name, part_file_name, SessionMeta, SessionRegistry};
use axum::http::HeaderMap;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 已写入磁盘的文件部分
#[derive(Debug)]
struct StoredPart {
    path: PathBuf,
    /// 客户端提交的文件名（非最后分片为占位名）
    file_name: Option<String>,
    size: u64,
}

/// 一次上传请求的处理状态
#[derive(Debug)]
pub struct IncomingRequest {
    mode: UploadMode,
    fields: BTreeMap<String, String>,
    stored: Option<StoredPart>,
}

impl IncomingRequest {
    pub fn mode(&self) -> &UploadMode {
        &self.mode
    }

    /// 记录文本字段（同名字段后者覆盖前者）
    pub fn push_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }
}

/// 上传完成的文件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedUpload {
    /// 服务端存储路径
    #[serde(skip)]
    pub path: PathBuf,
    /// 访问地址
    pub url: String,
    /// 原始文件名
    pub file_name: String,
    pub size: u64,
    /// 随文件提交的表单字段
    pub fields: BTreeMap<String, String>,
}

/// 一次请求的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// 分片已保存，会话尚未完成
    Stored {
        chunk_number: u64,
        received: u64,
        total: u64,
    },
    /// 文件已完整
    Completed(FinishedUpload),
}

/// 分片接收器
///
/// 每个实例持有自己的配置和会话登记表，多个实例互不影响
#[derive(Debug)]
pub struct ChunkReceiver {
    config: Arc<ReceiverConfig>,
    validator: HeaderValidator,
    filter: ExtensionFilter,
    registry: SessionRegistry,
}

impl ChunkReceiver {
    pub fn new(config: ReceiverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            validator: HeaderValidator::new(&config)?,
            filter: config.extension_filter(),
            registry: SessionRegistry::new(),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// 会话临时目录
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.config.temp_dir.join(session_id)
    }

    /// 分片级日志（debug 开关打开时提升为 info）
    fn trace(&self, message: std::fmt::Arguments<'_>) {
        if self.config.debug {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }

    /// 校验请求头，开始处理一次请求
    pub fn open(&self, headers: &HeaderMap) -> Result<IncomingRequest> {
        let mode = self.validator.validate(headers)?;

        if let UploadMode::Chunked {
            session_id,
            chunk_number,
            chunks_total,
        } = &mode
        {
            if *chunk_number == 0 || chunk_number > chunks_total {
                return Err(UploadError::validation(format!(
                    "[会话 {}] 分片序号 {} 超出范围 1..={}",
                    session_id, chunk_number, chunks_total
                )));
            }
        }

        Ok(IncomingRequest {
            mode,
            fields: BTreeMap::new(),
            stored: None,
        })
    }

    /// 流式写入文件部分
    ///
    /// 超过大小上限时丢弃剩余数据，清理已写入的内容后返回 SizeLimit
    pub async fn write_part<S, E>(
        &self,
        request: &mut IncomingRequest,
        file_name: Option<&str>,
        stream: S,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        if request.stored.is_some() {
            return Err(UploadError::validation("一个请求只能包含一个文件"));
        }

        let (path, limit) = match &request.mode {
            UploadMode::Single => {
                self.filter.check(file_name.unwrap_or_default())?;
                let path = self
                    .config
                    .destination_dir
                    .join(stored_name(&Uuid::new_v4().to_string(), file_name));
                (path, self.config.max_file_size)
            }
            UploadMode::Chunked {
                session_id,
                chunk_number,
                chunks_total,
            } => {
                // 只有最后一个分片带真实文件名
                if chunk_number == chunks_total {
                    self.filter.check(file_name.unwrap_or_default())?;
                }
                let dir = self.session_dir(session_id);
                (
                    dir.join(part_file_name(*chunk_number)),
                    self.config.max_chunk_size,
                )
            }
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let size = match stream_to_file(&path, stream, limit).await {
            Ok(Written::Complete(size)) => size,
            Ok(Written::LimitReached) => {
                let e = UploadError::size_limit(format!(
                    "{} 超过 {} bytes 上限",
                    describe(&request.mode),
                    limit
                ));
                warn!("{}，清理已接收数据", e);
                self.discard(&request.mode, &path).await;
                return Err(e);
            }
            Err(e) => {
                error!("{} 写入失败: {}", describe(&request.mode), e);
                remove_file_quietly(&path).await;
                return Err(e);
            }
        };

        self.trace(format_args!("{} 已写入 {} bytes", describe(&request.mode), size));
        request.stored = Some(StoredPart {
            path,
            file_name: file_name.map(str::to_string),
            size,
        });
        Ok(())
    }

    /// 完成一次请求
    pub async fn finish(&self, request: IncomingRequest) -> Result<ReceiveOutcome> {
        let IncomingRequest {
            mode,
            fields,
            stored,
        } = request;
        let stored = stored.ok_or_else(|| UploadError::validation("请求中没有文件"))?;

        match mode {
            UploadMode::Single => {
                let size = fs::metadata(&stored.path).await?.len();
                let file_name = stored
                    .file_name
                    .clone()
                    .unwrap_or_else(|| file_name_of(&stored.path));
                info!("✓ 单次上传完成: {:?} ({} bytes)", stored.path, size);
                Ok(ReceiveOutcome::Completed(FinishedUpload {
                    url: self.public_url(&stored.path),
                    path: stored.path,
                    file_name,
                    size,
                    fields,
                }))
            }
            UploadMode::Chunked {
                session_id,
                chunk_number,
                chunks_total,
            } => {
                self.finish_chunk(&session_id, chunk_number, chunks_total, stored, fields)
                    .await
            }
        }
    }

    async fn finish_chunk(
        &self,
        session_id: &str,
        chunk_number: u64,
        chunks_total: u64,
        stored: StoredPart,
        fields: BTreeMap<String, String>,
    ) -> Result<ReceiveOutcome> {
        let dir = self.session_dir(session_id);

        // 元数据先于最后一个分片落盘，保证任何触发合并的请求都能读到
        let meta = if chunk_number == chunks_total {
            let file_name = stored
                .file_name
                .clone()
                .filter(|n| !n.is_empty() && n != PLACEHOLDER_FILE_NAME)
                .unwrap_or_else(|| session_id.to_string());
            let meta = SessionMeta::new(chunks_total, file_name, fields);
            meta.write(&dir).await?;
            Some(meta)
        } else {
            None
        };

        fs::rename(&stored.path, dir.join(chunk_file_name(chunk_number))).await?;

        let slot = self.registry.slot(session_id, chunks_total, &dir).await?;
        if let Some(meta) = meta {
            slot.set_meta(meta);
        }
        let received = slot.mark(chunk_number);
        self.trace(format_args!(
            "[会话 {}][分片#{}] ✓ 已保存 {} bytes ({}/{})",
            session_id, chunk_number, stored.size, received, chunks_total
        ));

        if !slot.is_complete() || !slot.try_begin_assembly() {
            return Ok(ReceiveOutcome::Stored {
                chunk_number,
                received,
                total: chunks_total,
            });
        }

        let meta = match slot.meta() {
            Some(meta) => meta,
            None => SessionMeta::read(&dir).await?.ok_or_else(|| {
                UploadError::assembly(&dir, "缺少会话元数据")
            })?,
        };

        let target = self
            .config
            .destination_dir
            .join(stored_name(session_id, Some(&meta.file_name)));
        info!(
            "[会话 {}] 全部 {} 个分片已接收，开始合并 -> {:?}",
            session_id, chunks_total, target
        );

        match assembler::assemble(&target, &dir, chunks_total).await {
            Ok(size) => {
                self.registry.remove(session_id);
                Ok(ReceiveOutcome::Completed(FinishedUpload {
                    url: self.public_url(&target),
                    path: target,
                    file_name: meta.file_name,
                    size,
                    fields: meta.fields,
                }))
            }
            Err(e) => {
                error!("[会话 {}] 合并失败: {}", session_id, e);
                slot.abort_assembly();
                Err(e)
            }
        }
    }

    /// 超限后的清理：分片会话删除整个临时目录，单次上传删除半成品文件
    async fn discard(&self, mode: &UploadMode, path: &Path) {
        match mode {
            UploadMode::Single => remove_file_quietly(path).await,
            UploadMode::Chunked { session_id, .. } => {
                self.registry.remove(session_id);
                let dir = self.session_dir(session_id);
                if let Err(e) = fs::remove_dir_all(&dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("删除会话目录失败: {:?}, 错误: {}", dir, e);
                    }
                }
            }
        }
    }

    fn public_url(&self, path: &Path) -> String {
        format!(
            "{}/{}",
            self.config.public_prefix(),
            urlencoding::encode(&file_name_of(path))
        )
    }
}

enum Written {
    Complete(u64),
    LimitReached,
}

async fn stream_to_file<S, E>(path: &Path, stream: S, limit: u64) -> Result<Written>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Display,
{
    futures::pin_mut!(stream);
    let mut file = File::create(path).await?;
    let mut written = 0u64;
    let mut limit_reached = false;

    while let Some(item) = stream.next().await {
        let bytes = item.map_err(|e| {
            UploadError::Io(std::io::Error::other(format!("读取上传数据失败: {}", e)))
        })?;
        if limit_reached {
            // 继续读完请求体，剩余数据直接丢弃
            continue;
        }
        if written + bytes.len() as u64 > limit {
            limit_reached = true;
            continue;
        }
        file.write_all(&bytes).await?;
        written += bytes.len() as u64;
    }

    file.flush().await?;
    drop(file);

    if limit_reached {
        Ok(Written::LimitReached)
    } else {
        Ok(Written::Complete(written))
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("删除文件失败: {:?}, 错误: {}", path, e);
        }
    }
}

/// 存储文件名: `<id>.<ext>`，没有扩展名时只用 id
fn stored_name(id: &str, file_name: Option<&str>) -> String {
    match file_name.and_then(extension_of) {
        Some(ext) => format!("{}.{}", id, ext),
        None => id.to_string(),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn describe(mode: &UploadMode) -> String {
    match mode {
        UploadMode::Single => "单次上传".to_string(),
        UploadMode::Chunked {
            session_id,
            chunk_number,
            ..
        } => format!("[会话 {}][分片#{}]", session_id, chunk_number),
    }
}
