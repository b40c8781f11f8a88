// 上传分片调度器
//
// 调度策略：
// - 除最后一个分片外，按 max_parallel_uploads 分批，批内全部并发
// - 一批中所有分片都到达终态（接受 / 重试耗尽 / 致命错误）后才开始下一批
// - 最后一个分片单独发送，它同时是服务端开始合并的信号
// - 暂停只是标志位：进行中的请求不会被中断，只是其后续效果（进度、重试）被抑制
// - 413 设置会话级停止标志，之后不再发送任何分片
// - 其他致命错误只终止本轮发送：后续批次和最后一个分片都不再发送
// - 同一会话同一时刻只有一次 send_chunks 在运行（run_lock）

use crate::error::{Result, UploadError};
use crate::protocol::ResponseClass;
use crate::uploader::chunk::{self, ChunkDescriptor};
use crate::uploader::events::{EventEmitter, UploadEvent};
use crate::uploader::session::{SessionState, UploadSession};
use crate::uploader::transport::{ChunkRequest, ChunkTransport, HttpTransport, NormalizedResponse};
use crate::uploader::UploaderOptions;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 一次 start / resume 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 上传完成
    Completed { locator: Option<String> },
    /// 在发送过程中被暂停
    Paused,
    /// 未执行（已暂停、已停止、已完成或已有发送在进行）
    Skipped,
}

/// 单个分片的终态
#[derive(Debug)]
enum ChunkOutcome {
    /// 被服务端接受（最后一个分片携带完成地址）
    Accepted { locator: Option<String> },
    /// 终态失败（错误事件已推送）
    Failed(UploadError),
    /// 因暂停 / 停止被抑制
    Suppressed,
}

/// 上传调度器
///
/// 克隆开销很小，所有克隆共享同一个会话
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    session: Mutex<UploadSession>,
    options: UploaderOptions,
    transport: Arc<dyn ChunkTransport>,
    events: EventEmitter,
    /// 暂停标志
    paused: AtomicBool,
    /// 停止标志（413 或手动 stop 后不再发送）
    stopped: AtomicBool,
    /// 本轮发送出现致命错误，下一次 start 时清除
    failed: AtomicBool,
    /// 保证同一时刻只有一次发送流程
    run_lock: tokio::sync::Mutex<()>,
}

impl UploadScheduler {
    /// 为本地文件创建调度器（使用 HTTP 传输）
    pub async fn open(
        local_path: impl AsRef<Path>,
        options: UploaderOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UploadEvent>)> {
        let transport = Arc::new(HttpTransport::new(&options)?);
        Self::with_transport(local_path, options, transport).await
    }

    /// 为本地文件创建调度器（自定义传输）
    ///
    /// 配置和文件在这里完成校验，失败时不会产生任何网络请求
    pub async fn with_transport(
        local_path: impl AsRef<Path>,
        options: UploaderOptions,
        transport: Arc<dyn ChunkTransport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UploadEvent>)> {
        let local_path = local_path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&local_path).await?;
        if !metadata.is_file() {
            return Err(UploadError::validation(format!(
                "不是普通文件: {:?}",
                local_path
            )));
        }

        let file_name = file_name_of(&local_path)?;
        let total_size = metadata.len();
        options.validate(&file_name, total_size)?;

        let session = UploadSession::new(local_path, file_name, total_size, options.chunk_size);
        info!(
            "[会话 {}] 创建上传: file={}, size={}, chunk_size={}, chunks={}",
            session.session_id,
            session.file_name,
            total_size,
            options.chunk_size,
            session.total_chunks
        );

        let (events, rx) = EventEmitter::channel();
        let inner = SchedulerInner {
            session: Mutex::new(session),
            options,
            transport,
            events,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            rx,
        ))
    }

    /// 会话快照
    pub fn session(&self) -> UploadSession {
        self.inner.session.lock().clone()
    }

    pub fn session_id(&self) -> String {
        self.inner.session.lock().session_id.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// 开始上传
    ///
    /// 已暂停、已停止、已完成或已有发送流程在运行时直接返回 Skipped
    pub async fn start(&self) -> Result<UploadOutcome> {
        let Ok(_guard) = self.inner.run_lock.try_lock() else {
            debug!("[会话 {}] 已有发送流程在运行，忽略 start", self.session_id());
            return Ok(UploadOutcome::Skipped);
        };
        self.inner.send_chunks().await
    }

    /// 在后台启动上传
    pub fn spawn(&self) -> tokio::task::JoinHandle<Result<UploadOutcome>> {
        let this = self.clone();
        tokio::spawn(async move { this.start().await })
    }

    /// 暂停上传
    ///
    /// 不会中断进行中的请求，只阻止新批次和重试
    pub fn pause(&self) {
        if self.inner.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let session_id = {
            let mut session = self.inner.session.lock();
            session.mark_paused();
            session.session_id.clone()
        };
        info!("[会话 {}] 已暂停", session_id);
        self.inner.events.emit(UploadEvent::Paused { session_id });
    }

    /// 恢复上传
    ///
    /// 重新执行完整的发送流程（已被服务端接受的分片也会重新发送）。
    /// 若上一轮发送仍在收尾，先等待其结束再清除暂停标志，
    /// 这样上一轮会以 Paused 退出而不是继续发送
    pub async fn resume(&self) -> Result<UploadOutcome> {
        if !self.inner.paused.load(Ordering::SeqCst) {
            return Ok(UploadOutcome::Skipped);
        }

        let _guard = self.inner.run_lock.lock().await;
        // 等锁期间可能已被其他 resume 处理
        if !self.inner.paused.swap(false, Ordering::SeqCst) {
            return Ok(UploadOutcome::Skipped);
        }
        let session_id = self.session_id();
        info!("[会话 {}] 恢复上传", session_id);
        self.inner.events.emit(UploadEvent::Resumed { session_id });

        self.inner.send_chunks().await
    }

    /// 停止会话，之后不再发送任何分片
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            info!("[会话 {}] 已停止", self.session_id());
        }
    }
}

impl SchedulerInner {
    fn is_halted(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
            || self.stopped.load(Ordering::SeqCst)
            || self.failed.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> String {
        self.session.lock().session_id.clone()
    }

    /// 分片级日志（debug 开关打开时提升为 info）
    fn trace_chunk(&self, message: std::fmt::Arguments<'_>) {
        if self.options.debug {
            info!("[会话 {}] {}", self.session_id(), message);
        } else {
            debug!("[会话 {}] {}", self.session_id(), message);
        }
    }

    /// 完整的发送流程
    async fn send_chunks(self: &Arc<Self>) -> Result<UploadOutcome> {
        // 调用方持有 run_lock，上一轮的致命错误不影响新一轮
        self.failed.store(false, Ordering::SeqCst);
        if self.is_halted() {
            return Ok(UploadOutcome::Skipped);
        }

        let (session_id, total_size, chunk_size, total_chunks) = {
            let mut session = self.session.lock();
            if session.state == SessionState::Completed {
                return Ok(UploadOutcome::Skipped);
            }
            session.mark_running();
            session.reset_retries();
            (
                session.session_id.clone(),
                session.total_size,
                session.chunk_size,
                session.total_chunks,
            )
        };

        // 每次都重新规划分片
        let plan = chunk::plan(total_size, chunk_size)?;
        self.events.emit(UploadEvent::Started {
            session_id: session_id.clone(),
            total_chunks,
            total_size,
        });

        let Some((last, rest)) = plan.split_last() else {
            return Err(UploadError::validation("分片规划为空"));
        };

        let mut first_error: Option<UploadError> = None;
        let batch_size = self.options.max_parallel_uploads.max(1);

        for batch in rest.chunks(batch_size) {
            if self.paused.load(Ordering::SeqCst) {
                return Ok(UploadOutcome::Paused);
            }
            if self.stopped.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst) {
                break;
            }

            self.trace_chunk(format_args!(
                "发送批次: 分片 #{}..=#{}",
                batch[0].index,
                batch[batch.len() - 1].index
            ));

            let mut join_set = JoinSet::new();
            for descriptor in batch {
                let this = Arc::clone(self);
                let descriptor = descriptor.clone();
                join_set.spawn(async move { this.send_chunk(descriptor).await });
            }

            // 等待整批到达终态
            while let Some(result) = join_set.join_next().await {
                let outcome = result.unwrap_or_else(|e| {
                    error!("[会话 {}] 分片任务异常: {}", session_id, e);
                    ChunkOutcome::Failed(UploadError::TransientTransport(format!(
                        "分片任务异常: {}",
                        e
                    )))
                });
                if let ChunkOutcome::Failed(e) = outcome {
                    first_error.get_or_insert(e);
                }
            }
        }

        // 有分片失败时不发送最后一个分片，服务端不可能完成合并
        if let Some(e) = first_error {
            return Err(self.fail(e));
        }
        if self.paused.load(Ordering::SeqCst) {
            return Ok(UploadOutcome::Paused);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(self.fail(UploadError::validation("会话已停止")));
        }

        // 最后一个分片单独发送
        match self.send_chunk(last.clone()).await {
            ChunkOutcome::Accepted { locator } => Ok(UploadOutcome::Completed { locator }),
            ChunkOutcome::Failed(e) => Err(self.fail(e)),
            ChunkOutcome::Suppressed if self.paused.load(Ordering::SeqCst) => {
                Ok(UploadOutcome::Paused)
            }
            ChunkOutcome::Suppressed => Err(self.fail(UploadError::validation("会话已停止"))),
        }
    }

    fn fail(&self, error: UploadError) -> UploadError {
        let mut session = self.session.lock();
        session.mark_failed(error.to_string());
        error
    }

    /// 发送单个分片，直到到达终态
    async fn send_chunk(self: &Arc<Self>, descriptor: ChunkDescriptor) -> ChunkOutcome {
        if self.is_halted() {
            return ChunkOutcome::Suppressed;
        }

        let (session_id, local_path, file_name, total_chunks, single_shot) = {
            let session = self.session.lock();
            (
                session.session_id.clone(),
                session.local_path.clone(),
                session.file_name.clone(),
                session.total_chunks,
                session.is_single_shot(),
            )
        };
        let index = descriptor.index;

        let data = match descriptor.read_data(&local_path).await {
            Ok(data) => data,
            Err(e) => {
                error!("[会话 {}][分片#{}] 读取失败: {}", session_id, index, e);
                self.events
                    .emit(UploadEvent::error(&session_id, Some(index), &e));
                return ChunkOutcome::Failed(e);
            }
        };

        loop {
            if self.is_halted() {
                return ChunkOutcome::Suppressed;
            }

            let request = ChunkRequest {
                session_id: (!single_shot).then(|| session_id.clone()),
                index,
                total_chunks,
                data: data.clone(),
                file_name: file_name.clone(),
            };

            self.trace_chunk(format_args!(
                "[分片#{}] 发送 {} bytes",
                index,
                descriptor.size()
            ));

            let (class, response, transport_error) = match self.transport.send(request).await {
                Ok(response) => (ResponseClass::classify(response.status), Some(response), None),
                Err(e) if e.is_retriable() => (ResponseClass::Transient, None, Some(e)),
                Err(e) => (ResponseClass::Fatal, None, Some(e)),
            };
            let status = response.as_ref().map(|r| r.status);

            match class {
                ResponseClass::Accepted => {
                    let response = response.unwrap_or_else(|| NormalizedResponse::new(200));
                    return self.on_accepted(&session_id, index, single_shot, &response);
                }
                ResponseClass::Transient => {
                    if self.is_halted() {
                        return ChunkOutcome::Suppressed;
                    }
                    let reason = describe(status, transport_error.as_ref());
                    let retries = self.options.retries;
                    let used = self.session.lock().retries_for(index);

                    if used < retries {
                        let attempt = self.session.lock().record_retry(index);
                        warn!(
                            "[会话 {}][分片#{}] {}，{:?} 后重试 ({}/{})",
                            session_id,
                            index,
                            reason,
                            self.options.delay_before_retry(),
                            attempt,
                            retries
                        );
                        self.events.emit(UploadEvent::Retry {
                            session_id: session_id.clone(),
                            chunk_index: index,
                            attempt,
                            attempts_remaining: retries - attempt,
                            reason,
                        });
                        tokio::time::sleep(self.options.delay_before_retry()).await;
                        continue;
                    }

                    let e = UploadError::TransientTransport(format!(
                        "分片 #{} 重试 {} 次后仍失败: {}",
                        index, retries, reason
                    ));
                    error!("[会话 {}][分片#{}] {}", session_id, index, e);
                    self.events
                        .emit(UploadEvent::error(&session_id, Some(index), &e));
                    return ChunkOutcome::Failed(e);
                }
                ResponseClass::Oversize => {
                    // 只有第一个 413 上报错误
                    let already_stopped = self.stopped.swap(true, Ordering::SeqCst);
                    if already_stopped || self.failed.load(Ordering::SeqCst) {
                        return ChunkOutcome::Suppressed;
                    }
                    let e = UploadError::FatalTransport {
                        status: 413,
                        message: format!("分片 #{} 超出服务端大小限制，停止发送", index),
                    };
                    error!("[会话 {}][分片#{}] {}", session_id, index, e);
                    self.events
                        .emit(UploadEvent::error(&session_id, Some(index), &e));
                    return ChunkOutcome::Failed(e);
                }
                ResponseClass::Fatal => {
                    // 同一批次只上报第一个致命错误
                    if self.is_halted() || self.failed.swap(true, Ordering::SeqCst) {
                        return ChunkOutcome::Suppressed;
                    }
                    let e = match transport_error {
                        Some(e) => e,
                        None => UploadError::FatalTransport {
                            status: status.unwrap_or_default(),
                            message: format!("分片 #{} 被服务端拒绝", index),
                        },
                    };
                    error!("[会话 {}][分片#{}] {}", session_id, index, e);
                    self.events
                        .emit(UploadEvent::error(&session_id, Some(index), &e));
                    return ChunkOutcome::Failed(e);
                }
            }
        }
    }

    fn on_accepted(
        &self,
        session_id: &str,
        index: usize,
        single_shot: bool,
        response: &NormalizedResponse,
    ) -> ChunkOutcome {
        let (progress, is_last) = {
            let mut session = self.session.lock();
            (session.record_accepted(index), session.is_last_chunk(index))
        };

        // 暂停期间完成的请求不推送进度
        if !self.paused.load(Ordering::SeqCst) {
            self.events.emit(UploadEvent::Progress {
                session_id: session_id.to_string(),
                chunk_index: index,
                progress,
            });
        }
        self.trace_chunk(format_args!("[分片#{}] ✓ 已接受 ({}%)", index, progress));

        if !is_last {
            return ChunkOutcome::Accepted { locator: None };
        }

        let locator = response.locator(&self.options.locator_pointer);
        if locator.is_none() && !single_shot {
            let e = UploadError::validation(format!(
                "完成响应缺少定位地址 ({})",
                self.options.locator_pointer
            ));
            error!("[会话 {}] {}", session_id, e);
            self.events.emit(UploadEvent::error(session_id, Some(index), &e));
            return ChunkOutcome::Failed(e);
        }

        self.session.lock().mark_completed(locator.clone());
        info!("[会话 {}] ✓ 上传完成: {:?}", session_id, locator);
        self.events.emit(UploadEvent::Finished {
            session_id: session_id.to_string(),
            locator: locator.clone(),
        });
        ChunkOutcome::Accepted { locator }
    }
}

fn describe(status: Option<u16>, error: Option<&UploadError>) -> String {
    match (status, error) {
        (_, Some(e)) => e.to_string(),
        (Some(status), None) => format!("状态码 {}", status),
        (None, None) => "未知错误".to_string(),
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| UploadError::validation(format!("无法获取文件名: {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::uploader::transport::NormalizedResponse;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::io::Write;
    use tokio::sync::Notify;

    /// 脚本化的响应
    #[derive(Debug, Clone)]
    enum Reply {
        Status(u16),
        NetworkError,
    }

    /// 在某个分片上阻塞，直到测试放行
    struct Gate {
        index: usize,
        entered: Arc<Notify>,
        release: Arc<Notify>,
        used: AtomicBool,
    }

    #[derive(Debug, Clone)]
    struct Call {
        index: usize,
        session_id: Option<String>,
        total_chunks: usize,
        len: usize,
        file_name: String,
    }

    struct MockTransport {
        script: Mutex<HashMap<usize, VecDeque<Reply>>>,
        /// 最后一个分片成功时是否返回定位地址
        locator: bool,
        gate: Option<Gate>,
        calls: Mutex<Vec<Call>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
                locator: true,
                gate: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn script(self, index: usize, replies: Vec<Reply>) -> Self {
            self.script.lock().insert(index, replies.into());
            self
        }

        fn without_locator(mut self) -> Self {
            self.locator = false;
            self
        }

        fn gated(mut self, index: usize, entered: Arc<Notify>, release: Arc<Notify>) -> Self {
            self.gate = Some(Gate {
                index,
                entered,
                release,
                used: AtomicBool::new(false),
            });
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn calls_for(&self, index: usize) -> usize {
            self.calls.lock().iter().filter(|c| c.index == index).count()
        }
    }

    #[async_trait]
    impl ChunkTransport for MockTransport {
        async fn send(&self, request: ChunkRequest) -> Result<NormalizedResponse> {
            self.calls.lock().push(Call {
                index: request.index,
                session_id: request.session_id.clone(),
                total_chunks: request.total_chunks,
                len: request.data.len(),
                file_name: request.file_name.clone(),
            });

            if let Some(gate) = &self.gate {
                if gate.index == request.index && !gate.used.swap(true, Ordering::SeqCst) {
                    gate.entered.notify_one();
                    gate.release.notified().await;
                }
            }

            let reply = self
                .script
                .lock()
                .get_mut(&request.index)
                .and_then(|q| q.pop_front())
                .unwrap_or(Reply::Status(200));

            match reply {
                Reply::NetworkError => {
                    Err(UploadError::TransientTransport("connection reset".into()))
                }
                Reply::Status(status) if request.is_last() && self.locator && status < 300 => {
                    Ok(NormalizedResponse::with_body(
                        status,
                        json!({"code": 0, "data": {"url": "/files/done.bin"}}),
                    ))
                }
                Reply::Status(status) => Ok(NormalizedResponse::new(status)),
            }
        }
    }

    fn temp_file(size: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        let content: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        file.write_all(&content).unwrap();
        file
    }

    fn options(chunk_size: u64, parallel: usize, retries: u32) -> UploaderOptions {
        let mut options = UploaderOptions::new("http://localhost:18888/api/v1/upload");
        options.chunk_size = chunk_size;
        options.max_parallel_uploads = parallel;
        options.retries = retries;
        options.delay_before_retry_secs = 0.0;
        options
    }

    async fn scheduler(
        file: &tempfile::NamedTempFile,
        options: UploaderOptions,
        transport: Arc<MockTransport>,
    ) -> (UploadScheduler, mpsc::UnboundedReceiver<UploadEvent>) {
        UploadScheduler::with_transport(file.path(), options, transport)
            .await
            .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count(events: &[UploadEvent], event_type: &str) -> usize {
        events.iter().filter(|e| e.event_type() == event_type).count()
    }

    #[tokio::test]
    async fn test_multi_chunk_upload_completes() {
        let file = temp_file(250);
        let transport = Arc::new(MockTransport::new());
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;

        let outcome = scheduler.start().await.unwrap();
        assert_eq!(
            outcome,
            UploadOutcome::Completed {
                locator: Some("/files/done.bin".to_string())
            }
        );

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.iter().map(|c| c.len).sum::<usize>(), 250);
        // 最后一个分片最后发送
        assert_eq!(calls[2].index, 3);
        assert!(calls
            .iter()
            .all(|c| c.session_id.as_deref() == Some(scheduler.session_id().as_str())));
        assert!(calls.iter().all(|c| c.total_chunks == 3));

        let session = scheduler.session();
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.progress, 100);

        let events = drain(&mut rx);
        assert_eq!(events.first().unwrap().event_type(), "started");
        assert_eq!(count(&events, "progress"), 3);
        assert_eq!(events.last().unwrap().event_type(), "finished");
    }

    #[tokio::test]
    async fn test_single_chunk_uses_single_request() {
        let file = temp_file(50);
        let transport = Arc::new(MockTransport::new().without_locator());
        let (scheduler, mut rx) = scheduler(&file, options(100, 3, 3), transport.clone()).await;

        let outcome = scheduler.start().await.unwrap();
        assert_eq!(outcome, UploadOutcome::Completed { locator: None });

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].session_id.is_none());
        assert_eq!(calls[0].len, 50);
        assert!(calls[0].file_name.ends_with(".bin"));

        let events = drain(&mut rx);
        assert_eq!(count(&events, "finished"), 1);
        assert_eq!(count(&events, "error"), 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_one_error() {
        let file = temp_file(400);
        let transport = Arc::new(
            MockTransport::new()
                .script(1, vec![Reply::Status(503); 10])
                .without_locator(),
        );
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;

        let result = scheduler.start().await;
        assert!(result.is_err());

        // 首次发送 + 3 次重试
        assert_eq!(transport.calls_for(1), 4);
        // 重试耗尽不影响后续批次，但不再发送最后一个分片
        assert_eq!(transport.calls_for(2), 1);
        assert_eq!(transport.calls_for(3), 1);
        assert_eq!(transport.calls_for(4), 0);

        let events = drain(&mut rx);
        let retries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Retry {
                    chunk_index: 1,
                    attempts_remaining,
                    ..
                } => Some(*attempts_remaining),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![2, 1, 0]);

        let chunk_errors = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    UploadEvent::Error {
                        chunk_index: Some(1),
                        kind: ErrorKind::TransientTransport,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(chunk_errors, 1);
        assert_eq!(scheduler.session().state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_success_on_second_attempt_stops_retrying() {
        let file = temp_file(300);
        let transport = Arc::new(
            MockTransport::new().script(2, vec![Reply::Status(503), Reply::Status(200)]),
        );
        let (scheduler, mut rx) = scheduler(&file, options(100, 3, 3), transport.clone()).await;

        let outcome = scheduler.start().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed { .. }));
        assert_eq!(transport.calls_for(2), 2);

        let events = drain(&mut rx);
        assert_eq!(count(&events, "retry"), 1);
        assert_eq!(count(&events, "error"), 0);
    }

    #[tokio::test]
    async fn test_network_error_is_retried() {
        let file = temp_file(300);
        let transport = Arc::new(
            MockTransport::new().script(1, vec![Reply::NetworkError, Reply::Status(201)]),
        );
        let (scheduler, _rx) = scheduler(&file, options(100, 2, 1), transport.clone()).await;

        let outcome = scheduler.start().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed { .. }));
        assert_eq!(transport.calls_for(1), 2);
    }

    #[tokio::test]
    async fn test_oversize_halts_all_further_sends() {
        let file = temp_file(500);
        let transport = Arc::new(MockTransport::new().script(2, vec![Reply::Status(413)]));
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;

        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, UploadError::FatalTransport { status: 413, .. }));

        // 只发送了第一批
        let mut sent: Vec<usize> = transport.calls().iter().map(|c| c.index).collect();
        sent.sort();
        assert_eq!(sent, vec![1, 2]);

        let events = drain(&mut rx);
        assert_eq!(count(&events, "error"), 1);
        assert_eq!(count(&events, "retry"), 0);
        assert!(scheduler.is_stopped());

        // 停止后再次 start 不会发送
        assert_eq!(scheduler.start().await.unwrap(), UploadOutcome::Skipped);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_status_is_not_retried() {
        let file = temp_file(300);
        let transport = Arc::new(MockTransport::new().script(3, vec![Reply::Status(400)]));
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;

        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, UploadError::FatalTransport { status: 400, .. }));
        assert_eq!(transport.calls_for(3), 1);

        let events = drain(&mut rx);
        assert_eq!(count(&events, "error"), 1);
        assert_eq!(count(&events, "finished"), 0);
    }

    #[tokio::test]
    async fn test_fatal_status_halts_later_batches() {
        let file = temp_file(500);
        let transport = Arc::new(MockTransport::new().script(1, vec![Reply::Status(400)]));
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;

        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, UploadError::FatalTransport { status: 400, .. }));

        // #3..#5 从未发送（#2 与 #1 同批，可能已发出）
        let sent: Vec<usize> = transport.calls().iter().map(|c| c.index).collect();
        assert!(sent.contains(&1));
        assert!(sent.iter().all(|&i| i <= 2), "sent: {:?}", sent);
        assert_eq!(scheduler.session().state, SessionState::Failed);

        let events = drain(&mut rx);
        assert_eq!(count(&events, "error"), 1);
        assert_eq!(count(&events, "finished"), 0);

        // 非 413 的致命错误不会永久停止会话，可以重新 start
        assert!(!scheduler.is_stopped());
        let outcome = scheduler.start().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed { .. }));
        assert_eq!(transport.calls().len(), sent.len() + 5);
    }

    #[tokio::test]
    async fn test_fatal_statuses_in_one_batch_report_once() {
        let file = temp_file(500);
        let transport = Arc::new(
            MockTransport::new()
                .script(1, vec![Reply::Status(400)])
                .script(2, vec![Reply::Status(403)]),
        );
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;

        assert!(scheduler.start().await.is_err());
        assert!(transport.calls().len() <= 2);
        assert_eq!(count(&drain(&mut rx), "error"), 1);
    }

    #[tokio::test]
    async fn test_next_start_gets_fresh_retries() {
        let file = temp_file(200);
        let transport = Arc::new(MockTransport::new().script(
            1,
            vec![
                Reply::Status(503),
                Reply::Status(503),
                Reply::Status(503),
                Reply::Status(200),
            ],
        ));
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 1), transport.clone()).await;

        let err = scheduler.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientTransport);
        assert_eq!(transport.calls_for(1), 2);

        // 第二轮重新获得完整的重试次数
        let outcome = scheduler.start().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed { .. }));
        assert_eq!(transport.calls_for(1), 4);

        let events = drain(&mut rx);
        assert_eq!(count(&events, "retry"), 2);
        assert_eq!(scheduler.session().state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_missing_locator_is_an_error() {
        let file = temp_file(300);
        let transport = Arc::new(MockTransport::new().without_locator());
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;

        let err = scheduler.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_ne!(scheduler.session().state, SessionState::Completed);

        let events = drain(&mut rx);
        assert_eq!(count(&events, "error"), 1);
        assert_eq!(count(&events, "finished"), 0);
    }

    #[tokio::test]
    async fn test_pause_then_resume_completes() {
        let file = temp_file(500);
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let transport =
            Arc::new(MockTransport::new().gated(1, entered.clone(), release.clone()));
        let (scheduler, mut rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;

        let handle = scheduler.spawn();
        entered.notified().await;
        scheduler.pause();

        // 第一轮仍卡在分片 #1 时就调用 resume
        let resumed = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.resume().await })
        };
        tokio::task::yield_now().await;

        // 发送流程仍在运行，start 不执行
        assert_eq!(scheduler.start().await.unwrap(), UploadOutcome::Skipped);

        release.notify_one();

        // 第一轮以暂停结束，不会抢在 resume 之前把剩余分片发完
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, UploadOutcome::Paused);
        // 暂停后不再开始新批次
        let first_round = transport.calls().len();
        assert!(first_round <= 2);

        let outcome = resumed.await.unwrap().unwrap();
        assert!(matches!(outcome, UploadOutcome::Completed { .. }));
        // 恢复后重新发送完整的分片计划
        assert_eq!(transport.calls().len(), first_round + 5);
        assert_eq!(transport.calls().last().unwrap().index, 5);
        assert_eq!(scheduler.session().state, SessionState::Completed);

        let events = drain(&mut rx);
        assert_eq!(count(&events, "started"), 2);
        assert_eq!(count(&events, "paused"), 1);
        assert_eq!(count(&events, "resumed"), 1);
        assert_eq!(count(&events, "finished"), 1);
    }

    #[tokio::test]
    async fn test_resume_without_pause_is_noop() {
        let file = temp_file(50);
        let transport = Arc::new(MockTransport::new());
        let (scheduler, _rx) = scheduler(&file, options(100, 2, 3), transport.clone()).await;
        assert_eq!(scheduler.resume().await.unwrap(), UploadOutcome::Skipped);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_validation_happens_before_network() {
        let file = temp_file(500);
        let transport = Arc::new(MockTransport::new());

        let mut opts = options(100, 2, 3);
        opts.blocked_extensions = vec!["bin".to_string()];
        let err = UploadScheduler::with_transport(file.path(), opts, transport.clone())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut opts = options(100, 2, 3);
        opts.max_file_size = 499;
        let err = UploadScheduler::with_transport(file.path(), opts, transport.clone())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::SizeLimit);

        assert!(transport.calls().is_empty());
    }
}
