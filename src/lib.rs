// Chibi Upload
// 可续传的分片上传：客户端调度器 + 服务端接收/合并

// 错误类型
pub mod error;

// 线协议（请求头、响应分类）
pub mod protocol;

// 扩展名过滤
pub mod extension;

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 上传客户端
pub mod uploader;

// 服务端接收
pub mod receiver;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::{AppConfig, ReceiverConfig};
pub use error::{ErrorKind, Result, UploadError};
pub use receiver::{ChunkReceiver, ReceiveOutcome};
pub use server::{build_router, AppState};
pub use uploader::{
    ChunkTransport, HttpTransport, UploadEvent, UploadOutcome, UploadScheduler, UploaderOptions,
};
