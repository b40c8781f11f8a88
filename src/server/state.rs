// 应用状态

use crate::config::AppConfig;
use crate::receiver::ChunkReceiver;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置（启动后只读）
    pub config: Arc<AppConfig>,
    /// 分片接收器
    pub receiver: Arc<ChunkReceiver>,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let receiver = ChunkReceiver::new(config.receiver.clone())?;
        Ok(Self {
            config: Arc::new(config),
            receiver: Arc::new(receiver),
        })
    }
}
