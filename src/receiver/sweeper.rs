// 过期会话清理
//
// 客户端中途放弃或进程崩溃都会留下会话临时目录，
// 最后修改时间超过 TTL 的目录在这里删除

use crate::error::Result;
use crate::receiver::ChunkReceiver;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 执行一次清理，返回删除的会话数
pub async fn sweep_once(receiver: &ChunkReceiver) -> Result<usize> {
    let Some(ttl) = receiver.config().stale_session_ttl() else {
        return Ok(0);
    };
    sweep_stale(receiver, ttl).await
}

async fn sweep_stale(receiver: &ChunkReceiver, ttl: Duration) -> Result<usize> {
    let temp_dir = &receiver.config().temp_dir;
    let mut entries = match tokio::fs::read_dir(temp_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let session_id = entry.file_name().to_string_lossy().into_owned();

        // 正在合并的会话不动
        if receiver
            .registry()
            .get(&session_id)
            .is_some_and(|slot| slot.is_assembling())
        {
            continue;
        }

        let path = entry.path();
        let Some(modified) = last_modified(&path).await else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age < ttl {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                receiver.registry().remove(&session_id);
                removed += 1;
                debug!("已删除过期会话 {} (闲置 {:?})", session_id, age);
            }
            Err(e) => warn!("删除过期会话失败: {:?}, 错误: {}", path, e),
        }
    }

    if removed > 0 {
        info!("已清理 {} 个过期上传会话", removed);
    }
    Ok(removed)
}

/// 目录及其直接子项中最新的修改时间
async fn last_modified(dir: &Path) -> Option<SystemTime> {
    let mut latest = tokio::fs::metadata(dir).await.ok()?.modified().ok()?;
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(modified) = entry.metadata().await.ok().and_then(|m| m.modified().ok()) {
            latest = latest.max(modified);
        }
    }
    Some(latest)
}

/// 启动后台清理任务，TTL 为 0 时不启动
pub fn spawn_sweeper(
    receiver: Arc<ChunkReceiver>,
    cancel_token: CancellationToken,
) -> Option<JoinHandle<()>> {
    receiver.config().stale_session_ttl()?;
    let period = receiver.config().sweep_interval();

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        info!("过期会话清理已启动: 间隔 {:?}", period);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("过期会话清理已停止");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = sweep_once(&receiver).await {
                        warn!("清理过期会话失败: {}", e);
                    }
                }
            }
        }
    }))
}
