use chibi_upload::{build_router, config::AppConfig, logging, receiver, AppState};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = AppConfig::config_path();

    // 日志系统初始化前先静默读取一次配置，拿到日志设置
    let log_config = match AppConfig::load_from_file(&config_path).await {
        Ok(config) => config.log,
        Err(_) => Default::default(),
    };

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&log_config);

    info!("Chibi Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&config_path).await;
    tokio::fs::create_dir_all(&config.receiver.destination_dir).await?;
    tokio::fs::create_dir_all(&config.receiver.temp_dir).await?;

    let app_state = AppState::new(config.clone())?;
    info!("应用状态初始化完成");

    // 启动时先回收一次遗留会话
    match receiver::sweep_once(&app_state.receiver).await {
        Ok(removed) if removed > 0 => info!("启动清理: 删除 {} 个过期会话", removed),
        Ok(_) => {}
        Err(e) => warn!("启动清理失败: {}", e),
    }

    let cancel_token = CancellationToken::new();
    let sweeper = receiver::spawn_sweeper(app_state.receiver.clone(), cancel_token.clone());

    let app = build_router(app_state);
    let addr = format!("{}:{}", config.server.host, config.server.port);

    info!("服务器启动在: http://{}", addr);
    info!("上传接口: http://{}/api/v1/upload", addr);
    info!(
        "文件访问: http://{}{}/",
        addr,
        config.receiver.public_prefix()
    );
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 使用 select! 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    cancel_token.cancel();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    info!("应用已安全退出");

    Ok(())
}
