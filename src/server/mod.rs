// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::warn;

/// 构建完整路由
///
/// - POST /api/v1/upload  上传文件或分片
/// - GET  /health         健康检查
/// - GET  <public_path>/* 访问已完成的文件
pub fn build_router(state: AppState) -> Router {
    let public_prefix = state.config.receiver.public_prefix().to_string();
    let destination_dir = state.config.receiver.destination_dir.clone();

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(cors_layer(&state.config.server.cors_origins));

    // 请求体大小由接收器边读边检查
    let api_routes = Router::new()
        .route("/upload", post(handlers::upload))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health_check))
        .nest_service(&public_prefix, ServeDir::new(destination_dir))
        .with_state(state)
        .layer(middleware)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("忽略无效的 CORS 源: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}
