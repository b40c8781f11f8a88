// API 错误
//
// 接收端错误按种类映射为 HTTP 状态码：
// Validation → 400, SizeLimit → 413, 其他 → 500

use crate::error::{ErrorKind, UploadError};
use crate::server::handlers::ApiResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("请求格式错误: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// 错误响应中的附加信息
#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: ErrorKind,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Upload(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::SizeLimit => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Upload(e) => e.kind(),
            ApiError::BadRequest(_) => ErrorKind::Validation,
            ApiError::Internal(_) => ErrorKind::Io,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        } else {
            warn!("请求被拒绝 ({}): {}", status.as_u16(), self);
        }

        let body = ApiResponse {
            code: status.as_u16() as i32,
            message: self.to_string(),
            data: Some(ErrorDetail { kind: self.kind() }),
        };
        (status, Json(body)).into_response()
    }
}
