// 上传API处理器

use crate::protocol::FILE_FIELD;
use crate::receiver::{FinishedUpload, ReceiveOutcome};
use crate::server::error::{ApiError, ApiResult};
use crate::server::handlers::ApiResponse;
use crate::server::AppState;
use axum::{
    extract::{multipart::Multipart, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::debug;

/// 上传结果
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadResult {
    /// 分片已保存
    Stored {
        chunk_number: u64,
        received: u64,
        total: u64,
    },
    /// 文件已完整
    Completed(FinishedUpload),
}

/// 上传文件或分片
///
/// POST /api/v1/upload
///
/// 分片请求返回 200，文件完整时返回 201 并带上访问地址
pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<ApiResponse<UploadResult>>)> {
    let receiver = &state.receiver;
    let mut request = receiver.open(&headers)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == FILE_FIELD || field.file_name().is_some() {
            let file_name = field.file_name().map(str::to_string);
            if let Err(e) = receiver
                .write_part(&mut request, file_name.as_deref(), field)
                .await
            {
                // 读完剩余请求体，让客户端能收到错误响应
                drain(&mut multipart).await;
                return Err(e.into());
            }
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            debug!("表单字段: {}={}", name, value);
            request.push_field(name, value);
        }
    }

    let (status, result) = match receiver.finish(request).await? {
        ReceiveOutcome::Stored {
            chunk_number,
            received,
            total,
        } => (
            StatusCode::OK,
            UploadResult::Stored {
                chunk_number,
                received,
                total,
            },
        ),
        ReceiveOutcome::Completed(finished) => {
            (StatusCode::CREATED, UploadResult::Completed(finished))
        }
    };

    Ok((status, Json(ApiResponse::success(result))))
}

async fn drain(multipart: &mut Multipart) {
    while let Ok(Some(mut field)) = multipart.next_field().await {
        while let Ok(Some(_)) = field.chunk().await {}
    }
}
