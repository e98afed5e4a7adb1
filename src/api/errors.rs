// 流前错误的统一响应：HTTP 500 + `{"error": 详情}`。
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    (status, Json(json!({ "error": message }))).into_response()
}

/// 上游不可用类故障（助手引导、线程创建、上传、消息写入、run 启动）。
pub fn upstream_error(err: anyhow::Error) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
