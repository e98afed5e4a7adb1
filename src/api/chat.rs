// 聊天入口：multipart 解析、附件适配、会话解析与流式响应装配。
use crate::api::errors::{error_response, upstream_error};
use crate::encoder::encode_frame;
use crate::relay::Relay;
use crate::schemas::FileAttachment;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;
use uuid::Uuid;

const DEFAULT_USER_ID: &str = "default";
const FRAME_QUEUE_SIZE: usize = 32;

pub fn router(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/chat",
        get(health)
            .post(send_chat)
            .layer(DefaultBodyLimit::max(max_upload_bytes)),
    )
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "API route is working" }))
}

struct IncomingFile {
    filename: String,
    mime_type: String,
    data: Bytes,
}

/// 主聊天入口。流开启前的任何失败都走 500 错误响应；
/// 流开启后的失败由中继以终止 error 帧上报。
async fn send_chat(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Response, Response> {
    let mut message = String::new();
    let mut user_id = DEFAULT_USER_ID.to_string();
    let mut files: Vec<IncomingFile> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "message" {
            message = field
                .text()
                .await
                .map_err(|err| error_response(StatusCode::BAD_REQUEST, err.to_string()))?;
        } else if name == "userId" {
            let value = field
                .text()
                .await
                .map_err(|err| error_response(StatusCode::BAD_REQUEST, err.to_string()))?;
            if !value.is_empty() {
                user_id = value;
            }
        } else if name.starts_with("file") {
            // file1、file2…：保持到达顺序。
            let filename = field.file_name().unwrap_or("").to_string();
            let mime_type = field
                .content_type()
                .map(|value| value.to_string())
                .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
            let data = field
                .bytes()
                .await
                .map_err(|err| error_response(StatusCode::BAD_REQUEST, err.to_string()))?;
            files.push(IncomingFile {
                filename,
                mime_type,
                data,
            });
        }
    }

    let backend = state.backend.clone();
    let assistant_id = state
        .assistants
        .ensure(backend.as_ref())
        .await
        .map_err(upstream_error)?;
    let thread_id = state
        .sessions
        .resolve_thread(&user_id, backend.as_ref())
        .await
        .map_err(upstream_error)?;

    let mut attachments: Vec<FileAttachment> = Vec::new();
    for file in files {
        let ext = infer_extension(&file.filename, &file.mime_type);
        let upload_name = upload_filename(ext);
        let file_id = backend
            .upload_file(&upload_name, &file.mime_type, file.data.to_vec())
            .await
            .map_err(upstream_error)?;
        attachments.push(FileAttachment::for_code_interpreter(file_id));
    }

    backend
        .append_message(&thread_id, &message, &attachments)
        .await
        .map_err(upstream_error)?;
    let events = backend
        .open_run(&thread_id, &assistant_id)
        .await
        .map_err(upstream_error)?;

    let relay_id = format!("relay_{}", Uuid::new_v4().simple());
    info!("中继 {relay_id} 已建立: user={user_id} thread={thread_id}");
    let (tx, rx) = mpsc::channel(FRAME_QUEUE_SIZE);
    let relay = Relay::new(backend, state.metrics.clone(), thread_id);
    tokio::spawn(relay.drive(events, tx));
    stream_response(rx)
}

/// 帧流响应。内容类型沿用既有线协议的 text/plain（浏览器端用
/// fetch 读取 body 而非 EventSource），逐帧刷出，不做缓冲。
fn stream_response(rx: mpsc::Receiver<crate::schemas::RelayEvent>) -> Result<Response, Response> {
    let frames =
        ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(encode_frame(&event)));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(frames))
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

/// 扩展名推断：PDF MIME 优先，其次文件名/MIME 判定 CSV，否则按文本处理。
fn infer_extension(filename: &str, mime_type: &str) -> &'static str {
    let essence = mime_type
        .parse::<mime::Mime>()
        .map(|value| value.essence_str().to_string())
        .unwrap_or_else(|_| mime_type.trim().to_ascii_lowercase());
    if essence == mime::APPLICATION_PDF.essence_str() {
        "pdf"
    } else if filename.to_ascii_lowercase().ends_with(".csv")
        || essence == mime::TEXT_CSV.essence_str()
    {
        "csv"
    } else {
        "txt"
    }
}

/// 毫秒时间戳命名，避免同名覆盖。同一毫秒内的并发上传仍可能
/// 撞名，维持既有行为不做纠正。
fn upload_filename(ext: &str) -> String {
    format!("uploaded_{}.{ext}", Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_mime_wins_over_filename() {
        assert_eq!(infer_extension("notes.csv", "application/pdf"), "pdf");
        assert_eq!(infer_extension("report", "application/pdf"), "pdf");
    }

    #[test]
    fn csv_filename_wins_over_generic_mime() {
        assert_eq!(
            infer_extension("report.CSV", "application/octet-stream"),
            "csv"
        );
        assert_eq!(infer_extension("data.csv", ""), "csv");
    }

    #[test]
    fn csv_mime_with_parameters_is_recognized() {
        assert_eq!(infer_extension("upload", "text/csv; charset=utf-8"), "csv");
    }

    #[test]
    fn everything_else_defaults_to_txt() {
        assert_eq!(infer_extension("readme.md", "text/markdown"), "txt");
        assert_eq!(infer_extension("", ""), "txt");
    }

    #[test]
    fn upload_filenames_carry_millisecond_timestamp() {
        let name = upload_filename("csv");
        assert!(name.starts_with("uploaded_"));
        assert!(name.ends_with(".csv"));
        let stamp = name
            .trim_start_matches("uploaded_")
            .trim_end_matches(".csv");
        assert!(stamp.parse::<i64>().is_ok());
    }
}
