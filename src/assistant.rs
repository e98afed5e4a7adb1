// 上游助手服务适配：助手引导、线程、文件与流式 run 的 HTTP 封装。
use crate::config::AssistantConfig;
use crate::schemas::{FileAttachment, RunEvent, ToolCall, ToolOutput};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

pub type RunEventStream = BoxStream<'static, Result<RunEvent>>;

const ASSISTANT_NAME: &str = "X-Gaming AI Assistant";
const ASSISTANT_INSTRUCTIONS: &str = "You are a helpful gaming AI assistant that can analyze \
data with code_interpreter. When CSV files are uploaded, analyze the data and create \
visualizations. For questions about user metrics like DAU/WAU/MAU, use the get_metrics \
function to retrieve accurate data from our database. Focus on gaming industry insights, \
game development advice, and data analysis.";
const ASSISTANTS_BETA: &str = "assistants=v2";
const EVENT_QUEUE_SIZE: usize = 64;

/// 上游后端的抽象接口：中继层只依赖这一层，便于用脚本化假后端测试。
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_assistant(&self) -> Result<String>;
    async fn create_thread(&self) -> Result<String>;
    async fn upload_file(&self, filename: &str, mime_type: &str, data: Vec<u8>) -> Result<String>;
    async fn append_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[FileAttachment],
    ) -> Result<()>;
    async fn open_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunEventStream>;
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunEventStream>;
    /// 最近一条助手消息中 image 内容块的文件 id 列表。
    async fn latest_assistant_images(&self, thread_id: &str) -> Result<Vec<String>>;
    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct AssistantClient {
    http: Client,
    config: AssistantConfig,
}

impl AssistantClient {
    pub fn new(http: Client, config: AssistantConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}{path}")
        } else {
            format!("{base}/v1{path}")
        }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = self.config.resolved_api_key() {
            let value = format!("Bearer {api_key}");
            if let Ok(header_value) = value.parse() {
                headers.insert(reqwest::header::AUTHORIZATION, header_value);
            }
        }
        if let Ok(beta) = ASSISTANTS_BETA.parse() {
            headers.insert("OpenAI-Beta", beta);
        }
        headers
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_s.max(1))
    }

    async fn post_json(&self, path: &str, payload: Value) -> Result<Value> {
        let response = self
            .http
            .post(self.endpoint(path))
            .headers(self.headers())
            .timeout(self.request_timeout())
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("assistant api request failed: {status} {body}"));
        }
        Ok(body)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(self.endpoint(path))
            .headers(self.headers())
            .timeout(self.request_timeout())
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("assistant api request failed: {status} {body}"));
        }
        Ok(body)
    }

    /// 发起流式请求并把 SSE 字节流解码为 RunEvent 序列。
    async fn open_event_stream(&self, path: &str, payload: Value) -> Result<RunEventStream> {
        let response = self
            .http
            .post(self.endpoint(path))
            .headers(self.headers())
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("assistant stream request failed: {status} {text}"));
        }
        Ok(spawn_event_pump(response))
    }
}

#[async_trait]
impl AssistantBackend for AssistantClient {
    async fn create_assistant(&self) -> Result<String> {
        let payload = json!({
            "name": ASSISTANT_NAME,
            "instructions": ASSISTANT_INSTRUCTIONS,
            "model": self.config.model,
            "tools": tool_declarations(),
        });
        let body = self.post_json("/assistants", payload).await?;
        extract_id(&body).ok_or_else(|| anyhow!("assistant creation returned no id"))
    }

    async fn create_thread(&self) -> Result<String> {
        let body = self.post_json("/threads", json!({})).await?;
        extract_id(&body).ok_or_else(|| anyhow!("thread creation returned no id"))
    }

    async fn upload_file(&self, filename: &str, mime_type: &str, data: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str(mime_type)?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        let response = self
            .http
            .post(self.endpoint("/files"))
            .headers(self.headers())
            .timeout(self.request_timeout())
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("file upload failed: {status} {body}"));
        }
        extract_id(&body).ok_or_else(|| anyhow!("file upload returned no id"))
    }

    async fn append_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[FileAttachment],
    ) -> Result<()> {
        let mut payload = json!({ "role": "user", "content": content });
        if !attachments.is_empty() {
            payload["attachments"] = serde_json::to_value(attachments)?;
        }
        self.post_json(&format!("/threads/{thread_id}/messages"), payload)
            .await?;
        Ok(())
    }

    async fn open_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunEventStream> {
        self.open_event_stream(
            &format!("/threads/{thread_id}/runs"),
            json!({ "assistant_id": assistant_id, "stream": true }),
        )
        .await
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunEventStream> {
        self.open_event_stream(
            &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            json!({ "tool_outputs": outputs, "stream": true }),
        )
        .await
    }

    async fn latest_assistant_images(&self, thread_id: &str) -> Result<Vec<String>> {
        let body = self
            .get_json(&format!("/threads/{thread_id}/messages"))
            .await?;
        Ok(collect_image_file_ids(&body))
    }

    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.endpoint(&format!("/files/{file_id}/content")))
            .headers(self.headers())
            .timeout(self.request_timeout())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("file content fetch failed: {status} {text}"));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()> {
        self.post_json(
            &format!("/threads/{thread_id}/runs/{run_id}/cancel"),
            json!({}),
        )
        .await?;
        Ok(())
    }
}

fn tool_declarations() -> Value {
    json!([
        { "type": "code_interpreter" },
        {
            "type": "function",
            "function": {
                "name": "get_metrics",
                "description": "Get user metrics like DAU, WAU, MAU, and other gaming statistics from our database",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "metric_type": {
                            "type": "string",
                            "enum": ["dau", "wau", "mau", "retention", "engagement", "statistics"],
                            "description": "The type of metric to retrieve"
                        },
                        "time_period": {
                            "type": "string",
                            "description": "Time period for the metrics, e.g., 'past week', 'April', etc."
                        }
                    },
                    "required": ["metric_type"]
                }
            }
        }
    ])
}

fn extract_id(body: &Value) -> Option<String> {
    body.get("id")
        .and_then(Value::as_str)
        .map(|value| value.to_string())
}

/// 消息列表默认按新到旧排序，取第一条助手消息即最近一条。
fn collect_image_file_ids(body: &Value) -> Vec<String> {
    let Some(items) = body.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Some(message) = items
        .iter()
        .find(|item| item.get("role").and_then(Value::as_str) == Some("assistant"))
    else {
        return Vec::new();
    };
    message
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("image_file"))
                .filter_map(|block| {
                    block
                        .get("image_file")
                        .and_then(|file| file.get("file_id"))
                        .and_then(Value::as_str)
                        .map(|value| value.to_string())
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 把 SSE 响应体泵入通道：按行缓冲，`event:` 与 `data:` 配对后解码。
fn spawn_event_pump(response: reqwest::Response) -> RunEventStream {
    let (tx, rx) = mpsc::channel::<Result<RunEvent>>(EVENT_QUEUE_SIZE);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut current_event: Option<String> = None;
        while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(err) => {
                    let _ = tx.send(Err(anyhow!(err))).await;
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer = buffer[pos + 1..].to_string();
                let line = line.trim();
                if line.is_empty() {
                    // 空行表示一条 SSE 记录结束。
                    current_event = None;
                    continue;
                }
                if let Some(name) = line.strip_prefix("event:") {
                    current_event = Some(name.trim().to_string());
                    continue;
                }
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    let _ = tx.send(Ok(RunEvent::StreamDone)).await;
                    continue;
                }
                let decoded = match serde_json::from_str::<Value>(data) {
                    Ok(payload) => {
                        Ok(decode_run_event(current_event.as_deref().unwrap_or(""), &payload))
                    }
                    Err(err) => Err(anyhow!("malformed stream payload: {err}")),
                };
                let failed = decoded.is_err();
                if tx.send(decoded).await.is_err() {
                    // 消费方已离开，停止解析。
                    return;
                }
                if failed {
                    return;
                }
            }
        }
        debug!("assistant event stream closed");
    });
    ReceiverStream::new(rx).boxed()
}

/// 边界处的标签化解码：未识别标签保留原名，由中继层记录并忽略。
pub fn decode_run_event(event: &str, data: &Value) -> RunEvent {
    match event {
        "thread.run.created" => RunEvent::RunCreated {
            run_id: data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "thread.message.delta" => RunEvent::MessageDelta {
            text: first_text_delta(data),
        },
        "thread.run.requires_action" => RunEvent::RequiresAction {
            run_id: data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls: pending_tool_calls(data),
        },
        "thread.run.completed" => RunEvent::RunCompleted,
        "thread.run.failed" => RunEvent::RunFailed,
        other => RunEvent::Unknown {
            event: other.to_string(),
        },
    }
}

fn first_text_delta(data: &Value) -> String {
    let block = data
        .get("delta")
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_array)
        .and_then(|blocks| blocks.first());
    let Some(block) = block else {
        return String::new();
    };
    if block.get("type").and_then(Value::as_str) != Some("text") {
        return String::new();
    }
    block
        .get("text")
        .and_then(|text| text.get("value"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn pending_tool_calls(data: &Value) -> Vec<ToolCall> {
    data.get("required_action")
        .and_then(|action| action.get("submit_tool_outputs"))
        .and_then(|submit| submit.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id").and_then(Value::as_str)?;
                    let function = call.get("function")?;
                    let name = function.get("name").and_then(Value::as_str)?;
                    let arguments = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    Some(ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: arguments.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_text_delta_from_first_content_block() {
        let data = json!({
            "delta": { "content": [
                { "type": "text", "text": { "value": "hello" } },
                { "type": "text", "text": { "value": "ignored" } }
            ]}
        });
        assert_eq!(
            decode_run_event("thread.message.delta", &data),
            RunEvent::MessageDelta { text: "hello".to_string() }
        );
    }

    #[test]
    fn non_text_first_block_decodes_to_empty_delta() {
        let data = json!({
            "delta": { "content": [
                { "type": "image_file", "image_file": { "file_id": "file_1" } }
            ]}
        });
        assert_eq!(
            decode_run_event("thread.message.delta", &data),
            RunEvent::MessageDelta { text: String::new() }
        );
    }

    #[test]
    fn decodes_requires_action_tool_calls() {
        let data = json!({
            "id": "run_42",
            "required_action": { "submit_tool_outputs": { "tool_calls": [
                { "id": "call_1", "function": { "name": "get_metrics", "arguments": "{\"metric_type\":\"dau\"}" } },
                { "id": "call_2", "function": { "name": "other_tool", "arguments": "{}" } }
            ]}}
        });
        let event = decode_run_event("thread.run.requires_action", &data);
        let RunEvent::RequiresAction { run_id, tool_calls } = event else {
            panic!("expected requires_action, got {event:?}");
        };
        assert_eq!(run_id, "run_42");
        assert_eq!(tool_calls.len(), 2);
        assert_eq!(tool_calls[0].name, "get_metrics");
        assert_eq!(tool_calls[1].id, "call_2");
    }

    #[test]
    fn decodes_run_created_id() {
        let event = decode_run_event("thread.run.created", &json!({ "id": "run_7" }));
        assert_eq!(event, RunEvent::RunCreated { run_id: "run_7".to_string() });
    }

    #[test]
    fn unknown_tags_are_preserved() {
        let event = decode_run_event("thread.run.step.created", &json!({}));
        assert_eq!(
            event,
            RunEvent::Unknown { event: "thread.run.step.created".to_string() }
        );
    }

    #[test]
    fn picks_images_from_latest_assistant_message() {
        let body = json!({ "data": [
            { "role": "assistant", "content": [
                { "type": "text", "text": { "value": "chart below" } },
                { "type": "image_file", "image_file": { "file_id": "file_new" } }
            ]},
            { "role": "user", "content": [] },
            { "role": "assistant", "content": [
                { "type": "image_file", "image_file": { "file_id": "file_old" } }
            ]}
        ]});
        assert_eq!(collect_image_file_ids(&body), vec!["file_new".to_string()]);
    }
}
