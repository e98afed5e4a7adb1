// 协议数据结构：下游帧事件与上游 run 事件的类型定义。
use serde::{Deserialize, Serialize};

/// 下游中继事件，按 `{"type": ...}` 标签序列化为浏览器可消费的帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    Text { content: String },
    Images { images: Vec<String> },
    Done,
    Error { message: String },
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Done | RelayEvent::Error { .. })
    }
}

/// 上游流式 run 事件，在边界处完成标签化解码后交给中继层。
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// run 已创建；携带后续取消/回传所需的 run id。
    RunCreated { run_id: String },
    /// 首个内容块的文本增量；非文本块解码为空串，由中继层跳过。
    MessageDelta { text: String },
    RequiresAction {
        run_id: String,
        tool_calls: Vec<ToolCall>,
    },
    RunCompleted,
    RunFailed,
    /// `data: [DONE]` 哨兵。
    StreamDone,
    /// 未识别的事件标签：记录后忽略，保证向前推进。
    Unknown { event: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// 原始 JSON 参数串，解析失败时由工具侧回退处理。
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// 消息附件描述：上传成功的文件 id 绑定代码执行工具。
#[derive(Debug, Clone, Serialize)]
pub struct FileAttachment {
    pub file_id: String,
    pub tools: Vec<AttachmentTool>,
}

impl FileAttachment {
    pub fn for_code_interpreter(file_id: String) -> Self {
        Self {
            file_id,
            tools: vec![AttachmentTool {
                kind: "code_interpreter".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentTool {
    #[serde(rename = "type")]
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relay_event_wire_shapes_match_protocol() {
        let text = serde_json::to_value(RelayEvent::Text {
            content: "hello".to_string(),
        })
        .unwrap();
        assert_eq!(text, json!({ "type": "text", "content": "hello" }));

        let done = serde_json::to_value(RelayEvent::Done).unwrap();
        assert_eq!(done, json!({ "type": "done" }));

        let error = serde_json::to_value(RelayEvent::Error {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(error, json!({ "type": "error", "message": "boom" }));

        let images = serde_json::to_value(RelayEvent::Images {
            images: vec!["data:image/png;base64,AAAA".to_string()],
        })
        .unwrap();
        assert_eq!(
            images,
            json!({ "type": "images", "images": ["data:image/png;base64,AAAA"] })
        );
    }

    #[test]
    fn attachment_descriptor_references_code_interpreter() {
        let attachment = FileAttachment::for_code_interpreter("file_abc".to_string());
        let value = serde_json::to_value(&attachment).unwrap();
        assert_eq!(
            value,
            json!({ "file_id": "file_abc", "tools": [{ "type": "code_interpreter" }] })
        );
    }
}
