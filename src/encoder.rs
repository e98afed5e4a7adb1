// 下游帧编码：每个中继事件对应一条 `data: <JSON>\n\n` 记录，立即可刷出。
use crate::schemas::RelayEvent;

/// 编码对联合类型是全函数：所有变体都是纯数据，序列化不会失败。
pub fn encode_frame(event: &RelayEvent) -> String {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"type":"error","message":"frame encoding failed"}"#.to_string());
    format!("data: {payload}\n\n")
}
