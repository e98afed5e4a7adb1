// 流式中继状态机：消费上游 run 事件，产出下游中继事件。
//
// 每个请求由单一任务驱动：在等待上游事件与旁路调用处挂起，
// 请求内部不做并行扇出。文本增量按到达顺序原样转发，
// 不重排、不去重、不丢弃；每条流以且仅以一个终止事件收尾。
use crate::assistant::{AssistantBackend, RunEventStream};
use crate::metrics::MetricsClient;
use crate::schemas::{RelayEvent, RunEvent, ToolOutput};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const METRICS_TOOL_NAME: &str = "get_metrics";

pub struct Relay {
    backend: Arc<dyn AssistantBackend>,
    metrics: MetricsClient,
    thread_id: String,
}

impl Relay {
    pub fn new(backend: Arc<dyn AssistantBackend>, metrics: MetricsClient, thread_id: String) -> Self {
        Self {
            backend,
            metrics,
            thread_id,
        }
    }

    /// 驱动一条已打开的 run 事件流直至终止。
    ///
    /// 发送失败意味着客户端已断开：中继停止消费并尽力取消上游 run。
    pub async fn drive(self, mut events: RunEventStream, tx: mpsc::Sender<RelayEvent>) {
        // 工具回传会替换事件流；run id 从 run.created / requires_action 捕获。
        let mut current_run: Option<String> = None;
        loop {
            let Some(item) = events.next().await else {
                // 上游流在无终止事件时关闭，按协议错误上报。
                let _ = tx
                    .send(RelayEvent::Error {
                        message: "assistant stream ended unexpectedly".to_string(),
                    })
                    .await;
                return;
            };
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    let _ = tx
                        .send(RelayEvent::Error {
                            message: err.to_string(),
                        })
                        .await;
                    return;
                }
            };
            match event {
                RunEvent::RunCreated { run_id } => {
                    if !run_id.is_empty() {
                        current_run = Some(run_id);
                    }
                }
                RunEvent::MessageDelta { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(RelayEvent::Text { content: text }).await.is_err() {
                        self.teardown(current_run.as_deref()).await;
                        return;
                    }
                }
                RunEvent::RequiresAction { run_id, tool_calls } => {
                    current_run = Some(run_id.clone());
                    let mut outputs = Vec::new();
                    for call in &tool_calls {
                        if call.name != METRICS_TOOL_NAME {
                            continue;
                        }
                        outputs.push(ToolOutput {
                            tool_call_id: call.id.clone(),
                            output: self.metrics.resolve(call).await,
                        });
                    }
                    if outputs.is_empty() {
                        // 没有可回传的输出时上游会以 run.failed 超时收场，
                        // 继续消费原流等待该终止事件。
                        debug!("requires_action 中无 get_metrics 调用，保持原流");
                        continue;
                    }
                    match self
                        .backend
                        .submit_tool_outputs(&self.thread_id, &run_id, &outputs)
                        .await
                    {
                        Ok(next) => events = next,
                        Err(err) => {
                            let _ = tx
                                .send(RelayEvent::Error {
                                    message: err.to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                }
                RunEvent::RunCompleted => {
                    let images = self.collect_images().await;
                    if !images.is_empty()
                        && tx.send(RelayEvent::Images { images }).await.is_err()
                    {
                        return;
                    }
                    let _ = tx.send(RelayEvent::Done).await;
                    return;
                }
                RunEvent::RunFailed => {
                    let _ = tx
                        .send(RelayEvent::Error {
                            message: "assistant run failed".to_string(),
                        })
                        .await;
                    return;
                }
                RunEvent::StreamDone => {
                    // 终止帧已在 completed/failed 分支发出；哨兵仅结束本段流。
                }
                RunEvent::Unknown { event } => {
                    debug!("忽略未识别的上游事件: {event}");
                }
            }
        }
    }

    /// run 完成后的收尾：抓取最近助手消息里的图片并编码为 data URI。
    /// 单张图片失败只跳过该图片，不中断完成流程。
    async fn collect_images(&self) -> Vec<String> {
        let file_ids = match self.backend.latest_assistant_images(&self.thread_id).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!("获取助手消息失败，跳过图片收集: {err}");
                return Vec::new();
            }
        };
        let mut images = Vec::new();
        for file_id in file_ids {
            match self.backend.file_content(&file_id).await {
                Ok(bytes) => {
                    images.push(format!("data:image/png;base64,{}", BASE64.encode(bytes)));
                }
                Err(err) => {
                    warn!("图片 {file_id} 获取失败，已跳过: {err}");
                }
            }
        }
        images
    }

    async fn teardown(&self, run_id: Option<&str>) {
        let Some(run_id) = run_id else {
            return;
        };
        if let Err(err) = self.backend.cancel_run(&self.thread_id, run_id).await {
            debug!("取消上游 run 失败: {err}");
        }
    }
}
