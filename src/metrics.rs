// 分析服务旁路调用：限时请求，失败时以标记过的样例数据兜底。
use crate::config::MetricsConfig;
use crate::schemas::ToolCall;
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct MetricsArgs {
    metric_type: String,
    #[serde(default)]
    time_period: Option<String>,
}

#[derive(Clone)]
pub struct MetricsClient {
    http: Client,
    endpoint: String,
    timeout: Duration,
}

impl MetricsClient {
    pub fn new(http: Client, config: &MetricsConfig) -> Self {
        Self {
            http,
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_secs(config.timeout_s.max(1)),
        }
    }

    /// 工具调用 → 工具输出串。任何失败（参数损坏、超时、非 2xx）
    /// 都降级为兜底数据，让 run 得以继续。
    pub async fn resolve(&self, call: &ToolCall) -> String {
        match self.query(&call.arguments).await {
            Ok(output) => output,
            Err(err) => {
                warn!("分析服务调用失败，使用兜底数据: {err}");
                fallback_payload().to_string()
            }
        }
    }

    async fn query(&self, arguments: &str) -> Result<String> {
        let args: MetricsArgs = serde_json::from_str(arguments)?;
        let question = build_question(&args.metric_type, args.time_period.as_deref());
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&json!({ "question": question }))
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("analytics api returned {status}"));
        }
        let result = body
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("analytics response missing result field"))?;
        Ok(result.to_string())
    }
}

fn build_question(metric_type: &str, time_period: Option<&str>) -> String {
    match time_period.map(str::trim).filter(|value| !value.is_empty()) {
        Some(period) => format!("Get {metric_type} data for {period}"),
        None => format!("Get {metric_type} data"),
    }
}

/// 兜底样例：明确标注为占位数据，避免被当成真实指标。
pub fn fallback_payload() -> Value {
    json!({
        "message": "API currently unavailable. This is dummy data for testing.",
        "data": [
            { "date": "2025-01-01", "dau": 1500 },
            { "date": "2025-01-02", "dau": 1750 },
            { "date": "2025-01-03", "dau": 1600 }
        ]
    })
}
