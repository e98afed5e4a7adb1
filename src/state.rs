// 全局状态：共享 HTTP 客户端与各核心组件的装配。
use crate::assistant::{AssistantBackend, AssistantClient};
use crate::config::Config;
use crate::metrics::MetricsClient;
use crate::sessions::{AssistantProvider, SessionStore};
use anyhow::Result;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct AppState {
    pub config: Config,
    pub backend: Arc<dyn AssistantBackend>,
    pub sessions: SessionStore,
    pub assistants: AssistantProvider,
    pub metrics: MetricsClient,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        if config.assistant.resolved_api_key().is_none() {
            warn!("未配置上游 API key（OPENAI_API_KEY 或 assistant.api_key），上游调用会被拒绝");
        }
        // 连接超时统一设置；请求级超时由各客户端按用途控制。
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let backend: Arc<dyn AssistantBackend> =
            Arc::new(AssistantClient::new(http.clone(), config.assistant.clone()));
        Ok(Self::assemble(config, backend, http))
    }

    /// 注入式构造，供集成测试挂接脚本化后端。
    pub fn with_backend(config: Config, backend: Arc<dyn AssistantBackend>) -> Self {
        Self::assemble(config, backend, Client::new())
    }

    fn assemble(config: Config, backend: Arc<dyn AssistantBackend>, http: Client) -> Self {
        let metrics = MetricsClient::new(http, &config.metrics);
        let assistants = AssistantProvider::new(config.assistant.resolved_assistant_id());
        Self {
            config,
            backend,
            sessions: SessionStore::new(),
            assistants,
            metrics,
        }
    }
}
