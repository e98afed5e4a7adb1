// 配置读取：YAML 文件加载，环境变量覆盖关键项。
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 单次聊天请求（含附件）的请求体上限。
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// 已创建好的助手 id；提供时跳过引导创建。
    pub assistant_id: Option<String>,
    pub model: String,
    /// 非流式上游调用的超时。流式 run 不设上限。
    pub request_timeout_s: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            assistant_id: None,
            model: "gpt-4o".to_string(),
            request_timeout_s: 120,
        }
    }
}

impl AssistantConfig {
    /// 环境变量优先于配置文件，兼容原有部署方式。
    pub fn resolved_api_key(&self) -> Option<String> {
        env::var("OPENAI_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.api_key.clone())
            .filter(|value| !value.trim().is_empty())
    }

    pub fn resolved_assistant_id(&self) -> Option<String> {
        env::var("OPENAI_ASSISTANT_ID")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.assistant_id.clone())
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub endpoint: String,
    pub timeout_s: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8696/run_bq_tool".to_string(),
            timeout_s: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 文件缺失或解析失败时退回默认配置，保证服务可启动。
    pub fn load(path: &Path) -> Config {
        if !path.exists() {
            return Config::default();
        }
        match fs::read_to_string(path) {
            Ok(raw) => match serde_yaml::from_str::<Config>(&raw) {
                Ok(config) => config,
                Err(err) => {
                    warn!("配置解析失败，使用默认配置: {err}");
                    Config::default()
                }
            },
            Err(err) => {
                warn!("配置读取失败，使用默认配置: {err}");
                Config::default()
            }
        }
    }

    pub fn load_default() -> Config {
        let path = env::var("GAUGE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        Config::load(Path::new(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/gauge.yaml"));
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.metrics.timeout_s, 5);
        assert_eq!(config.assistant.model, "gpt-4o");
    }

    #[test]
    fn partial_yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  host: 127.0.0.1\n  port: 9100\n  max_upload_bytes: 1024\nmetrics:\n  endpoint: http://analytics.local/run_bq_tool\n  timeout_s: 3"
        )
        .unwrap();
        let config = Config::load(file.path());
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.metrics.endpoint, "http://analytics.local/run_bq_tool");
        assert_eq!(config.metrics.timeout_s, 3);
        // 未覆盖的节保持默认。
        assert_eq!(config.assistant.base_url, "https://api.openai.com");
    }

    #[test]
    fn broken_yaml_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server: [not-a-map").unwrap();
        let config = Config::load(file.path());
        assert_eq!(config.server.port, 8000);
    }
}
