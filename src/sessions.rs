// 会话注册表与助手引导：进程内共享状态，带明确的并发契约。
use crate::assistant::AssistantBackend;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

/// userId → 上游线程 id 的注册表。
///
/// 并发契约：同一 userId 的首次创建经过按键互斥锁串行化，
/// 线程 id 一经写入在进程生命周期内不再变更。无过期、无容量上限。
#[derive(Default)]
pub struct SessionStore {
    threads: DashMap<String, Arc<Mutex<Option<String>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回该用户的线程 id，必要时先在上游创建。
    pub async fn resolve_thread(
        &self,
        user_id: &str,
        backend: &dyn AssistantBackend,
    ) -> Result<String> {
        let slot = self
            .threads
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        // 锁只覆盖单个键，不同用户的创建互不阻塞。
        let mut guard = slot.lock().await;
        if let Some(thread_id) = guard.as_ref() {
            return Ok(thread_id.clone());
        }
        let thread_id = backend.create_thread().await?;
        info!("已为用户 {user_id} 创建会话线程 {thread_id}");
        *guard = Some(thread_id.clone());
        Ok(thread_id)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// 助手配置单例：优先使用预置 id，否则首次访问时创建并缓存。
pub struct AssistantProvider {
    preset: Option<String>,
    cell: OnceCell<String>,
}

impl AssistantProvider {
    pub fn new(preset: Option<String>) -> Self {
        Self {
            preset,
            cell: OnceCell::new(),
        }
    }

    pub async fn ensure(&self, backend: &dyn AssistantBackend) -> Result<String> {
        if let Some(assistant_id) = &self.preset {
            return Ok(assistant_id.clone());
        }
        let assistant_id = self
            .cell
            .get_or_try_init(|| async {
                let assistant_id = backend.create_assistant().await?;
                info!("已创建助手配置 {assistant_id}");
                Ok::<String, anyhow::Error>(assistant_id)
            })
            .await?;
        Ok(assistant_id.clone())
    }
}
