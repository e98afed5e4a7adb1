// 集成测试公用的脚本化上游后端。
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use gauge_server::assistant::{AssistantBackend, RunEventStream};
use gauge_server::schemas::{FileAttachment, RunEvent, ToolOutput};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// 按脚本回放 run 事件的假后端：open_run 与每次工具回传各消费一段脚本，
/// 同时记录所有写入调用，便于断言。
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<Result<RunEvent>>>>,
    images: Vec<(String, Option<Vec<u8>>)>,
    fail_thread_creation: bool,
    thread_seq: AtomicUsize,
    file_seq: AtomicUsize,
    pub uploads: Mutex<Vec<(String, String, usize)>>,
    pub messages: Mutex<Vec<(String, String, Vec<String>)>>,
    pub submissions: Mutex<Vec<(String, Vec<ToolOutput>)>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, events: Vec<Result<RunEvent>>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(events);
        self
    }

    pub fn with_image(mut self, file_id: &str, bytes: Option<Vec<u8>>) -> Self {
        self.images.push((file_id.to_string(), bytes));
        self
    }

    pub fn failing_thread_creation(mut self) -> Self {
        self.fail_thread_creation = true;
        self
    }

    fn next_script(&self) -> Result<RunEventStream> {
        let events = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted events left"))?;
        Ok(futures::stream::iter(events).boxed())
    }
}

#[async_trait]
impl AssistantBackend for ScriptedBackend {
    async fn create_assistant(&self) -> Result<String> {
        Ok("asst_scripted".to_string())
    }

    async fn create_thread(&self) -> Result<String> {
        if self.fail_thread_creation {
            return Err(anyhow!("thread creation refused by upstream"));
        }
        let n = self.thread_seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("thread_{n}"))
    }

    async fn upload_file(&self, filename: &str, mime_type: &str, data: Vec<u8>) -> Result<String> {
        self.uploads.lock().expect("uploads lock").push((
            filename.to_string(),
            mime_type.to_string(),
            data.len(),
        ));
        let n = self.file_seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("file_{n}"))
    }

    async fn append_message(
        &self,
        thread_id: &str,
        content: &str,
        attachments: &[FileAttachment],
    ) -> Result<()> {
        let file_ids = attachments
            .iter()
            .map(|item| item.file_id.clone())
            .collect();
        self.messages.lock().expect("messages lock").push((
            thread_id.to_string(),
            content.to_string(),
            file_ids,
        ));
        Ok(())
    }

    async fn open_run(&self, _thread_id: &str, _assistant_id: &str) -> Result<RunEventStream> {
        self.next_script()
    }

    async fn submit_tool_outputs(
        &self,
        _thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<RunEventStream> {
        self.submissions
            .lock()
            .expect("submissions lock")
            .push((run_id.to_string(), outputs.to_vec()));
        self.next_script()
    }

    async fn latest_assistant_images(&self, _thread_id: &str) -> Result<Vec<String>> {
        Ok(self
            .images
            .iter()
            .map(|(file_id, _)| file_id.clone())
            .collect())
    }

    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>> {
        self.images
            .iter()
            .find(|(id, _)| id == file_id)
            .and_then(|(_, bytes)| bytes.clone())
            .ok_or_else(|| anyhow!("file {file_id} not downloadable"))
    }

    async fn cancel_run(&self, _thread_id: &str, run_id: &str) -> Result<()> {
        self.cancelled
            .lock()
            .expect("cancelled lock")
            .push(run_id.to_string());
        Ok(())
    }
}
