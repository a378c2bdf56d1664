//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{Completion, CompletionStream, GenerationOptions, LlmProvider, StreamChunk};
use crate::store::{ConversationStore, MemoryConversationStore, Summary, ThreadId};
use crate::tool::{DateTimeTool, Tool, ToolCall, ToolRegistry, ToolResult, ToolSchema};

/// Provider that replays a fixed script of responses
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Completion>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    offered: Mutex<Vec<Vec<String>>>,
    delay: Option<Duration>,
    stall: bool,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<Completion>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
            delay: None,
            stall: false,
        }
    }

    /// Sleep before every response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Streams send their text and then go silent instead of finishing
    pub const fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Messages received by each call, in order
    pub async fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().await.clone()
    }

    /// Tool names offered on each call, in order
    pub async fn offered_tools(&self) -> Vec<Vec<String>> {
        self.offered.lock().await.clone()
    }

    async fn next(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<Completion> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().await.push(messages.to_vec());
        self.offered
            .lock()
            .await
            .push(tools.iter().map(|t| t.name.clone()).collect());
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::ModelUnavailable("script exhausted".into())))
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        _options: &GenerationOptions,
    ) -> Result<Completion> {
        self.next(messages, tools).await
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        _options: &GenerationOptions,
    ) -> Result<CompletionStream> {
        let completion = self.next(messages, tools).await?;

        let mut chunks: Vec<Result<StreamChunk>> = completion
            .content
            .split_inclusive(' ')
            .map(|word| Ok(StreamChunk::delta(word)))
            .collect();
        if self.stall {
            let stalled = futures::stream::iter(chunks).chain(futures::stream::pending());
            return Ok(Box::pin(stalled));
        }
        chunks.push(Ok(StreamChunk {
            tool_calls: completion.tool_calls,
            done: true,
            ..Default::default()
        }));

        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// Tool that sleeps before answering
pub struct SleepyTool(pub Duration);

#[async_trait]
impl Tool for SleepyTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "sleepy".into(),
            description: "Answers after a delay".into(),
            parameters: vec![],
        }
    }

    async fn execute(&self, _call: &ToolCall) -> Result<ToolResult> {
        tokio::time::sleep(self.0).await;
        Ok(ToolResult::success("sleepy", "awake"))
    }
}

/// Registry holding only the date/time tool
pub fn date_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(DateTimeTool);
    registry
}

/// Tool call with string arguments
pub fn call(name: &str, args: &[(&str, &str)]) -> ToolCall {
    let arguments: HashMap<String, serde_json::Value> = args
        .iter()
        .map(|(k, v)| ((*k).to_string(), serde_json::json!(v)))
        .collect();
    ToolCall::new(name, arguments)
}

/// Store whose appends can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryConversationStore,
    fail_appends: std::sync::atomic::AtomicBool,
}

impl FlakyStore {
    pub fn failing() -> Arc<Self> {
        let store = Self::default();
        store
            .fail_appends
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Arc::new(store)
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn append(&self, thread_id: &ThreadId, message: &Message) -> Result<()> {
        if self.fail_appends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AgentError::StoreUnavailable("disk full".into()));
        }
        self.inner.append(thread_id, message).await
    }

    async fn list_recent(&self, thread_id: &ThreadId, limit: usize) -> Result<Vec<Message>> {
        self.inner.list_recent(thread_id, limit).await
    }

    async fn list_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        self.inner.list_messages(thread_id).await
    }

    async fn get_summary(&self, thread_id: &ThreadId) -> Result<Option<Summary>> {
        self.inner.get_summary(thread_id).await
    }

    async fn upsert_summary(&self, summary: &Summary) -> Result<()> {
        self.inner.upsert_summary(summary).await
    }

    async fn count_messages(&self, thread_id: &ThreadId) -> Result<usize> {
        self.inner.count_messages(thread_id).await
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>> {
        self.inner.list_threads().await
    }

    async fn set_approval(&self, message_id: Uuid, approved: bool) -> Result<()> {
        self.inner.set_approval(message_id, approved).await
    }
}
