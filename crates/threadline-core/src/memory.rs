//! Memory Manager
//!
//! Two tiers of conversation memory:
//!
//! - **Short-term**: the last `short_term_window` persisted messages, sent verbatim.
//! - **Long-term**: one rolling summary per thread, refreshed every
//!   `compaction_period` messages and injected as a leading system note.
//!
//! Trimming is a read-time view; raw messages are never deleted.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::store::{ConversationStore, Summary, ThreadId};

/// Persona for the summarization call, distinct from the chat persona
pub const SUMMARY_PROMPT: &str = r"You are a memory summarization assistant.

Your task:
- Summarize the conversation briefly
- Preserve important facts, preferences, goals, and decisions
- Remove small talk and filler
- Write in plain sentences, not bullet points
- Do NOT include timestamps or speaker labels";

/// Prefix of the system note that carries the summary into a turn
pub const SUMMARY_NOTE_PREFIX: &str = "Summary of the earlier conversation:\n";

/// Memory configuration
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Persisted messages sent verbatim each turn (K)
    pub short_term_window: usize,

    /// Compaction fires when the thread's message count is a multiple of this (P)
    pub compaction_period: usize,

    /// Messages fed to the summarizer on each compaction
    pub summary_window: usize,

    /// Generation options for the summarization call
    pub summary_options: GenerationOptions,

    /// Upper bound on the summarization call
    pub summary_timeout: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: 8,
            compaction_period: 16,
            summary_window: 16,
            summary_options: GenerationOptions {
                temperature: 0.2,
                max_tokens: 512,
                ..Default::default()
            },
            summary_timeout: Duration::from_secs(60),
        }
    }
}

/// Working context for one turn, before the persona is applied
#[derive(Clone, Debug)]
pub struct TurnContext {
    /// Summary note, if the thread has been compacted
    pub summary: Option<Message>,

    /// Last K persisted messages, oldest first
    pub history: Vec<Message>,

    /// The new user message (persisted by the caller before the model runs)
    pub user: Message,
}

impl TurnContext {
    /// Ordered sequence sent to the model
    pub fn into_messages(self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.extend(self.summary);
        messages.extend(self.history);
        messages.push(self.user);
        messages
    }
}

/// Builds bounded context and compacts long threads into summaries
pub struct MemoryManager {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    config: MemoryConfig,
}

impl MemoryManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn LlmProvider>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Assemble `[summary note] + last K messages + new user message`
    pub async fn build_context(&self, thread_id: &ThreadId, user_text: &str) -> Result<TurnContext> {
        let summary = self
            .store
            .get_summary(thread_id)
            .await?
            .map(|s| Message::system(format!("{SUMMARY_NOTE_PREFIX}{}", s.text)));

        let history = self
            .store
            .list_recent(thread_id, self.config.short_term_window)
            .await?;

        tracing::debug!(
            thread = %thread_id,
            has_summary = summary.is_some(),
            history = history.len(),
            "Built turn context"
        );

        Ok(TurnContext {
            summary,
            history,
            user: Message::user(user_text),
        })
    }

    /// Whether a thread with `message_count` messages is due for compaction
    pub const fn is_compaction_due(&self, message_count: usize) -> bool {
        let period = self.config.compaction_period;
        period > 0 && message_count > 0 && message_count % period == 0
    }

    /// Compact if `message_count` lands on the compaction cadence
    pub async fn maybe_compact(
        &self,
        thread_id: &ThreadId,
        message_count: usize,
    ) -> Result<Option<Summary>> {
        if !self.is_compaction_due(message_count) {
            return Ok(None);
        }
        self.compact(thread_id, message_count).await
    }

    /// Summarize the most recent window and replace the thread's summary
    ///
    /// Only raw messages are summarized, never the previous summary, so running
    /// this twice over the same window converges instead of drifting.
    #[tracing::instrument(name = "compact_thread", skip(self), fields(thread = %thread_id))]
    pub async fn compact(
        &self,
        thread_id: &ThreadId,
        message_count: usize,
    ) -> Result<Option<Summary>> {
        let window = self
            .store
            .list_recent(thread_id, self.config.summary_window)
            .await?;

        let transcript = render_transcript(&window);
        if transcript.is_empty() {
            return Ok(None);
        }

        let request = [Message::system(SUMMARY_PROMPT), Message::user(transcript)];
        let completion = tokio::time::timeout(
            self.config.summary_timeout,
            self.provider
                .complete(&request, &[], &self.config.summary_options),
        )
        .await
        .map_err(|_| AgentError::ModelUnavailable("summarization timed out".into()))??;

        let text = completion.content.trim();
        if text.is_empty() {
            tracing::warn!("Summarizer returned empty text; keeping previous summary");
            return Ok(None);
        }

        let summary = Summary::new(thread_id.clone(), text, message_count);
        self.store.upsert_summary(&summary).await?;

        tracing::info!(covered = message_count, chars = text.len(), "Thread compacted");
        Ok(Some(summary))
    }
}

/// `User: ...` / `Assistant: ...` lines for the summarizer
fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(format!("User: {}", m.content)),
            Role::Assistant => Some(format!("Assistant: {}", m.content)),
            Role::System | Role::Tool => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
