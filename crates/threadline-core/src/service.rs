//! Chat Service
//!
//! Delivery adapter over the turn controller. Blocking and streaming turns
//! share the same persistence sequence:
//!
//! 1. build context (summary + recent history + new user message)
//! 2. persist the user message; a failure here aborts before the model runs
//! 3. run the turn
//! 4. persist exactly one assistant message
//! 5. compact the thread if its message count lands on the cadence

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::memory::MemoryManager;
use crate::message::Message;
use crate::reasoning::{Agent, TurnEvent};
use crate::store::{ConversationStore, ThreadId};

/// Stream of reply fragments for a streaming turn
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Entry point for the inbound turn API
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ConversationStore>,
    memory: Arc<MemoryManager>,
    agent: Agent,
}

impl ChatService {
    pub fn new(store: Arc<dyn ConversationStore>, agent: Agent, memory: MemoryManager) -> Self {
        Self {
            store,
            memory: Arc::new(memory),
            agent,
        }
    }

    /// Run a turn and return the final reply
    #[tracing::instrument(name = "handle_turn", skip(self, text), fields(thread = %thread_id))]
    pub async fn handle_turn(&self, thread_id: &ThreadId, text: &str) -> Result<String> {
        let context = self.begin_turn(thread_id, text).await?;
        let outcome = self.agent.run_turn(context).await?;
        self.finish_turn(thread_id, &outcome.text).await?;
        Ok(outcome.text)
    }

    /// Run a turn, yielding reply fragments as they are produced
    ///
    /// The user message is persisted before this returns. The assistant message
    /// is persisted only once the stream is exhausted; dropping it early leaves
    /// the reply unpersisted.
    #[tracing::instrument(name = "handle_turn_streaming", skip(self, text), fields(thread = %thread_id))]
    pub async fn handle_turn_streaming(
        &self,
        thread_id: &ThreadId,
        text: &str,
    ) -> Result<FragmentStream> {
        let context = self.begin_turn(thread_id, text).await?;
        let service = self.clone();
        let thread_id = thread_id.clone();

        Ok(Box::pin(async_stream::stream! {
            let mut turn = service.agent.run_turn_stream(context);
            let mut streamed = String::new();

            while let Some(event) = turn.next().await {
                match event {
                    Ok(TurnEvent::Fragment(fragment)) => {
                        streamed.push_str(&fragment);
                        yield Ok(fragment);
                    }
                    Ok(TurnEvent::Finished(outcome)) => {
                        debug_assert_eq!(streamed, outcome.text);
                        if let Err(e) = service.finish_turn(&thread_id, &streamed).await {
                            yield Err(e);
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!(thread = %thread_id, error = %e, "Streaming turn failed");
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }

    /// Known thread ids, most recently active first
    pub async fn list_threads(&self) -> Result<Vec<ThreadId>> {
        self.store.list_threads().await
    }

    /// Persisted history, excluding replies a human rejected
    pub async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        let messages = self.store.list_messages(thread_id).await?;
        Ok(messages.into_iter().filter(|m| !m.is_rejected()).collect())
    }

    /// Record human approval or rejection of a persisted message
    pub async fn record_feedback(&self, message_id: Uuid, approved: bool) -> Result<()> {
        self.store.set_approval(message_id, approved).await?;
        tracing::info!(%message_id, approved, "Feedback recorded");
        Ok(())
    }

    async fn begin_turn(&self, thread_id: &ThreadId, text: &str) -> Result<Vec<Message>> {
        if text.trim().is_empty() {
            return Err(AgentError::InvalidInput("message is empty".into()));
        }

        let context = self.memory.build_context(thread_id, text).await?;
        self.store
            .append(thread_id, &context.user)
            .await
            .map_err(store_unavailable)?;

        Ok(context.into_messages())
    }

    async fn finish_turn(&self, thread_id: &ThreadId, reply: &str) -> Result<()> {
        let message = Message::assistant(reply).with_model(&self.agent.config().generation.model);
        self.store
            .append(thread_id, &message)
            .await
            .map_err(store_unavailable)?;

        let count = self.store.count_messages(thread_id).await?;
        // The reply is already durable; the next multiple of the period retries.
        if let Err(e) = self.memory.maybe_compact(thread_id, count).await {
            tracing::warn!(thread = %thread_id, count, error = %e, "Compaction failed");
        }
        Ok(())
    }
}

fn store_unavailable(err: AgentError) -> AgentError {
    match err {
        AgentError::StoreUnavailable(_) | AgentError::InvalidThreadId(_) => err,
        other => AgentError::StoreUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConfig, SUMMARY_NOTE_PREFIX};
    use crate::message::Role;
    use crate::provider::Completion;
    use crate::reasoning::{AgentBuilder, LOOP_BOUND_NOTICE};
    use crate::store::MemoryConversationStore;
    use crate::reasoning::AgentConfig;
    use crate::testing::{FlakyStore, ScriptedProvider, call, date_registry};
    use std::time::Duration;

    fn service_with(
        store: Arc<dyn ConversationStore>,
        provider: Arc<ScriptedProvider>,
        max_iterations: usize,
    ) -> ChatService {
        let agent = AgentBuilder::new()
            .provider(provider.clone())
            .tools(date_registry())
            .max_iterations(max_iterations)
            .build()
            .unwrap();
        let memory = MemoryManager::new(store.clone(), provider, MemoryConfig::default());
        ChatService::new(store, agent, memory)
    }

    fn thread() -> ThreadId {
        ThreadId::parse("service-test").unwrap()
    }

    async fn drain(mut stream: FragmentStream) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    #[tokio::test]
    async fn test_plain_turn_persists_pair() {
        let store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(Completion::text("Hi there!"))]));
        let service = service_with(store.clone(), provider.clone(), 6);

        let reply = service.handle_turn(&thread(), "Hello").await.unwrap();

        assert_eq!(reply, "Hi there!");
        let messages = store.list_messages(&thread()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi there!");
        assert_eq!(provider.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_date_question_persists_only_final_answer() {
        let store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(Completion::tool_calls(vec![call("datetime", &[("format", "iso")])])),
            Ok(Completion::text("Today is 2026-10-17.")),
        ]));
        let service = service_with(store.clone(), provider.clone(), 6);

        let reply = service
            .handle_turn(&thread(), "What's today's date?")
            .await
            .unwrap();

        assert_eq!(reply, "Today is 2026-10-17.");
        let messages = store.list_messages(&thread()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.role != Role::Tool && m.tool_calls.is_empty()));
        assert_eq!(messages[1].content, "Today is 2026-10-17.");
        assert_eq!(provider.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_preamble_and_answer_are_separated() {
        let script = || {
            vec![
                Ok(Completion {
                    content: "Let me check the date.".into(),
                    ..Completion::tool_calls(vec![call("datetime", &[])])
                }),
                Ok(Completion::text("Today is Saturday.")),
            ]
        };
        let expected = "Let me check the date.\n\nToday is Saturday.";

        let blocking_store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(script()));
        let service = service_with(blocking_store.clone(), provider, 6);
        let reply = service.handle_turn(&thread(), "What day is it?").await.unwrap();
        assert_eq!(reply, expected);

        let streaming_store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(script()));
        let service = service_with(streaming_store.clone(), provider, 6);
        let stream = service
            .handle_turn_streaming(&thread(), "What day is it?")
            .await
            .unwrap();
        assert_eq!(drain(stream).await.unwrap(), expected);

        for store in [blocking_store, streaming_store] {
            let messages = store.list_messages(&thread()).await.unwrap();
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[1].content, expected);
        }
    }

    #[tokio::test]
    async fn test_stalled_stream_persists_no_reply() {
        let store = Arc::new(MemoryConversationStore::new());
        let provider =
            Arc::new(ScriptedProvider::new(vec![Ok(Completion::text("Half an"))]).stalling());
        let agent = AgentBuilder::new()
            .provider(provider.clone())
            .tools(date_registry())
            .config(AgentConfig {
                model_timeout: Duration::from_millis(20),
                ..Default::default()
            })
            .build()
            .unwrap();
        let memory = MemoryManager::new(store.clone(), provider, MemoryConfig::default());
        let service = ChatService::new(store.clone(), agent, memory);

        let mut stream = service
            .handle_turn_streaming(&thread(), "Tell me a story")
            .await
            .unwrap();
        let mut fragments = String::new();
        let mut failure = None;
        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(f) => fragments.push_str(&f),
                Err(e) => failure = Some(e),
            }
        }

        assert_eq!(fragments, "Half an");
        assert!(matches!(
            failure,
            Some(AgentError::ModelUnavailable(msg)) if msg.contains("stalled")
        ));
        let messages = store.list_messages(&thread()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_loop_bound_persists_fallback() {
        let store = Arc::new(MemoryConversationStore::new());
        let script = (0..4)
            .map(|_| Ok(Completion::tool_calls(vec![call("datetime", &[])])))
            .collect();
        let provider = Arc::new(ScriptedProvider::new(script));
        let service = service_with(store.clone(), provider.clone(), 2);

        let reply = service.handle_turn(&thread(), "loop forever").await.unwrap();

        assert_eq!(reply, LOOP_BOUND_NOTICE);
        assert_eq!(provider.calls().await.len(), 2);
        let messages = store.list_messages(&thread()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, LOOP_BOUND_NOTICE);
    }

    #[tokio::test]
    async fn test_model_failure_keeps_user_message_only() {
        let store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![Err(AgentError::ModelUnavailable(
            "upstream down".into(),
        ))]));
        let service = service_with(store.clone(), provider, 6);

        let err = service.handle_turn(&thread(), "Hello?").await.unwrap_err();

        assert!(matches!(err, AgentError::ModelUnavailable(_)));
        let messages = store.list_messages(&thread()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hello?");
    }

    #[tokio::test]
    async fn test_store_failure_aborts_before_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(Completion::text("never"))]));
        let service = service_with(FlakyStore::failing(), provider.clone(), 6);

        let err = service.handle_turn(&thread(), "Hello").await.unwrap_err();
        assert!(matches!(err, AgentError::StoreUnavailable(_)));

        let err = service
            .handle_turn_streaming(&thread(), "Hello")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::StoreUnavailable(_)));
        assert!(provider.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let store = Arc::new(MemoryConversationStore::new());
        let service = service_with(store.clone(), Arc::new(ScriptedProvider::new(vec![])), 6);

        let err = service.handle_turn(&thread(), "   ").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
        assert_eq!(store.count_messages(&thread()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_streaming_and_blocking_persist_identical_text() {
        let script = || {
            vec![
                Ok(Completion::tool_calls(vec![call("datetime", &[])])),
                Ok(Completion::text("The date is in the tool output above.")),
            ]
        };

        let blocking_store = Arc::new(MemoryConversationStore::new());
        service_with(blocking_store.clone(), Arc::new(ScriptedProvider::new(script())), 6)
            .handle_turn(&thread(), "date?")
            .await
            .unwrap();

        let streaming_store = Arc::new(MemoryConversationStore::new());
        let stream = service_with(
            streaming_store.clone(),
            Arc::new(ScriptedProvider::new(script())),
            6,
        )
        .handle_turn_streaming(&thread(), "date?")
        .await
        .unwrap();
        let streamed = drain(stream).await.unwrap();

        let blocking = blocking_store.list_messages(&thread()).await.unwrap();
        let streaming = streaming_store.list_messages(&thread()).await.unwrap();
        assert_eq!(streaming.len(), 2);
        assert_eq!(streamed, streaming[1].content);
        assert_eq!(blocking[1].content, streaming[1].content);
    }

    #[tokio::test]
    async fn test_streaming_persists_user_before_first_poll() {
        let store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(Completion::text("a b c"))]));
        let service = service_with(store.clone(), provider, 6);

        let stream = service.handle_turn_streaming(&thread(), "hi").await.unwrap();
        assert_eq!(store.count_messages(&thread()).await.unwrap(), 1);

        drain(stream).await.unwrap();
        assert_eq!(store.count_messages(&thread()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropped_stream_persists_no_reply() {
        let store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(Completion::text(
            "this reply is never finished",
        ))]));
        let service = service_with(store.clone(), provider, 6);

        let mut stream = service.handle_turn_streaming(&thread(), "hi").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "this ");
        drop(stream);

        let messages = store.list_messages(&thread()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_streaming_model_failure() {
        let store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![Err(AgentError::ModelUnavailable(
            "down".into(),
        ))]));
        let service = service_with(store.clone(), provider, 6);

        let stream = service.handle_turn_streaming(&thread(), "hi").await.unwrap();
        let err = drain(stream).await.unwrap_err();

        assert!(matches!(err, AgentError::ModelUnavailable(_)));
        assert_eq!(store.count_messages(&thread()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compaction_after_eight_exchanges() {
        let store = Arc::new(MemoryConversationStore::new());
        let mut script: Vec<Result<Completion>> =
            (0..8).map(|i| Ok(Completion::text(format!("answer {i}")))).collect();
        script.push(Ok(Completion::text("The user asked eight questions.")));
        script.push(Ok(Completion::text("answer 8")));
        let provider = Arc::new(ScriptedProvider::new(script));
        let service = service_with(store.clone(), provider.clone(), 6);

        for i in 0..8 {
            service.handle_turn(&thread(), &format!("question {i}")).await.unwrap();
            let summarized = store.get_summary(&thread()).await.unwrap().is_some();
            assert_eq!(summarized, i == 7, "summary presence after turn {i}");
        }

        let summary = store.get_summary(&thread()).await.unwrap().unwrap();
        assert_eq!(summary.text, "The user asked eight questions.");
        assert_eq!(summary.covered_messages, 16);
        assert_eq!(provider.calls().await.len(), 9);

        service.handle_turn(&thread(), "question 8").await.unwrap();
        let calls = provider.calls().await;
        let ninth = &calls[9];
        assert_eq!(ninth[0].role, Role::System);
        assert!(ninth[0].content.starts_with(SUMMARY_NOTE_PREFIX));
        assert_eq!(ninth.len(), 1 + 8 + 1);
        assert_eq!(ninth[1].content, "question 4");
        assert_eq!(ninth[9].content, "question 8");

        // Raw history is never trimmed.
        assert_eq!(store.count_messages(&thread()).await.unwrap(), 18);
    }

    #[tokio::test]
    async fn test_failed_compaction_still_returns_reply() {
        let store = Arc::new(MemoryConversationStore::new());
        let mut script: Vec<Result<Completion>> =
            (0..8).map(|i| Ok(Completion::text(format!("answer {i}")))).collect();
        script.push(Err(AgentError::ModelUnavailable("summarizer down".into())));
        let service = service_with(store.clone(), Arc::new(ScriptedProvider::new(script)), 6);

        for i in 0..8 {
            let reply = service.handle_turn(&thread(), &format!("q{i}")).await.unwrap();
            assert_eq!(reply, format!("answer {i}"));
        }
        assert!(store.get_summary(&thread()).await.unwrap().is_none());
        assert_eq!(store.count_messages(&thread()).await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_history_hides_rejected_replies() {
        let store = Arc::new(MemoryConversationStore::new());
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(Completion::text("good answer")),
            Ok(Completion::text("bad answer")),
        ]));
        let service = service_with(store.clone(), provider, 6);

        service.handle_turn(&thread(), "one").await.unwrap();
        service.handle_turn(&thread(), "two").await.unwrap();

        let all = service.history(&thread()).await.unwrap();
        service.record_feedback(all[1].id, true).await.unwrap();
        service.record_feedback(all[3].id, false).await.unwrap();

        let visible: Vec<_> = service
            .history(&thread())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(visible, vec!["one", "good answer", "two"]);
        assert_eq!(service.list_threads().await.unwrap(), vec![thread()]);

        let err = service.record_feedback(Uuid::new_v4(), true).await.unwrap_err();
        assert!(matches!(err, AgentError::MessageNotFound(_)));
    }
}
