//! Conversation Store
//!
//! Append-only message log per thread plus a single summary slot per thread.
//! Context shaping (trimming, tool folding) never happens here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::Message;

const MAX_THREAD_ID_LEN: usize = 128;

/// Conversation thread identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Generate a fresh random thread id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a caller-supplied id
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.trim().is_empty() || s.len() > MAX_THREAD_ID_LEN || s.chars().any(char::is_control) {
            return Err(AgentError::InvalidThreadId(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Condensed digest of older conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub thread_id: ThreadId,
    pub text: String,
    /// Thread message count when the summary was produced
    pub covered_messages: usize,
    pub updated_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(thread_id: ThreadId, text: impl Into<String>, covered_messages: usize) -> Self {
        Self {
            thread_id,
            text: text.into(),
            covered_messages,
            updated_at: Utc::now(),
        }
    }
}

/// Persistence capability consumed by the memory manager and chat service
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a message; creates the thread on first write
    async fn append(&self, thread_id: &ThreadId, message: &Message) -> Result<()>;

    /// Most recent `limit` messages, oldest first
    async fn list_recent(&self, thread_id: &ThreadId, limit: usize) -> Result<Vec<Message>>;

    /// Full history, oldest first
    async fn list_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>>;

    async fn get_summary(&self, thread_id: &ThreadId) -> Result<Option<Summary>>;

    /// Replace the thread's summary (last write wins)
    async fn upsert_summary(&self, summary: &Summary) -> Result<()>;

    async fn count_messages(&self, thread_id: &ThreadId) -> Result<usize>;

    /// Known threads, most recently active first
    async fn list_threads(&self) -> Result<Vec<ThreadId>>;

    /// Attach human approval to a persisted message
    async fn set_approval(&self, message_id: Uuid, approved: bool) -> Result<()>;
}

/// Insert keeping `created_at` order; equal timestamps stay in insertion order.
pub fn insert_chronological(messages: &mut Vec<Message>, message: Message) {
    let pos = messages.partition_point(|m| m.created_at <= message.created_at);
    messages.insert(pos, message);
}

/// Tail of `messages` holding at most `limit` entries
pub fn tail(messages: &[Message], limit: usize) -> Vec<Message> {
    messages[messages.len().saturating_sub(limit)..].to_vec()
}

#[derive(Default)]
struct ThreadEntry {
    messages: Vec<Message>,
    summary: Option<Summary>,
}

impl ThreadEntry {
    fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(|m| m.created_at)
    }
}

/// In-memory store (for development/testing)
#[derive(Default)]
pub struct MemoryConversationStore {
    threads: RwLock<HashMap<ThreadId, ThreadEntry>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append(&self, thread_id: &ThreadId, message: &Message) -> Result<()> {
        let mut threads = self.threads.write().await;
        let entry = threads.entry(thread_id.clone()).or_default();
        insert_chronological(&mut entry.messages, message.clone());
        Ok(())
    }

    async fn list_recent(&self, thread_id: &ThreadId, limit: usize) -> Result<Vec<Message>> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|e| tail(&e.messages, limit))
            .unwrap_or_default())
    }

    async fn list_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|e| e.messages.clone())
            .unwrap_or_default())
    }

    async fn get_summary(&self, thread_id: &ThreadId) -> Result<Option<Summary>> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).and_then(|e| e.summary.clone()))
    }

    async fn upsert_summary(&self, summary: &Summary) -> Result<()> {
        let mut threads = self.threads.write().await;
        threads.entry(summary.thread_id.clone()).or_default().summary = Some(summary.clone());
        Ok(())
    }

    async fn count_messages(&self, thread_id: &ThreadId) -> Result<usize> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).map_or(0, |e| e.messages.len()))
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>> {
        let threads = self.threads.read().await;
        let mut ids: Vec<_> = threads
            .iter()
            .filter(|(_, e)| !e.messages.is_empty())
            .map(|(id, e)| (id.clone(), e.last_activity()))
            .collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(ids.into_iter().map(|(id, _)| id).collect())
    }

    async fn set_approval(&self, message_id: Uuid, approved: bool) -> Result<()> {
        let mut threads = self.threads.write().await;
        let message = threads
            .values_mut()
            .flat_map(|e| e.messages.iter_mut())
            .find(|m| m.id == message_id)
            .ok_or(AgentError::MessageNotFound(message_id))?;
        message.approved = Some(approved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn thread(id: &str) -> ThreadId {
        ThreadId::parse(id).unwrap()
    }

    #[test]
    fn test_thread_id_validation() {
        assert!(ThreadId::parse("thread-1").is_ok());
        assert!(ThreadId::parse("").is_err());
        assert!(ThreadId::parse("   ").is_err());
        assert!(ThreadId::parse("a\nb").is_err());
        assert!(ThreadId::parse("x".repeat(MAX_THREAD_ID_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_append_and_list_recent() {
        let store = MemoryConversationStore::new();
        let t = thread("t1");
        for i in 0..5 {
            store.append(&t, &Message::user(format!("m{i}"))).await.unwrap();
        }

        let recent = store.list_recent(&t, 3).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(store.count_messages(&t).await.unwrap(), 5);
        assert_eq!(store.list_recent(&t, 50).await.unwrap().len(), 5);
        assert!(store.list_recent(&thread("missing"), 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_append_is_sorted() {
        let store = MemoryConversationStore::new();
        let t = thread("t1");
        let late = Message::user("late");
        let mut early = Message::user("early");
        early.created_at = late.created_at - Duration::seconds(5);

        store.append(&t, &late).await.unwrap();
        store.append(&t, &early).await.unwrap();

        let all = store.list_messages(&t).await.unwrap();
        assert_eq!(all[0].content, "early");
        assert_eq!(all[1].content, "late");
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut messages = Vec::new();
        let first = Message::user("first");
        let mut second = Message::assistant("second");
        second.created_at = first.created_at;
        insert_chronological(&mut messages, first);
        insert_chronological(&mut messages, second);
        assert_eq!(messages[1].content, "second");
    }

    #[tokio::test]
    async fn test_summary_upsert_replaces() {
        let store = MemoryConversationStore::new();
        let t = thread("t1");
        assert!(store.get_summary(&t).await.unwrap().is_none());

        store.upsert_summary(&Summary::new(t.clone(), "first", 16)).await.unwrap();
        store.upsert_summary(&Summary::new(t.clone(), "second", 32)).await.unwrap();

        let summary = store.get_summary(&t).await.unwrap().unwrap();
        assert_eq!(summary.text, "second");
        assert_eq!(summary.covered_messages, 32);
    }

    #[tokio::test]
    async fn test_list_threads_most_recent_first() {
        let store = MemoryConversationStore::new();
        let old = Message::user("old");
        let mut new = Message::user("new");
        new.created_at = old.created_at + Duration::seconds(1);

        store.append(&thread("a"), &old).await.unwrap();
        store.append(&thread("b"), &new).await.unwrap();

        assert_eq!(store.list_threads().await.unwrap(), vec![thread("b"), thread("a")]);
    }

    #[tokio::test]
    async fn test_set_approval() {
        let store = MemoryConversationStore::new();
        let t = thread("t1");
        let reply = Message::assistant("hello");
        store.append(&t, &reply).await.unwrap();

        store.set_approval(reply.id, false).await.unwrap();
        assert_eq!(store.list_messages(&t).await.unwrap()[0].approved, Some(false));

        let missing = Uuid::new_v4();
        let err = store.set_approval(missing, true).await.unwrap_err();
        assert!(matches!(err, AgentError::MessageNotFound(id) if id == missing));
    }
}
