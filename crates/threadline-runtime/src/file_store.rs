//! JSON file conversation store
//!
//! One `<thread_id>.json` file per thread holding its messages and summary.
//! Writes go through a temp file and a rename so a crash never leaves a
//! half-written thread behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use threadline_core::error::{AgentError, Result};
use threadline_core::message::Message;
use threadline_core::store::{ConversationStore, Summary, ThreadId, insert_chronological, tail};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ThreadFile {
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<Summary>,
}

/// File-backed store
pub struct JsonFileStore {
    base_path: PathBuf,
    // Serializes read-modify-write cycles across threads in this process.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn thread_path(&self, thread_id: &ThreadId) -> Result<PathBuf> {
        validate_file_name(thread_id.as_str())?;
        Ok(self.base_path.join(format!("{thread_id}.json")))
    }

    async fn load(&self, thread_id: &ThreadId) -> Result<ThreadFile> {
        let path = self.thread_path(thread_id)?;
        read_thread(&path).await.map(Option::unwrap_or_default)
    }

    async fn save(&self, thread_id: &ThreadId, thread: &ThreadFile) -> Result<()> {
        let path = self.thread_path(thread_id)?;
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(store_err)?;

        let content = serde_json::to_string_pretty(thread)?;
        let tmp_path = self
            .base_path
            .join(format!(".{thread_id}.{}.tmp", Uuid::new_v4().simple()));

        let write = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(store_err(e));
        }
        Ok(())
    }

    /// Load a thread found by a directory scan; unreadable files are skipped
    async fn load_scanned(&self, thread_id: &ThreadId) -> Option<ThreadFile> {
        match self.load(thread_id).await {
            Ok(thread) => Some(thread),
            Err(e) => {
                tracing::warn!(thread = %thread_id, error = %e, "Skipping unreadable thread file");
                None
            }
        }
    }

    /// Ids of every thread file on disk
    async fn thread_ids(&self) -> Result<Vec<ThreadId>> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_err(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(store_err)? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = ThreadId::parse(id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn append(&self, thread_id: &ThreadId, message: &Message) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut thread = self.load(thread_id).await?;
        insert_chronological(&mut thread.messages, message.clone());
        self.save(thread_id, &thread).await
    }

    async fn list_recent(&self, thread_id: &ThreadId, limit: usize) -> Result<Vec<Message>> {
        let thread = self.load(thread_id).await?;
        Ok(tail(&thread.messages, limit))
    }

    async fn list_messages(&self, thread_id: &ThreadId) -> Result<Vec<Message>> {
        Ok(self.load(thread_id).await?.messages)
    }

    async fn get_summary(&self, thread_id: &ThreadId) -> Result<Option<Summary>> {
        Ok(self.load(thread_id).await?.summary)
    }

    async fn upsert_summary(&self, summary: &Summary) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut thread = self.load(&summary.thread_id).await?;
        thread.summary = Some(summary.clone());
        self.save(&summary.thread_id, &thread).await
    }

    async fn count_messages(&self, thread_id: &ThreadId) -> Result<usize> {
        Ok(self.load(thread_id).await?.messages.len())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>> {
        let mut threads: Vec<(Option<DateTime<Utc>>, ThreadId)> = Vec::new();
        for id in self.thread_ids().await? {
            let Some(thread) = self.load_scanned(&id).await else {
                continue;
            };
            threads.push((thread.messages.last().map(|m| m.created_at), id));
        }
        threads.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(threads.into_iter().map(|(_, id)| id).collect())
    }

    async fn set_approval(&self, message_id: Uuid, approved: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        for id in self.thread_ids().await? {
            let Some(mut thread) = self.load_scanned(&id).await else {
                continue;
            };
            if let Some(message) = thread.messages.iter_mut().find(|m| m.id == message_id) {
                message.approved = Some(approved);
                return self.save(&id, &thread).await;
            }
        }
        Err(AgentError::MessageNotFound(message_id))
    }
}

async fn read_thread(path: &Path) -> Result<Option<ThreadFile>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(store_err(e)),
    }
}

/// Thread ids double as file names: no separators, no traversal.
fn validate_file_name(id: &str) -> Result<()> {
    if id.contains('/') || id.contains('\\') || id.contains("..") || id.starts_with('.') {
        return Err(AgentError::InvalidThreadId(id.to_string()));
    }
    Ok(())
}

fn store_err(err: std::io::Error) -> AgentError {
    AgentError::StoreUnavailable(err.to_string())
}
