//! # threadline-runtime
//!
//! Concrete collaborators for the threadline engine.
//!
//! ## Providers
//!
//! - **OpenAI-compatible** (default): any `/chat/completions` endpoint with native
//!   tool calling. Defaults to Groq; Ollama's `/v1` works too.
//!
//! ## Search
//!
//! - **DuckDuckGo**: Instant Answer API, no key required
//!
//! ## Stores
//!
//! - **JSON files**: one file per thread under a data directory
//!
//! ## Usage
//!
//! ```rust,ignore
//! use threadline_runtime::{OpenAiCompatProvider, JsonFileStore};
//!
//! let provider = Arc::new(OpenAiCompatProvider::from_env()?);
//! let store = Arc::new(JsonFileStore::new("./data/threads"));
//! ```

pub mod duckduckgo;
pub mod file_store;
pub mod openai;

pub use duckduckgo::DuckDuckGoSearch;
pub use file_store::JsonFileStore;
pub use openai::{OpenAiCompatConfig, OpenAiCompatProvider};

// Re-export core types for convenience
pub use threadline_core::{
    Agent, AgentError, ChatService, ConversationStore, LlmProvider, Message, Result, Role,
    ThreadId, Tool, ToolRegistry,
};
