//! # threadline-core
//!
//! Turn orchestration for a tool-using conversational agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ChatService                             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌─────────────────────┐   │
//! │  │ MemoryManager│──▶│    Agent     │──▶│    LlmProvider      │   │
//! │  │ (K + summary)│   │ (turn loop)  │   │    (Strategy)       │   │
//! │  └──────┬───────┘   └──────┬───────┘   └─────────────────────┘   │
//! │         │                  │                                     │
//! │  ┌──────▼────────────┐  ┌──▼───────────┐                         │
//! │  │ ConversationStore │  │ ToolRegistry │                         │
//! │  └───────────────────┘  └──────────────┘                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A turn runs the same state machine whether the reply is delivered at once
//! or streamed, and both paths persist exactly one user and one assistant
//! message per turn.

pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod service;
pub mod store;
pub mod tool;

#[cfg(test)]
mod testing;

pub use error::{AgentError, Result};
pub use memory::{MemoryConfig, MemoryManager};
pub use message::{Message, Role};
pub use provider::{GenerationOptions, LlmProvider, ModelReply};
pub use reasoning::{Agent, AgentBuilder, AgentConfig, TurnEvent, TurnOutcome};
pub use service::{ChatService, FragmentStream};
pub use store::{ConversationStore, MemoryConversationStore, Summary, ThreadId};
pub use tool::{
    DateTimeTool, SearchBackend, SearchHit, Tool, ToolCall, ToolRegistry, ToolResult,
    WebSearchTool,
};
