//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Upstream model call failed or timed out
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Tool not found in registry
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Tool arguments did not match the declared schema
    #[error("Invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Maximum model calls reached in one turn
    #[error("Loop bound ({0} model calls) exceeded")]
    LoopBoundExceeded(usize),

    /// Conversation store read or write failed
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Feedback targeted a message that does not exist
    #[error("Message not found: {0}")]
    MessageNotFound(uuid::Uuid),

    /// Caller input rejected before the turn started
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Thread identifier rejected by the store
    #[error("Invalid thread id: {0}")]
    InvalidThreadId(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::ModelUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::UnknownTool(name) => format!("The tool '{name}' is not available."),
            Self::InvalidToolArguments(msg) => format!("Invalid tool input: {msg}"),
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::LoopBoundExceeded(_) => {
                "The request took too long to process. Please try a simpler query.".into()
            }
            Self::StoreUnavailable(_) => {
                "Your message could not be saved. Please try again.".into()
            }
            Self::MessageNotFound(id) => format!("Message {id} does not exist."),
            Self::InvalidInput(msg) => format!("Invalid input: {msg}"),
            Self::InvalidThreadId(id) => format!("'{id}' is not a valid thread id."),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_upstream_detail() {
        let err = AgentError::ModelUnavailable("502 from upstream at 10.0.0.4".into());
        assert!(!err.user_message().contains("10.0.0.4"));
    }
}
