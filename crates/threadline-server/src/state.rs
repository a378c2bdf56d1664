//! Application State

use std::sync::Arc;

use threadline_core::{ChatService, LlmProvider};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Turn entry point: memory, tool loop and persistence
    pub chat: ChatService,

    /// Chat model provider, kept for health checks
    pub provider: Arc<dyn LlmProvider>,
}
