//! threadline HTTP Server
//!
//! Axum-based server exposing blocking, streaming and WebSocket chat turns
//! plus thread history and reply feedback.

mod config;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use threadline_core::{
    AgentBuilder, ChatService, ConversationStore, DateTimeTool, LlmProvider,
    MemoryConversationStore, MemoryManager, ToolRegistry, WebSearchTool,
};
use threadline_runtime::{DuckDuckGoSearch, JsonFileStore, OpenAiCompatProvider};

use crate::config::ServerConfig;
use crate::handlers::{
    chat_handler, chat_stream_handler, chat_ws_handler, feedback, health_check, list_threads,
    thread_history,
};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment first so RUST_LOG from .env applies
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    // Initialize LLM provider
    let provider: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatProvider::from_env()?);
    match provider.health_check().await {
        Ok(true) => tracing::info!("✓ Model endpoint reachable (model: {})", config.model),
        Ok(false) | Err(_) => {
            tracing::warn!("⚠ Model endpoint not reachable - turns will fail");
            tracing::warn!("  Check LLM_BASE_URL and LLM_API_KEY (or GROQ_API_KEY)");
        }
    }

    // Initialize tools
    let mut tools = ToolRegistry::new();
    tools.register(DateTimeTool);
    tools.register(WebSearchTool::new(Arc::new(DuckDuckGoSearch::new()?)));

    tracing::info!("Registered {} tools:", tools.len());
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }

    // Conversation store
    let store: Arc<dyn ConversationStore> = match &config.data_dir {
        Some(dir) => {
            tracing::info!("Persisting threads under {}", dir.display());
            Arc::new(JsonFileStore::new(dir))
        }
        None => {
            tracing::warn!("⚠ DATA_DIR not set - threads live in memory only");
            Arc::new(MemoryConversationStore::new())
        }
    };

    let agent = AgentBuilder::new()
        .provider(provider.clone())
        .tools(tools)
        .config(config.agent_config())
        .build()?;
    let memory = MemoryManager::new(store.clone(), provider.clone(), config.memory_config());

    let state = AppState {
        chat: ChatService::new(store, agent, memory),
        provider,
    };

    let app = router(state, cors_layer(config.cors_origin.as_deref())?);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 threadline server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                   - Health check");
    tracing::info!("  POST /chat/{{thread_id}}         - Send message");
    tracing::info!("  POST /chat/stream/{{thread_id}}  - Send message, streamed reply");
    tracing::info!("  GET  /chat/ws                  - WebSocket streaming");
    tracing::info!("  GET  /chat/threads             - List threads");
    tracing::info!("  GET  /chat/history/{{thread_id}} - Thread history");
    tracing::info!("  POST /chat/feedback            - Approve or reject a reply");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}

fn cors_layer(origin: Option<&str>) -> anyhow::Result<CorsLayer> {
    let allow_origin = match origin {
        Some(origin) => AllowOrigin::exact(HeaderValue::from_str(origin)?),
        None => AllowOrigin::from(Any),
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any))
}

fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/chat/threads", get(list_threads))
        .route("/chat/history/{thread_id}", get(thread_history))
        .route("/chat/feedback", post(feedback))
        .route("/chat/ws", get(chat_ws_handler))
        .route("/chat/stream/{thread_id}", post(chat_stream_handler))
        .route("/chat/{thread_id}", post(chat_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use threadline_core::provider::{
        Completion, CompletionStream, GenerationOptions, StreamChunk,
    };
    use threadline_core::tool::ToolSchema;
    use threadline_core::{Message, Result};
    use tower::ServiceExt;

    /// Replies "echo: <last user message>"
    struct EchoProvider;

    fn echo(messages: &[Message]) -> String {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        format!("echo: {last}")
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        async fn complete(
            &self,
            messages: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<Completion> {
            Ok(Completion::text(echo(messages)))
        }

        async fn complete_stream(
            &self,
            messages: &[Message],
            _tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<CompletionStream> {
            let text = echo(messages);
            let chunks: Vec<Result<StreamChunk>> = text
                .split_inclusive(' ')
                .map(|w| Ok(StreamChunk::delta(w)))
                .chain(std::iter::once(Ok(StreamChunk {
                    done: true,
                    ..Default::default()
                })))
                .collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn app() -> Router {
        let provider: Arc<dyn LlmProvider> = Arc::new(EchoProvider);
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());
        let agent = AgentBuilder::new()
            .provider(provider.clone())
            .tool(DateTimeTool)
            .build()
            .unwrap();
        let memory = MemoryManager::new(
            store.clone(),
            provider.clone(),
            ServerConfig::default().memory_config(),
        );
        let state = AppState {
            chat: ChatService::new(store, agent, memory),
            provider,
        };
        router(state, cors_layer(None).unwrap())
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model_connected"], true);
    }

    #[tokio::test]
    async fn test_chat_then_history() {
        let app = app();

        let response = app
            .clone()
            .oneshot(post_json("/chat/t-1", &serde_json::json!({"message": "hello"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["thread_id"], "t-1");
        assert_eq!(body["reply"], "echo: hello");

        let response = app
            .clone()
            .oneshot(Request::get("/chat/history/t-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let history = json_body(response).await;
        assert_eq!(history.as_array().unwrap().len(), 2);
        assert_eq!(history[1]["role"], "assistant");

        let response = app
            .oneshot(Request::get("/chat/threads").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(response).await, serde_json::json!(["t-1"]));
    }

    #[tokio::test]
    async fn test_stream_body_matches_reply() {
        let response = app()
            .oneshot(post_json(
                "/chat/stream/t-2",
                &serde_json::json!({"message": "stream me"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; charset=utf-8"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"echo: stream me");
    }

    #[tokio::test]
    async fn test_empty_message_is_bad_request() {
        let response = app()
            .oneshot(post_json("/chat/t-3", &serde_json::json!({"message": "  "})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_feedback_hides_rejected_reply() {
        let app = app();
        app.clone()
            .oneshot(post_json("/chat/t-4", &serde_json::json!({"message": "hi"})))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(Request::get("/chat/history/t-4").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let reply_id = json_body(response).await[1]["id"].clone();

        let response = app
            .clone()
            .oneshot(post_json(
                "/chat/feedback",
                &serde_json::json!({"message_id": reply_id, "approved": false}),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, serde_json::json!({"status": "ok"}));

        let response = app
            .oneshot(Request::get("/chat/history/t-4").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_feedback_unknown_message_is_not_found() {
        let response = app()
            .oneshot(post_json(
                "/chat/feedback",
                &serde_json::json!({"message_id": uuid::Uuid::new_v4(), "approved": true}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["code"], "MESSAGE_NOT_FOUND");
    }
}
