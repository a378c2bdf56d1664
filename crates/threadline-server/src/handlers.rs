//! HTTP/WebSocket Handlers

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use threadline_core::{AgentError, Message, ThreadId};

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub model_connected: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub thread_id: ThreadId,
    pub reply: String,
}

#[derive(Debug, Deserialize)]
pub struct SocketRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub message_id: Uuid,
    pub approved: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: &AgentError) -> ApiError {
    let (status, code) = match err {
        AgentError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
        AgentError::InvalidThreadId(_) => (StatusCode::BAD_REQUEST, "INVALID_THREAD_ID"),
        AgentError::MessageNotFound(_) => (StatusCode::NOT_FOUND, "MESSAGE_NOT_FOUND"),
        AgentError::ModelUnavailable(_) => (StatusCode::BAD_GATEWAY, "MODEL_UNAVAILABLE"),
        AgentError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR"),
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.user_message(),
            code: code.into(),
        }),
    )
}

fn parse_thread(raw: String) -> Result<ThreadId, ApiError> {
    ThreadId::parse(raw).map_err(|e| api_error(&e))
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let model_connected = state.provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        model_connected,
    })
}

/// Blocking turn: the reply arrives in one response
pub async fn chat_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let thread_id = parse_thread(thread_id)?;
    let reply = state
        .chat
        .handle_turn(&thread_id, &payload.message)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(ChatResponse { thread_id, reply }))
}

/// Streaming turn over a chunked `text/plain` body
///
/// Errors before the first fragment map to a status code. A failure after
/// that aborts the body, since the status line is already sent.
pub async fn chat_stream_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let thread_id = parse_thread(thread_id)?;
    let fragments = state
        .chat
        .handle_turn_streaming(&thread_id, &payload.message)
        .await
        .map_err(|e| api_error(&e))?;

    let body = Body::from_stream(fragments.map(|fragment| {
        fragment
            .map(Bytes::from)
            .inspect_err(|e| tracing::error!("Stream aborted: {}", e))
    }));

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// WebSocket streaming chat
pub async fn chat_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        let request: SocketRequest = match serde_json::from_str(&msg) {
            Ok(r) => r,
            Err(e) => {
                if send_frame(&mut sender, error_frame(&e.to_string())).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if stream_turn(&mut sender, &state, request).await.is_err() {
            return;
        }
    }
}

/// Send `chunk` frames then `done`, or a single `error` frame.
/// Fails only when the socket is gone.
async fn stream_turn(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    state: &AppState,
    request: SocketRequest,
) -> Result<(), axum::Error> {
    let thread_id = match request.thread_id.map_or_else(|| Ok(ThreadId::new()), ThreadId::parse) {
        Ok(id) => id,
        Err(e) => return send_frame(sender, error_frame(&e.user_message())).await,
    };

    let mut fragments = match state
        .chat
        .handle_turn_streaming(&thread_id, &request.message)
        .await
    {
        Ok(fragments) => fragments,
        Err(e) => return send_frame(sender, error_frame(&e.user_message())).await,
    };

    while let Some(fragment) = fragments.next().await {
        match fragment {
            Ok(content) => {
                let chunk = serde_json::json!({"type": "chunk", "content": content});
                send_frame(sender, chunk).await?;
            }
            Err(e) => return send_frame(sender, error_frame(&e.user_message())).await,
        }
    }

    send_frame(sender, serde_json::json!({"type": "done", "thread_id": thread_id})).await
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    frame: serde_json::Value,
) -> Result<(), axum::Error> {
    sender.send(WsMessage::Text(frame.to_string().into())).await
}

fn error_frame(message: &str) -> serde_json::Value {
    serde_json::json!({"type": "error", "error": message})
}

/// Known thread ids, most recently active first
pub async fn list_threads(State(state): State<AppState>) -> Result<Json<Vec<ThreadId>>, ApiError> {
    state
        .chat
        .list_threads()
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Visible history of a thread
pub async fn thread_history(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let thread_id = parse_thread(thread_id)?;
    state
        .chat
        .history(&thread_id)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Approve or reject a persisted reply
pub async fn feedback(
    State(state): State<AppState>,
    Json(payload): Json<FeedbackRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .chat
        .record_feedback(payload.message_id, payload.approved)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(StatusResponse { status: "ok" }))
}
