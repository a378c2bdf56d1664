//! OpenAI-compatible LLM Provider
//!
//! Implementation of `LlmProvider` for any `/chat/completions` endpoint that
//! speaks the OpenAI wire format with native tool calling (Groq, OpenAI,
//! Ollama's `/v1`, vLLM, ...).

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use threadline_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, CompletionStream, FinishReason, GenerationOptions, LlmProvider, StreamChunk,
        TokenUsage,
    },
    tool::{ToolCall, ToolSchema},
};

const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiCompatConfig {
    /// API root, without the `/chat/completions` suffix
    pub base_url: String,

    /// Bearer token; local servers usually need none
    pub api_key: Option<String>,

    /// Connect timeout for the HTTP client
    pub connect_timeout: Duration,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl OpenAiCompatConfig {
    pub fn from_env() -> Self {
        let base_url = std::env::var("LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("GROQ_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());

        Self {
            base_url,
            api_key,
            ..Default::default()
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }
}

/// OpenAI-compatible chat completions provider
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatProvider {
    /// Create from configuration
    pub fn from_config(config: OpenAiCompatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OpenAiCompatConfig::from_env())
    }

    pub const fn config(&self) -> &OpenAiCompatConfig {
        &self.config
    }

    fn build_request<'a>(
        messages: &'a [Message],
        tools: &[ToolSchema],
        options: &'a GenerationOptions,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &options.model,
            messages: messages.iter().map(WireMessage::from_message).collect(),
            tools: tools.iter().map(wire_tool).collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            stop: (!options.stop_sequences.is_empty()).then_some(options.stop_sequences.as_slice()),
            stream,
        }
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .post(self.config.endpoint("chat/completions"))
            .json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(unavailable)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body, "Chat completion rejected");
            return Err(AgentError::ModelUnavailable(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn health_check(&self) -> Result<bool> {
        let mut builder = self.client.get(self.config.endpoint("models"));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!("Provider health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let request = Self::build_request(messages, tools, options, false);
        let response: ChatResponse = self
            .send(&request)
            .await?
            .json()
            .await
            .map_err(unavailable)?;

        response.into_completion(&options.model)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<CompletionStream> {
        let request = Self::build_request(messages, tools, options, true);
        let response = self.send(&request).await?;
        let mut events = response.bytes_stream().eventsource();

        Ok(Box::pin(async_stream::stream! {
            let mut calls = ToolCallAccumulator::default();
            let mut usage: Option<TokenUsage> = None;

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(AgentError::ModelUnavailable(format!("SSE stream error: {e}")));
                        return;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }

                let chunk: ChunkResponse = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(AgentError::ModelUnavailable(format!("SSE parsing error: {e}")));
                        return;
                    }
                };
                if let Some(u) = chunk.usage {
                    usage = Some(u.into());
                }

                for choice in chunk.choices {
                    for delta in choice.delta.tool_calls.unwrap_or_default() {
                        calls.push(delta);
                    }
                    if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                        yield Ok(StreamChunk::delta(text));
                    }
                }
            }

            yield Ok(StreamChunk {
                tool_calls: calls.finish(),
                done: true,
                usage,
                ..Default::default()
            });
        }))
    }
}

fn unavailable(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::ModelUnavailable("request timed out".into())
    } else {
        AgentError::ModelUnavailable(err.to_string())
    }
}

fn wire_tool(schema: &ToolSchema) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": schema.name,
            "description": schema.description,
            "parameters": schema.to_json_schema(),
        }
    })
}

/// Arguments arrive as a JSON-encoded string. Unparseable arguments become an
/// empty map so validation reports the missing fields back to the model.
fn parse_arguments(name: &str, raw: &str) -> HashMap<String, Value> {
    if raw.trim().is_empty() {
        return HashMap::new();
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(tool = name, error = %e, "Discarding malformed tool arguments");
        HashMap::new()
    })
}

fn finish_reason(raw: Option<&str>) -> Option<FinishReason> {
    raw.map(|r| match r {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        "stop" => FinishReason::Stop,
        _ => FinishReason::Error,
    })
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn from_message(message: &Message) -> Self {
        match message.role {
            Role::System => Self::text("system", &message.content),
            Role::User => Self::text("user", &message.content),
            Role::Assistant if message.tool_calls.is_empty() => {
                Self::text("assistant", &message.content)
            }
            Role::Assistant => Self {
                role: "assistant",
                content: Some(message.content.clone()).filter(|c| !c.is_empty()),
                tool_calls: Some(message.tool_calls.iter().map(WireToolCall::from_call).collect()),
                tool_call_id: None,
            },
            // A tool result without a call id cannot be paired; send it as plain context.
            Role::Tool => match message.tool_call_id() {
                Some(id) => Self {
                    role: "tool",
                    content: Some(message.content.clone()),
                    tool_calls: None,
                    tool_call_id: Some(id.to_string()),
                },
                None => Self::text("user", &message.content),
            },
        }
    }

    fn text(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

fn function_kind() -> String {
    "function".into()
}

impl WireToolCall {
    fn from_call(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone().unwrap_or_default(),
            kind: function_kind(),
            function: WireFunction {
                name: call.name.clone(),
                arguments: serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".into()),
            },
        }
    }

    fn into_call(self) -> ToolCall {
        let arguments = parse_arguments(&self.function.name, &self.function.arguments);
        let call = ToolCall::new(self.function.name, arguments);
        if self.id.is_empty() { call } else { call.with_id(self.id) }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

impl ChatResponse {
    fn into_completion(self, requested_model: &str) -> Result<Completion> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::ModelUnavailable("response had no choices".into()))?;

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(WireToolCall::into_call)
                .collect(),
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            usage: self.usage.map(Into::into),
            finish_reason: finish_reason(choice.finish_reason.as_deref()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<DeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct DeltaFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles tool calls that arrive split across stream deltas, keyed by index
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    fn push(&mut self, delta: DeltaToolCall) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            entry.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                entry.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                WireToolCall {
                    id: c.id,
                    kind: function_kind(),
                    function: WireFunction {
                        name: c.name,
                        arguments: c.arguments,
                    },
                }
                .into_call()
            })
            .collect()
    }
}
