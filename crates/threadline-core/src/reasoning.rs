//! Reasoning Loop
//!
//! Drives one user turn: ask the model, run any tools it requests, feed the
//! results back, repeat until it answers. Implemented as an explicit state
//! machine so the blocking and streaming paths share every transition.
//!
//! ```text
//!   AwaitingModel ──FinalAnswer──▶ Done
//!        ▲   │
//!        │   └──ToolCalls──▶ ExecutingTools
//!        └────all resolved──────┘
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};
use crate::provider::{Completion, CompletionStream, GenerationOptions, LlmProvider, ModelReply};
use crate::tool::{ToolCall, ToolRegistry, ToolResult, ToolSchema};

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Persona prepended to every model call (never persisted)
    pub system_prompt: String,

    /// Maximum model calls per turn
    pub max_iterations: usize,

    /// Generation options
    pub generation: GenerationOptions,

    /// Upper bound on each model call, and on each fragment when streaming
    pub model_timeout: Duration,

    /// Upper bound on each tool call
    pub tool_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 6,
            generation: GenerationOptions::default(),
            model_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(20),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r"You are a helpful, friendly AI assistant.

Use the available tools when a question needs the current date or time,
or information that may have changed recently. After receiving tool results,
synthesize them into a helpful response. If you can answer directly without
tools, do so. Be concise and accurate.";

/// Reply persisted when a turn runs out of model calls
pub const LOOP_BOUND_NOTICE: &str =
    "I wasn't able to finish working on that request. Please try rephrasing it or asking something simpler.";

/// Placed between text produced by separate model calls of one turn
const SEGMENT_SEPARATOR: &str = "\n\n";

/// Turn controller states
#[derive(Clone, Debug, PartialEq)]
pub enum TurnState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Done(String),
}

/// Result of a completed turn
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// Final assistant text, the only thing persisted
    pub text: String,

    /// Working context as it stood at the end of the turn (never persisted)
    pub transcript: Vec<Message>,

    /// Number of model calls made
    pub model_calls: usize,

    /// Number of tool calls executed
    pub tool_calls: usize,

    /// Whether the turn ended on the loop bound
    pub loop_bound_hit: bool,
}

/// Item of a streaming turn
#[derive(Clone, Debug)]
pub enum TurnEvent {
    /// Text fragment for the caller
    Fragment(String),

    /// Terminal event; its text equals the concatenated fragments
    Finished(TurnOutcome),
}

/// Stream type for streaming turns
pub type TurnStream = Pin<Box<dyn Stream<Item = Result<TurnEvent>> + Send>>;

/// Per-turn working state shared by both delivery modes
struct Turn {
    context: Vec<Message>,
    reply: String,
    model_calls: usize,
    tool_calls: usize,
    max_iterations: usize,
}

impl Turn {
    fn new(mut context: Vec<Message>, persona: &str, max_iterations: usize) -> Self {
        if context.first().map(|m| m.role) != Some(Role::System) {
            context.insert(0, Message::system(persona));
        }
        Self {
            context,
            reply: String::new(),
            model_calls: 0,
            tool_calls: 0,
            max_iterations,
        }
    }

    fn messages(&self) -> &[Message] {
        &self.context
    }

    /// Count a model call; `false` once the bound is reached
    fn begin_model_call(&mut self) -> bool {
        if self.model_calls >= self.max_iterations {
            return false;
        }
        self.model_calls += 1;
        true
    }

    /// Fold a model response into the turn and pick the next state
    fn absorb(&mut self, completion: &Completion) -> TurnState {
        let separator = self.separator_before(&completion.content);
        self.reply.push_str(separator);
        self.reply.push_str(&completion.content);

        match completion.reply() {
            ModelReply::FinalAnswer(_) => TurnState::Done(self.reply.clone()),
            ModelReply::ToolCalls(calls) => {
                let calls: Vec<ToolCall> = calls
                    .into_iter()
                    .map(|mut call| {
                        if call.id.is_none() {
                            call.id = Some(uuid::Uuid::new_v4().to_string());
                        }
                        call
                    })
                    .collect();
                self.context.push(Message::assistant_tool_calls(
                    completion.content.clone(),
                    calls.clone(),
                ));
                TurnState::ExecutingTools(calls)
            }
        }
    }

    fn fold_result(&mut self, result: &ToolResult) {
        self.tool_calls += 1;
        self.context
            .push(Message::tool(result.to_context_text(), result.id.clone()));
    }

    /// Separator owed before `next` is appended to the reply
    fn separator_before(&self, next: &str) -> &'static str {
        if self.reply.is_empty() || next.is_empty() {
            ""
        } else {
            SEGMENT_SEPARATOR
        }
    }

    /// Fragment appended to the reply when the loop bound is hit
    fn bound_notice(&self) -> String {
        format!("{}{LOOP_BOUND_NOTICE}", self.separator_before(LOOP_BOUND_NOTICE))
    }

    fn finish(self, text: String, loop_bound_hit: bool) -> TurnOutcome {
        TurnOutcome {
            text,
            transcript: self.context,
            model_calls: self.model_calls,
            tool_calls: self.tool_calls,
            loop_bound_hit,
        }
    }

    fn finish_at_bound(mut self) -> TurnOutcome {
        tracing::warn!(
            error = %AgentError::LoopBoundExceeded(self.max_iterations),
            "Turn ended without a final answer"
        );
        let notice = self.bound_notice();
        self.reply.push_str(&notice);
        let text = std::mem::take(&mut self.reply);
        self.finish(text, true)
    }
}

/// The turn controller
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    tool_schemas: Arc<[ToolSchema]>,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        let tool_schemas = tools.schemas().into();
        Self {
            provider,
            tools,
            tool_schemas,
            config,
        }
    }

    /// Run one turn to completion
    ///
    /// `context` is the memory manager's output: optional summary note, recent
    /// history, new user message last.
    #[tracing::instrument(name = "run_turn", skip_all, fields(context_len = context.len()))]
    pub async fn run_turn(&self, context: Vec<Message>) -> Result<TurnOutcome> {
        let mut turn = Turn::new(context, &self.config.system_prompt, self.config.max_iterations);
        let mut state = TurnState::AwaitingModel;

        loop {
            state = match state {
                TurnState::AwaitingModel => {
                    if !turn.begin_model_call() {
                        return Ok(turn.finish_at_bound());
                    }
                    let completion = self.call_model(turn.messages()).await?;
                    turn.absorb(&completion)
                }
                TurnState::ExecutingTools(calls) => {
                    for call in &calls {
                        let result = self.execute_tool(call).await;
                        turn.fold_result(&result);
                    }
                    TurnState::AwaitingModel
                }
                TurnState::Done(text) => {
                    tracing::info!(
                        model_calls = turn.model_calls,
                        tool_calls = turn.tool_calls,
                        "Turn complete"
                    );
                    return Ok(turn.finish(text, false));
                }
            };
        }
    }

    /// Run one turn, yielding text fragments as the model produces them
    ///
    /// The stream ends with `TurnEvent::Finished`, or with a single error.
    /// Dropping it stops the turn at the next suspension point.
    pub fn run_turn_stream(&self, context: Vec<Message>) -> TurnStream {
        let agent = self.clone();

        Box::pin(async_stream::stream! {
            let mut turn = Turn::new(context, &agent.config.system_prompt, agent.config.max_iterations);
            let mut state = TurnState::AwaitingModel;

            loop {
                match state {
                    TurnState::AwaitingModel => {
                        if !turn.begin_model_call() {
                            yield Ok(TurnEvent::Fragment(turn.bound_notice()));
                            yield Ok(TurnEvent::Finished(turn.finish_at_bound()));
                            break;
                        }

                        let mut upstream = match agent.open_model_stream(turn.messages()).await {
                            Ok(upstream) => upstream,
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        };

                        let mut completion = Completion::default();
                        let mut failure = None;
                        loop {
                            match agent.next_chunk(&mut upstream).await {
                                Ok(Some(chunk)) => {
                                    completion.tool_calls.extend(chunk.tool_calls);
                                    if !chunk.delta.is_empty() {
                                        if completion.content.is_empty() {
                                            let separator = turn.separator_before(&chunk.delta);
                                            if !separator.is_empty() {
                                                yield Ok(TurnEvent::Fragment(separator.to_string()));
                                            }
                                        }
                                        completion.content.push_str(&chunk.delta);
                                        yield Ok(TurnEvent::Fragment(chunk.delta));
                                    }
                                    if chunk.done {
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }
                        if let Some(e) = failure {
                            yield Err(e);
                            break;
                        }

                        state = turn.absorb(&completion);
                    }
                    TurnState::ExecutingTools(calls) => {
                        for call in &calls {
                            let result = agent.execute_tool(call).await;
                            turn.fold_result(&result);
                        }
                        state = TurnState::AwaitingModel;
                    }
                    TurnState::Done(text) => {
                        tracing::info!(
                            model_calls = turn.model_calls,
                            tool_calls = turn.tool_calls,
                            "Streaming turn complete"
                        );
                        yield Ok(TurnEvent::Finished(turn.finish(text, false)));
                        break;
                    }
                }
            }
        })
    }

    async fn call_model(&self, messages: &[Message]) -> Result<Completion> {
        tracing::debug!(messages = messages.len(), provider = self.provider.name(), "Calling model");

        let completion = tokio::time::timeout(
            self.config.model_timeout,
            self.provider
                .complete(messages, &self.tool_schemas, &self.config.generation),
        )
        .await
        .map_err(|_| AgentError::ModelUnavailable("model call timed out".into()))?
        .map_err(model_unavailable)?;

        if let Some(usage) = &completion.usage {
            tracing::debug!(total_tokens = usage.total_tokens, "Model usage");
        }
        Ok(completion)
    }

    async fn open_model_stream(&self, messages: &[Message]) -> Result<CompletionStream> {
        tracing::debug!(messages = messages.len(), provider = self.provider.name(), "Opening model stream");

        tokio::time::timeout(
            self.config.model_timeout,
            self.provider
                .complete_stream(messages, &self.tool_schemas, &self.config.generation),
        )
        .await
        .map_err(|_| AgentError::ModelUnavailable("model call timed out".into()))?
        .map_err(model_unavailable)
    }

    async fn next_chunk(
        &self,
        upstream: &mut CompletionStream,
    ) -> Result<Option<crate::provider::StreamChunk>> {
        tokio::time::timeout(self.config.model_timeout, upstream.next())
            .await
            .map_err(|_| AgentError::ModelUnavailable("model stream stalled".into()))?
            .transpose()
            .map_err(model_unavailable)
    }

    /// Execute a tool call; failures become a failed result, never an error
    async fn execute_tool(&self, call: &ToolCall) -> ToolResult {
        tracing::debug!(tool = %call.name, "Executing tool");

        let outcome = tokio::time::timeout(self.config.tool_timeout, self.tools.invoke(call))
            .await
            .unwrap_or_else(|_| {
                Err(AgentError::ToolExecution(format!(
                    "'{}' did not respond within {}s",
                    call.name,
                    self.config.tool_timeout.as_secs()
                )))
            });

        let result = match outcome {
            Ok(output) => ToolResult::success(&call.name, output),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool call failed");
                ToolResult::failure(&call.name, e.to_string())
            }
        };
        result.with_id(call.id.clone())
    }

    /// Get configuration
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }
}

fn model_unavailable(err: AgentError) -> AgentError {
    match err {
        AgentError::ModelUnavailable(_) => err,
        other => AgentError::ModelUnavailable(other.to_string()),
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: ToolRegistry::new(),
            config: AgentConfig::default(),
        }
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn tool<T: crate::tool::Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.register(tool);
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;

        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        Ok(Agent::new(provider, Arc::new(self.tools), self.config))
    }
}
