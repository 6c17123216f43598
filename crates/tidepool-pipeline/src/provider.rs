//! Model-provider abstraction.
//!
//! A provider turns a step request into a stream of low-level events
//! (text deltas, tool-call requests, a finish marker) and answers the
//! one-shot structured-generation call the repair unit issues. Concrete
//! providers live outside this workspace.

use futures::stream::BoxStream;
use serde_json::Value;
use tidepool_core::error::{PipelineError, SchemaViolation};
use tidepool_core::{CapabilityDescriptor, FinishReason, Message, Usage};

/// Tool-choice mode for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// The model decides whether to call tools.
    #[default]
    Auto,
    /// No further tools this step.
    None,
}

/// Per-model/provider configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub id: String,
    /// Whether tool calls within one step may dispatch concurrently.
    /// Per-provider flag, not a default.
    pub parallel_tool_calls: bool,
    /// Attempt budget for transient provider errors.
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: "tidepool-default".to_string(),
            parallel_tool_calls: false,
            max_retries: 10,
        }
    }
}

/// A tool-call request exactly as the model emitted it. The name is a
/// raw string here; it gets validated against the registry before
/// dispatch.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Low-level events produced by one model step.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TextDelta { delta: String },
    ToolCall(ToolCallRequest),
    Finish { reason: FinishReason, usage: Usage },
}

/// Provider failure classes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Rate limits are never auto-retried.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Worth retrying inside the attempt budget.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Auth failures, unknown models; retrying cannot help.
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited(message) => PipelineError::RateLimited { message },
            ProviderError::Transient(message) | ProviderError::Fatal(message) => {
                PipelineError::Provider { message }
            }
        }
    }
}

/// Everything a provider needs for one inference step.
#[derive(Clone, Copy)]
pub struct StepRequest<'a> {
    pub model: &'a ModelConfig,
    pub transcript: &'a [Message],
    pub tools: &'a [CapabilityDescriptor],
    pub tool_choice: ToolChoice,
}

/// The auxiliary structured-generation request the repair unit issues.
pub struct RepairRequest<'a> {
    pub name: &'a str,
    pub schema: &'a Value,
    pub attempted_input: &'a Value,
    pub violation: &'a SchemaViolation,
}

pub type EventStream = BoxStream<'static, ProviderEvent>;

/// Interface to the model provider.
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run one inference step and stream its events.
    async fn complete_step(&self, request: StepRequest<'_>)
    -> Result<EventStream, ProviderError>;

    /// One secondary structured-generation call asking the model to emit
    /// input conforming to the schema, given the failed attempt.
    async fn repair_call(&self, request: RepairRequest<'_>) -> Result<Value, ProviderError>;
}

/// Start a step, retrying transient failures inside the model's attempt
/// budget. Rate limits and fatal errors surface immediately.
pub async fn complete_step_with_retry(
    provider: &dyn ModelProvider,
    request: StepRequest<'_>,
) -> Result<EventStream, PipelineError> {
    let attempts = request.model.max_retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provider.complete_step(request).await {
            Ok(stream) => return Ok(stream),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(
                    model = %request.model.id,
                    attempt,
                    error = %err,
                    "transient provider error, retrying step"
                );
            }
            Err(err) => return Err(err.into()),
        }
    }
}
