//! The step loop controller.
//!
//! Drives bounded rounds of model inference interleaved with tool
//! dispatch. Stop conditions, checked in order: step budget exhausted,
//! a natural finish reason, or a step that issued zero tool calls.
//!
//! Tool calls are schema-validated before dispatch; invalid calls get
//! one repair attempt and are otherwise dropped, never fatal. Only
//! unrecoverable failures (persistence gone, fatal provider errors)
//! terminate the loop; everything else degrades to structured error
//! content the model sees on its next step.

use crate::dispatch::{CallResult, PreparedCall, dispatch_calls};
use crate::provider::{
    ModelConfig, ModelProvider, ProviderEvent, StepRequest, ToolCallRequest, ToolChoice,
    complete_step_with_retry,
};
use crate::repair::{RepairUnit, RepairVerdict};
use std::sync::Arc;
use std::time::Instant;
use tidepool_core::schema::validate_input;
use tidepool_core::{
    CapabilityName, CapabilityRegistry, ConversationId, FinishReason, GenerationEvent, Message,
    MessagePart, PipelineError, Usage,
};
use futures::StreamExt;
use tokio::sync::mpsc;

/// Loop policy.
#[derive(Debug, Clone)]
pub struct StepLoopConfig {
    /// Maximum inference rounds per generation.
    pub max_steps: u32,
    /// After a step that issued tool calls and received results, force
    /// the next step to `ToolChoice::None`. Bounds cost and latency;
    /// applied once results exist, not per step count.
    pub limit_followup_tools: bool,
}

impl Default for StepLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            limit_followup_tools: true,
        }
    }
}

/// What one full generation produced.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Ordered assistant output parts across all steps.
    pub parts: Vec<MessagePart>,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub steps: u32,
    /// Premium capability invocations during the run.
    pub premium_invocations: u32,
}

impl GenerationOutcome {
    pub fn premium_used(&self) -> bool {
        self.premium_invocations > 0
    }
}

/// A terminal failure, carrying everything the completed steps produced
/// before it. The partial output has already streamed to the client and
/// must still be persisted by the caller.
#[derive(Debug)]
pub struct StepFailure {
    pub error: PipelineError,
    pub partial: GenerationOutcome,
}

/// Drives the inference/dispatch rounds of one generation.
pub struct StepLoop {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<CapabilityRegistry>,
    repair: RepairUnit,
    config: StepLoopConfig,
}

/// Everything one consumed provider stream yielded.
struct StepOutput {
    text: String,
    requests: Vec<ToolCallRequest>,
    finish: FinishReason,
    usage: Usage,
}

impl StepLoop {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<CapabilityRegistry>,
        config: StepLoopConfig,
    ) -> Self {
        let repair = RepairUnit::new(provider.clone());
        Self {
            provider,
            registry,
            repair,
            config,
        }
    }

    /// Run the loop over `transcript`, forwarding events to `events`.
    ///
    /// A closed events channel means the client is gone; generation and
    /// the caller's persistence continue regardless. A terminal provider
    /// error returns the output accumulated so far alongside it, since
    /// those parts have already streamed to the client.
    pub async fn run(
        &self,
        conversation_id: ConversationId,
        mut transcript: Vec<Message>,
        model: &ModelConfig,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Result<GenerationOutcome, StepFailure> {
        let tools = self.registry.descriptors();
        let started = Instant::now();

        let mut parts: Vec<MessagePart> = Vec::new();
        let mut usage = Usage::default();
        let mut premium_invocations: u32 = 0;
        let mut finish = FinishReason::Stop;
        let mut force_no_tools = false;
        let mut steps = 0;

        while steps < self.config.max_steps {
            steps += 1;
            let tool_choice = if force_no_tools {
                ToolChoice::None
            } else {
                ToolChoice::Auto
            };

            let request = StepRequest {
                model,
                transcript: &transcript,
                tools: &tools,
                tool_choice,
            };
            let stream = match complete_step_with_retry(self.provider.as_ref(), request).await {
                Ok(stream) => stream,
                Err(error) => {
                    usage.completion_seconds = started.elapsed().as_secs_f64();
                    tracing::warn!(
                        conversation = %conversation_id,
                        step = steps,
                        error = %error,
                        "generation ended on a provider error"
                    );
                    return Err(StepFailure {
                        error,
                        partial: GenerationOutcome {
                            parts,
                            usage,
                            finish_reason: FinishReason::Error,
                            steps: steps - 1,
                            premium_invocations,
                        },
                    });
                }
            };
            let step = consume_step(stream, events).await;
            usage.add(&step.usage);
            finish = step.finish;

            let mut step_parts: Vec<MessagePart> = Vec::new();
            if !step.text.is_empty() {
                step_parts.push(MessagePart::Text { text: step.text });
            }

            // Natural stop wins over dispatch; a stopping model does not
            // get its stray calls executed.
            if step.finish != FinishReason::ToolCalls || step.requests.is_empty() {
                parts.extend(step_parts);
                let _ = events
                    .send(GenerationEvent::StepFinish {
                        step: steps,
                        tool_calls: 0,
                    })
                    .await;
                break;
            }

            let prepared = self.prepare_calls(step.requests, events).await;
            for call in &prepared {
                step_parts.push(MessagePart::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                });
            }

            let results = dispatch_calls(prepared, model.parallel_tool_calls).await;
            let dispatched = results.len();
            for result in results {
                if result.premium {
                    premium_invocations += 1;
                }
                let _ = events
                    .send(GenerationEvent::ToolResult {
                        id: result.id.clone(),
                        name: result.name.clone(),
                        outcome: result.outcome.clone(),
                    })
                    .await;
                step_parts.push(result_part(result));
            }

            parts.extend(step_parts.clone());
            let _ = events
                .send(GenerationEvent::StepFinish {
                    step: steps,
                    tool_calls: dispatched,
                })
                .await;

            // The transcript is the only state crossing step boundaries.
            transcript.push(Message::assistant(conversation_id, step_parts, step.usage));

            if self.config.limit_followup_tools && dispatched > 0 {
                force_no_tools = true;
            }
        }

        usage.completion_seconds = started.elapsed().as_secs_f64();
        tracing::debug!(
            conversation = %conversation_id,
            steps,
            total_tokens = usage.total_tokens,
            reason = ?finish,
            "generation finished"
        );

        Ok(GenerationOutcome {
            parts,
            usage,
            finish_reason: finish,
            steps,
            premium_invocations,
        })
    }

    /// Validate (and repair at most once) the step's raw tool calls.
    /// Unknown names and unrepairable inputs are dropped; sibling calls
    /// are unaffected.
    async fn prepare_calls(
        &self,
        requests: Vec<ToolCallRequest>,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Vec<PreparedCall> {
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            let Ok(name) = CapabilityName::parse(&request.name) else {
                tracing::warn!(name = %request.name, "dropping call with malformed tool name");
                continue;
            };
            let Some(capability) = self.registry.get(&name) else {
                tracing::warn!(capability = %name, "dropping call to unknown capability");
                continue;
            };

            let input = match validate_input(capability.input_schema(), &request.input) {
                Ok(()) => request.input,
                Err(violation) => {
                    match self
                        .repair
                        .repair(&name, capability.input_schema(), &request.input, &violation)
                        .await
                    {
                        RepairVerdict::Corrected(corrected) => corrected,
                        RepairVerdict::Unrepairable => continue,
                    }
                }
            };

            let _ = events
                .send(GenerationEvent::ToolCallStart {
                    id: request.id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                })
                .await;
            prepared.push(PreparedCall {
                id: request.id,
                name,
                input,
                capability,
            });
        }
        prepared
    }
}

/// Drain one provider stream, forwarding text deltas as they arrive.
async fn consume_step(
    mut stream: crate::provider::EventStream,
    events: &mpsc::Sender<GenerationEvent>,
) -> StepOutput {
    let mut output = StepOutput {
        text: String::new(),
        requests: Vec::new(),
        finish: FinishReason::Stop,
        usage: Usage::default(),
    };
    while let Some(event) = stream.next().await {
        match event {
            ProviderEvent::TextDelta { delta } => {
                output.text.push_str(&delta);
                let _ = events.send(GenerationEvent::TextDelta { delta }).await;
            }
            ProviderEvent::ToolCall(request) => output.requests.push(request),
            ProviderEvent::Finish { reason, usage } => {
                output.finish = reason;
                output.usage.add(&usage);
            }
        }
    }
    output
}

fn result_part(result: CallResult) -> MessagePart {
    MessagePart::ToolResult {
        id: result.id,
        name: result.name,
        outcome: result.outcome,
    }
}
