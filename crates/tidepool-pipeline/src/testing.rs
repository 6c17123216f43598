//! Scripted providers and mock capabilities for pipeline tests.
//!
//! `ScriptedProvider` replays a fixed sequence of step results and
//! repair answers; `MockCapability` echoes or fails on demand and counts
//! its invocations. Both live in the library (not behind `cfg(test)`) so
//! downstream crates can drive the pipeline in their own tests.

use crate::coordinator::{Notifier, NotifyError};
use crate::provider::{
    EventStream, ModelProvider, ProviderError, ProviderEvent, RepairRequest, StepRequest,
    ToolCallRequest, ToolChoice,
};
use crate::step_loop::GenerationOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tidepool_core::error::CapabilityError;
use tidepool_core::{
    Capability, ConversationId, CronSchedule, FinishReason, GenerationEvent, MessagePart, Usage,
    UserId,
};
use tokio::sync::mpsc;

type ScriptedStep = Result<Vec<ProviderEvent>, ProviderError>;

/// A model provider that replays a scripted sequence of steps.
#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptedStep>>,
    repairs: Mutex<VecDeque<Result<Value, ProviderError>>>,
    step_calls: AtomicUsize,
    repair_calls: AtomicUsize,
    tool_choices: Mutex<Vec<ToolChoice>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a step that streams `text` and finishes cleanly.
    pub fn then_text_step(self, text: &str) -> Self {
        let events = vec![
            ProviderEvent::TextDelta {
                delta: text.to_string(),
            },
            ProviderEvent::Finish {
                reason: FinishReason::Stop,
                usage: step_usage(),
            },
        ];
        self.steps.lock().unwrap().push_back(Ok(events));
        self
    }

    /// Script a step that requests the given tool calls.
    pub fn then_tool_step(self, calls: Vec<(&str, &str, Value)>) -> Self {
        let mut events: Vec<ProviderEvent> = calls
            .into_iter()
            .map(|(id, name, input)| {
                ProviderEvent::ToolCall(ToolCallRequest {
                    id: id.to_string(),
                    name: name.to_string(),
                    input,
                })
            })
            .collect();
        events.push(ProviderEvent::Finish {
            reason: FinishReason::ToolCalls,
            usage: step_usage(),
        });
        self.steps.lock().unwrap().push_back(Ok(events));
        self
    }

    /// Script a step that fails outright.
    pub fn then_error(self, error: ProviderError) -> Self {
        self.steps.lock().unwrap().push_back(Err(error));
        self
    }

    /// Script the next repair call to return `input`.
    pub fn then_repair(self, input: Value) -> Self {
        self.repairs.lock().unwrap().push_back(Ok(input));
        self
    }

    /// Script the next repair call to fail.
    pub fn then_repair_error(self, error: ProviderError) -> Self {
        self.repairs.lock().unwrap().push_back(Err(error));
        self
    }

    /// How many step requests were issued.
    pub fn step_calls(&self) -> usize {
        self.step_calls.load(Ordering::SeqCst)
    }

    /// How many repair requests were issued.
    pub fn repair_calls(&self) -> usize {
        self.repair_calls.load(Ordering::SeqCst)
    }

    /// The tool choice of every step request, in order.
    pub fn tool_choices(&self) -> Vec<ToolChoice> {
        self.tool_choices.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete_step(
        &self,
        request: StepRequest<'_>,
    ) -> Result<EventStream, ProviderError> {
        self.step_calls.fetch_add(1, Ordering::SeqCst);
        self.tool_choices.lock().unwrap().push(request.tool_choice);
        let next = self.steps.lock().unwrap().pop_front();
        match next {
            Some(Ok(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(Err(err)) => Err(err),
            None => Err(ProviderError::Fatal("provider script exhausted".to_string())),
        }
    }

    async fn repair_call(&self, _request: RepairRequest<'_>) -> Result<Value, ProviderError> {
        self.repair_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.repairs.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => Err(ProviderError::Fatal("repair script exhausted".to_string())),
        }
    }
}

fn step_usage() -> Usage {
    Usage {
        input_tokens: 10,
        output_tokens: 5,
        total_tokens: 15,
        completion_seconds: 0.0,
    }
}

/// A capability that echoes its input, fails on demand and counts calls.
pub struct MockCapability {
    name: String,
    schema: Value,
    premium: bool,
    fail_with: Option<String>,
    invocations: AtomicUsize,
}

impl MockCapability {
    /// Echoes its input back as the tool output.
    pub fn echo(name: &str) -> Self {
        Self {
            name: name.to_string(),
            schema: serde_json::json!({ "type": "object" }),
            premium: false,
            fail_with: None,
            invocations: AtomicUsize::new(0),
        }
    }

    /// Echoes, but advertises the given input schema.
    pub fn echo_with_schema(name: &str, schema: Value) -> Self {
        Self {
            schema,
            ..Self::echo(name)
        }
    }

    /// Fails every invocation with the given message.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::echo(name)
        }
    }

    /// Mark as premium, builder style.
    pub fn premium(mut self) -> Self {
        self.premium = true;
        self
    }

    pub fn name_str(&self) -> &str {
        &self.name
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for MockCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Value {
        &self.schema
    }

    fn premium(&self) -> bool {
        self.premium
    }

    async fn invoke(&self, input: Value) -> Result<Value, CapabilityError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(message) => Err(CapabilityError::ExecutionFailed {
                name: self.name.clone(),
                message: message.clone(),
            }),
            None => Ok(input),
        }
    }
}

/// Collect every event the pipeline emitted. The sender must be dropped
/// before calling this or it will wait forever.
pub async fn drain_events(mut rx: mpsc::Receiver<GenerationEvent>) -> Vec<GenerationEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// A fixed cron evaluator: fires daily at 09:00 UTC, ignoring the
/// expression and timezone.
pub struct DailyAtNine;

impl CronSchedule for DailyAtNine {
    fn next_after(
        &self,
        _expression: &str,
        _timezone: &str,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let at_nine = after.date_naive().and_hms_opt(9, 0, 0)?.and_utc();
        if at_nine > after {
            Some(at_nine)
        } else {
            Some(at_nine + Duration::days(1))
        }
    }
}

/// A notifier that records every attempt and optionally fails.
#[derive(Default)]
pub struct CollectingNotifier {
    fail: bool,
    attempts: AtomicUsize,
    summaries: Mutex<Vec<String>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn summaries(&self) -> Vec<String> {
        self.summaries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(
        &self,
        _owner: &UserId,
        _conversation_id: &ConversationId,
        summary: &str,
    ) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.summaries.lock().unwrap().push(summary.to_string());
        if self.fail {
            Err(NotifyError {
                message: "smtp unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// A finished generation with a single text part, for coordinator tests.
pub fn outcome_with_text(text: &str, finish_reason: FinishReason) -> GenerationOutcome {
    GenerationOutcome {
        parts: vec![MessagePart::Text {
            text: text.to_string(),
        }],
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            completion_seconds: 0.3,
        },
        finish_reason,
        steps: 1,
        premium_invocations: 0,
    }
}
