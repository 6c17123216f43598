//! Generation event model.
//!
//! One exhaustive event enum carries everything a client sees during a
//! generation: text deltas, tool-call lifecycle, step boundaries, the
//! terminal finish marker with aggregate usage, and terminal errors.
//! Consumers dispatch over the tag instead of juggling per-concern
//! callbacks sharing request-scoped state.

use crate::identifiers::CapabilityName;
use crate::message::{Message, ToolOutcome, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a step (or the whole generation) stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// The model stopped to issue tool calls.
    ToolCalls,
    /// Output-length limit reached.
    Length,
    /// Provider content filter fired.
    ContentFilter,
    /// The generation ended on a terminal error.
    Error,
}

impl FinishReason {
    /// Clean stops are the only ones that bill usage counters.
    pub fn is_clean_stop(&self) -> bool {
        matches!(self, FinishReason::Stop)
    }
}

/// Everything emitted over the wire during one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// Incremental assistant text.
    TextDelta { delta: String },
    /// The model requested a tool invocation.
    ToolCallStart {
        id: String,
        name: CapabilityName,
        input: Value,
    },
    /// A tool invocation finished (success or structured error).
    ToolResult {
        id: String,
        name: CapabilityName,
        outcome: ToolOutcome,
    },
    /// One inference round completed.
    StepFinish { step: u32, tool_calls: usize },
    /// Terminal marker with aggregate usage.
    Finish {
        model: String,
        reason: FinishReason,
        usage: Usage,
    },
    /// Synthesized replay of a recently persisted assistant message,
    /// sent to a reconnecting client instead of re-running generation.
    Replay { message: Message },
    /// Terminal, user-visible failure.
    Error { message: String },
}

impl GenerationEvent {
    /// Wire-level event name (the SSE `event:` field).
    pub fn wire_name(&self) -> &'static str {
        match self {
            GenerationEvent::TextDelta { .. } => "text_delta",
            GenerationEvent::ToolCallStart { .. } => "tool_call_start",
            GenerationEvent::ToolResult { .. } => "tool_result",
            GenerationEvent::StepFinish { .. } => "step_finish",
            GenerationEvent::Finish { .. } => "finish",
            GenerationEvent::Replay { .. } => "replay",
            GenerationEvent::Error { .. } => "error",
        }
    }

    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationEvent::Finish { .. }
                | GenerationEvent::Replay { .. }
                | GenerationEvent::Error { .. }
        )
    }
}
