//! Execution of one step's validated tool calls.
//!
//! A call that fails never raises across the step boundary: the failure
//! is mapped to a structured error outcome that the model sees on the
//! next step.

use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tidepool_core::{Capability, CapabilityName, ToolOutcome};

/// A tool call that passed name lookup and schema validation (possibly
/// after repair) and is cleared for dispatch.
pub struct PreparedCall {
    pub id: String,
    pub name: CapabilityName,
    pub input: Value,
    pub capability: Arc<dyn Capability>,
}

/// The result of one dispatched call.
pub struct CallResult {
    pub id: String,
    pub name: CapabilityName,
    pub outcome: ToolOutcome,
    pub premium: bool,
}

async fn run_call(call: PreparedCall) -> CallResult {
    let premium = call.capability.premium();
    let outcome = match call.capability.invoke(call.input).await {
        Ok(output) => ToolOutcome::Success(output),
        Err(err) => {
            tracing::warn!(capability = %call.name, error = %err, "tool invocation failed");
            ToolOutcome::Error(err.into_structured())
        }
    };
    CallResult {
        id: call.id,
        name: call.name,
        outcome,
        premium,
    }
}

/// Dispatch all calls of one step, concurrently when the provider
/// configuration permits parallel tool use, serially otherwise. Results
/// come back in call order either way.
pub async fn dispatch_calls(calls: Vec<PreparedCall>, parallel: bool) -> Vec<CallResult> {
    if parallel {
        join_all(calls.into_iter().map(run_call)).await
    } else {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(run_call(call).await);
        }
        results
    }
}
