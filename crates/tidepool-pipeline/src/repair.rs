//! Tool-call repair.
//!
//! When a tool call fails schema validation it gets exactly one repair
//! attempt: a secondary structured-generation request asking the model
//! to emit input that conforms to the schema, given the original attempt
//! and the validation error. Output that still fails validation makes
//! the call unrepairable; the caller drops it from dispatch.

use crate::provider::{ModelProvider, RepairRequest};
use serde_json::Value;
use std::sync::Arc;
use tidepool_core::error::SchemaViolation;
use tidepool_core::schema::validate_input;
use tidepool_core::CapabilityName;

/// Result of one repair attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RepairVerdict {
    Corrected(Value),
    Unrepairable,
}

/// Issues the single auxiliary repair call.
pub struct RepairUnit {
    provider: Arc<dyn ModelProvider>,
}

impl RepairUnit {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    /// Try to repair `attempted_input` for the named capability. The
    /// corrected output is validated again before it is accepted.
    pub async fn repair(
        &self,
        name: &CapabilityName,
        schema: &Value,
        attempted_input: &Value,
        violation: &SchemaViolation,
    ) -> RepairVerdict {
        let request = RepairRequest {
            name: name.as_str(),
            schema,
            attempted_input,
            violation,
        };
        match self.provider.repair_call(request).await {
            Ok(candidate) => match validate_input(schema, &candidate) {
                Ok(()) => RepairVerdict::Corrected(candidate),
                Err(still_invalid) => {
                    tracing::warn!(
                        capability = %name,
                        error = %still_invalid,
                        "repaired tool input still invalid, dropping call"
                    );
                    RepairVerdict::Unrepairable
                }
            },
            Err(err) => {
                tracing::warn!(capability = %name, error = %err, "repair call failed");
                RepairVerdict::Unrepairable
            }
        }
    }
}
