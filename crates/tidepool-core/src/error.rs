//! Error taxonomy for the generation pipeline.
//!
//! The guiding rule: only admission rejections, provider rate limits and
//! unrecoverable terminal failures are ever user-visible. Everything else
//! is absorbed: tool failures become model-visible transcript content,
//! bookkeeping failures are logged and swallowed.

use serde::{Deserialize, Serialize};

/// A serializable, model-visible error record.
///
/// This is what lands in the transcript when a tool invocation fails;
/// it is content, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    pub kind: String,
    pub message: String,
}

impl StructuredError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A tool execution failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new("execution_failed", message)
    }

    /// A tool input that could not be repaired.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new("invalid_input", message)
    }
}

/// Request rejected before any generation or persistence.
#[derive(Debug, Clone, thiserror::Error)]
#[error("access denied: {reason}")]
pub struct AdmissionError {
    pub reason: String,
}

impl AdmissionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Why a tool input failed schema validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("input is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{field}'")]
    MissingField { field: String },
    #[error("field '{field}' expected type '{expected}', got '{actual}'")]
    WrongType {
        field: String,
        expected: String,
        actual: String,
    },
}

/// Failure of a single capability invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability '{name}' not found")]
    NotFound { name: String },

    #[error("capability '{name}' rejected input: {violation}")]
    InvalidInput {
        name: String,
        violation: SchemaViolation,
    },

    #[error("capability '{name}' failed: {message}")]
    ExecutionFailed { name: String, message: String },
}

impl CapabilityError {
    /// Flatten into the transcript representation.
    pub fn into_structured(self) -> StructuredError {
        match self {
            CapabilityError::NotFound { name } => {
                StructuredError::new("not_found", format!("capability '{name}' not found"))
            }
            CapabilityError::InvalidInput { violation, .. } => {
                StructuredError::invalid_input(violation.to_string())
            }
            CapabilityError::ExecutionFailed { message, .. } => {
                StructuredError::execution(message)
            }
        }
    }
}

/// Persistence-store failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error("scheduled task '{id}' not found")]
    TaskNotFound { id: String },

    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Terminal pipeline failures.
///
/// A value of this type means the generation cannot continue. Everything
/// the loop can degrade around (tool failures, transient provider
/// hiccups inside the retry budget, bookkeeping errors) never becomes a
/// `PipelineError`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Rate limits are terminal and user-visible; they are never
    /// auto-retried.
    #[error("provider rate limit: {message}")]
    RateLimited { message: String },

    /// A transient provider error that survived the retry budget, or a
    /// fatal one (bad credentials, unknown model).
    #[error("provider failure: {message}")]
    Provider { message: String },

    /// Persistence unavailable at a point where the pipeline cannot
    /// proceed (the user-message write).
    #[error("persistence failure during {operation}: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    pub fn persistence(operation: &'static str, source: StoreError) -> Self {
        Self::Persistence { operation, source }
    }

    /// Whether this error should surface to the end user as-is.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            PipelineError::Admission(_) | PipelineError::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_errors_flatten_to_structured_content() {
        let err = CapabilityError::ExecutionFailed {
            name: "web_search".to_string(),
            message: "timeout".to_string(),
        };
        let structured = err.into_structured();
        assert_eq!(structured.kind, "execution_failed");
        assert_eq!(structured.message, "timeout");

        let err = CapabilityError::InvalidInput {
            name: "web_search".to_string(),
            violation: SchemaViolation::MissingField {
                field: "query".to_string(),
            },
        };
        assert_eq!(err.into_structured().kind, "invalid_input");
    }

    #[test]
    fn only_admission_and_rate_limit_are_user_visible() {
        assert!(PipelineError::Admission(AdmissionError::new("no subscription")).is_user_visible());
        assert!(
            PipelineError::RateLimited {
                message: "slow down".to_string()
            }
            .is_user_visible()
        );
        assert!(
            !PipelineError::Provider {
                message: "boom".to_string()
            }
            .is_user_visible()
        );
        assert!(
            !PipelineError::persistence(
                "append_message",
                StoreError::Unavailable {
                    reason: "down".to_string()
                }
            )
            .is_user_visible()
        );
    }
}
