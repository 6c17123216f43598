//! # Tidepool Core
//!
//! Domain types shared by the Tidepool generation pipeline: identifiers,
//! the conversation/message model, capability definitions, the generation
//! event model, scheduled-task types, the error taxonomy, and the store
//! traits the pipeline persists through.
//!
//! This crate holds no I/O beyond the in-memory store implementations
//! used for tests and default wiring. Concrete search tools, databases,
//! and model providers live behind the traits defined here.

pub mod capability;
pub mod error;
pub mod event;
pub mod identifiers;
pub mod message;
pub mod schedule;
pub mod schema;
pub mod store;

pub use capability::{Capability, CapabilityDescriptor, CapabilityRegistry};
pub use error::{
    AdmissionError, CapabilityError, PipelineError, SchemaViolation, StoreError, StructuredError,
};
pub use event::{FinishReason, GenerationEvent};
pub use identifiers::{
    CapabilityName, ConversationId, InvalidCapabilityName, MessageId, StreamHandleId, TaskId,
    UserId,
};
pub use message::{Conversation, Message, MessagePart, Role, ToolOutcome, Usage, Visibility};
pub use schedule::{CronSchedule, LastRun, Recurrence, RunOutcome, ScheduledTask, TaskStatus};
pub use store::{
    ConversationStore, InMemoryConversationStore, InMemoryTaskStore, InMemoryUsageLedger,
    TaskStore, UsageLedger,
};
