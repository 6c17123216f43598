//! # Tidepool Pipeline
//!
//! The request pipeline that turns a chat turn into a multi-step,
//! tool-augmented model generation: the step loop controller, tool
//! dispatch and repair, the persistence coordinator that runs at
//! generation boundaries, and the background queue for work deferred
//! until after the response has been flushed.
//!
//! The pipeline is shared between interactive chat and unattended
//! scheduled runs; both go through [`ChatPipeline`].

pub mod admission;
pub mod background;
pub mod coordinator;
pub mod dispatch;
pub mod pipeline;
pub mod provider;
pub mod repair;
pub mod step_loop;
pub mod testing;

pub use admission::{AccessGrant, AdmissionGate, AllowAll};
pub use background::BackgroundQueue;
pub use coordinator::{
    Notifier, NotifyError, PersistenceCoordinator, TurnContext, TurnError, TurnRequest,
};
pub use pipeline::{ChatPipeline, TurnReport};
pub use provider::{
    EventStream, ModelConfig, ModelProvider, ProviderError, ProviderEvent, RepairRequest,
    StepRequest, ToolCallRequest, ToolChoice,
};
pub use repair::{RepairUnit, RepairVerdict};
pub use step_loop::{GenerationOutcome, StepFailure, StepLoop, StepLoopConfig};
