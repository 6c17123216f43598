//! # Tidepool HTTP
//!
//! The HTTP transport for the Tidepool pipeline: chat and scheduled-run
//! endpoints streaming [`tidepool_core::GenerationEvent`]s over SSE, and
//! the resumable-stream registry that lets a reconnecting client pick a
//! generation back up (live tail, recent replay, or a clean 204).

pub mod config;
pub mod handlers;
pub mod resume;
pub mod router;
pub mod transport;

pub use config::{ConfigError, HttpConfig};
pub use handlers::{AppState, ChatRequest, ErrorResponse, RunTaskRequest};
pub use resume::{ResumableStreams, ResumeOutcome, StreamHandleRegistry};
pub use router::build_router;
