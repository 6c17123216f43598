//! Request handlers.
//!
//! `POST /chat` streams one interactive turn, `GET /stream/{id}` resumes
//! a dropped stream, `POST /run-task` triggers a scheduled task. All
//! streaming responses carry the same SSE event envelope.

use crate::config::HttpConfig;
use crate::resume::{ResumableStreams, ResumeOutcome};
use crate::transport::sse_response;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{AppendHeaders, IntoResponse, Response};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tidepool_core::{ConversationId, GenerationEvent, TaskId, UserId};
use tidepool_pipeline::{ChatPipeline, TurnRequest};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
    pub streams: ResumableStreams,
    pub config: HttpConfig,
}

/// Body of `POST /chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Omitted on the first turn; the response's `x-conversation-id`
    /// header carries the generated id.
    pub conversation_id: Option<ConversationId>,
    pub user_id: UserId,
    pub prompt: String,
    /// Model id override for this turn.
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl ErrorResponse {
    fn response(status: StatusCode, error: &'static str, message: String) -> Response {
        (status, Json(Self { error, message })).into_response()
    }
}

/// Run one chat turn, streaming events as they happen.
///
/// Admission runs before the stream is committed so a rejected user gets
/// a plain 403 instead of an SSE stream that immediately errors.
pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> Response {
    let grant = match state.pipeline.admit(&body.user_id).await {
        Ok(grant) => grant,
        Err(err) => {
            return ErrorResponse::response(StatusCode::FORBIDDEN, "forbidden", err.to_string());
        }
    };

    let mut request = match body.conversation_id {
        Some(id) => TurnRequest::follow_up(id, body.user_id, body.prompt),
        None => TurnRequest::new_conversation(body.user_id, body.prompt),
    };
    if let Some(model) = body.model {
        request = request.with_model(model);
    }
    let conversation_id = request.conversation_id;

    // The resumable handle must exist before the first event can fire.
    let broadcast = state.streams.register(conversation_id);

    let (tx, rx) = mpsc::channel(state.config.event_buffer);
    let (client_tx, client_rx) = mpsc::channel(state.config.event_buffer);

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(err) = pipeline.run_turn(grant, request, tx).await {
            tracing::warn!(conversation = %conversation_id, error = %err, "turn failed");
        }
    });

    let streams = state.streams.clone();
    tokio::spawn(async move {
        forward_events(rx, client_tx, broadcast).await;
        streams.complete(&conversation_id);
    });

    (
        AppendHeaders([("x-conversation-id", conversation_id.to_string())]),
        sse_response(ReceiverStream::new(client_rx)),
    )
        .into_response()
}

/// Fan pipeline events out to the requesting client and any resumed
/// subscribers. A disconnected client stops neither the generation nor
/// the broadcast.
async fn forward_events(
    mut rx: mpsc::Receiver<GenerationEvent>,
    client: mpsc::Sender<GenerationEvent>,
    broadcast: Option<broadcast::Sender<GenerationEvent>>,
) {
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        if let Some(broadcast) = &broadcast {
            let _ = broadcast.send(event.clone());
        }
        let _ = client.send(event).await;
        if terminal {
            break;
        }
    }
}

/// Resume a dropped stream: live tail, recent replay, or 204.
pub async fn stream(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
) -> Response {
    match state.streams.resume(&conversation_id).await {
        ResumeOutcome::Live(receiver) => sse_response(live_tail(receiver)).into_response(),
        ResumeOutcome::Replay(message) => {
            let replay = GenerationEvent::Replay { message };
            sse_response(futures::stream::iter([replay])).into_response()
        }
        ResumeOutcome::Gone => StatusCode::NO_CONTENT.into_response(),
    }
}

fn live_tail(
    mut receiver: broadcast::Receiver<GenerationEvent>,
) -> impl Stream<Item = GenerationEvent> + Send {
    async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "resumed client lagged, continuing from here");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Body of `POST /run-task`.
#[derive(Debug, Deserialize)]
pub struct RunTaskRequest {
    pub task_id: TaskId,
    /// Prompt override; the task's stored prompt otherwise.
    pub prompt: Option<String>,
    pub owner_id: UserId,
}

/// Trigger a scheduled task now, streaming the run.
pub async fn run_task(State(state): State<AppState>, Json(body): Json<RunTaskRequest>) -> Response {
    let task = match state.pipeline.coordinator().task(&body.task_id).await {
        Ok(task) => task,
        Err(err) => {
            return ErrorResponse::response(StatusCode::NOT_FOUND, "not_found", err.to_string());
        }
    };
    if task.owner != body.owner_id {
        return ErrorResponse::response(
            StatusCode::FORBIDDEN,
            "forbidden",
            "task belongs to another user".to_string(),
        );
    }

    let task_id = body.task_id;
    let (tx, rx) = mpsc::channel(state.config.event_buffer);
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(err) = pipeline.run_scheduled(&task_id, body.prompt, tx).await {
            tracing::warn!(task = %task_id, error = %err, "scheduled run failed");
        }
    });

    sse_response(ReceiverStream::new(rx)).into_response()
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "tidepool-http",
        version: env!("CARGO_PKG_VERSION"),
    })
}
