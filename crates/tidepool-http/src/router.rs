//! Router assembly.

use crate::config::HttpConfig;
use crate::handlers::{self, AppState};
use crate::resume::{ResumableStreams, StreamHandleRegistry};
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use tidepool_pipeline::ChatPipeline;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the transport router around a pipeline.
///
/// The resumable-stream registry shares the pipeline's conversation
/// store so replay sees exactly what the coordinator persisted.
pub fn build_router(pipeline: Arc<ChatPipeline>, config: HttpConfig) -> Router {
    let registry = StreamHandleRegistry::new(
        pipeline.coordinator().conversations().clone(),
        config.resume_window(),
        config.event_buffer,
    );
    let streams = ResumableStreams::enabled(Arc::new(registry));
    build_router_with_streams(pipeline, config, streams)
}

/// Router with an explicit resumption service, for deployments (and
/// tests) that disable or share it.
pub fn build_router_with_streams(
    pipeline: Arc<ChatPipeline>,
    config: HttpConfig,
    streams: ResumableStreams,
) -> Router {
    let enable_cors = config.enable_cors;
    let state = AppState {
        pipeline,
        streams,
        config,
    };

    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/chat", post(handlers::chat))
        .route("/stream/{conversation_id}", get(handlers::stream))
        .route("/run-task", post(handlers::run_task))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}
