//! End-to-end tests for the HTTP transport: chat streaming, stream
//! resumption and scheduled-task runs against an in-memory pipeline.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tidepool_core::{
    AdmissionError, CapabilityRegistry, InMemoryConversationStore, InMemoryTaskStore,
    InMemoryUsageLedger, Recurrence, ScheduledTask, TaskStatus, TaskStore, UserId,
};
use tidepool_http::{HttpConfig, build_router};
use tidepool_pipeline::admission::{AccessGrant, AdmissionGate, AllowAll};
use tidepool_pipeline::testing::{DailyAtNine, MockCapability, ScriptedProvider};
use tidepool_pipeline::{
    BackgroundQueue, ChatPipeline, ModelConfig, PersistenceCoordinator, StepLoop, StepLoopConfig,
};
use tower::ServiceExt;

struct TestApp {
    router: axum::Router,
    tasks: Arc<InMemoryTaskStore>,
    usage: Arc<InMemoryUsageLedger>,
}

fn test_app(provider: ScriptedProvider, registry: CapabilityRegistry) -> TestApp {
    test_app_with_gate(provider, registry, Arc::new(AllowAll))
}

fn test_app_with_gate(
    provider: ScriptedProvider,
    registry: CapabilityRegistry,
    gate: Arc<dyn AdmissionGate>,
) -> TestApp {
    let conversations = Arc::new(InMemoryConversationStore::new());
    let usage = Arc::new(InMemoryUsageLedger::new());
    let tasks = Arc::new(InMemoryTaskStore::new());
    let coordinator = Arc::new(PersistenceCoordinator::new(
        conversations,
        usage.clone(),
        tasks.clone(),
        Arc::new(DailyAtNine),
    ));
    let step_loop = StepLoop::new(
        Arc::new(provider),
        Arc::new(registry),
        StepLoopConfig::default(),
    );
    let pipeline = Arc::new(ChatPipeline::new(
        gate,
        coordinator,
        step_loop,
        BackgroundQueue::new(),
        ModelConfig::default(),
    ));
    let router = build_router(pipeline, HttpConfig::default());
    TestApp {
        router,
        tasks,
        usage,
    }
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_service() {
    let app = test_app(ScriptedProvider::new(), CapabilityRegistry::new());

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "tidepool-http");
}

#[tokio::test]
async fn chat_turn_streams_deltas_and_a_single_finish() {
    let app = test_app(
        ScriptedProvider::new().then_text_step("2 + 2 = 4"),
        CapabilityRegistry::new(),
    );

    let response = app
        .router
        .oneshot(chat_request(json!({
            "user_id": UserId::generate(),
            "prompt": "What is 2+2?"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-conversation-id"));
    let body = body_string(response).await;

    assert!(body.contains("event: text_delta"));
    assert_eq!(body.matches("event: finish").count(), 1);
    assert!(body.contains("\"total_tokens\":15"));
}

#[tokio::test]
async fn tool_turn_streams_the_tool_lifecycle() {
    let registry =
        CapabilityRegistry::new().with_capability(Arc::new(MockCapability::echo("web_search")));
    let app = test_app(
        ScriptedProvider::new()
            .then_tool_step(vec![("call_1", "web_search", json!({ "text": "rust" }))])
            .then_text_step("found it"),
        registry,
    );

    let response = app
        .router
        .oneshot(chat_request(json!({
            "user_id": UserId::generate(),
            "prompt": "search rust"
        })))
        .await
        .unwrap();

    let body = body_string(response).await;
    assert!(body.contains("event: tool_call_start"));
    assert!(body.contains("event: tool_result"));
    assert!(body.contains("event: step_finish"));
    assert!(body.contains("event: finish"));
}

#[tokio::test]
async fn denied_user_gets_403_before_any_stream() {
    struct DenyAll;

    #[async_trait::async_trait]
    impl AdmissionGate for DenyAll {
        async fn check_access(&self, _user: &UserId) -> Result<AccessGrant, AdmissionError> {
            Err(AdmissionError::new("subscription required"))
        }
    }

    let app = test_app_with_gate(
        ScriptedProvider::new().then_text_step("never runs"),
        CapabilityRegistry::new(),
        Arc::new(DenyAll),
    );

    let response = app
        .router
        .oneshot(chat_request(json!({
            "user_id": UserId::generate(),
            "prompt": "hi"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"], "forbidden");
    assert_eq!(app.usage.message_count(&UserId::generate()), 0);
}

#[tokio::test]
async fn resuming_an_unknown_conversation_is_a_204() {
    let app = test_app(ScriptedProvider::new(), CapabilityRegistry::new());

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri(format!("/stream/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn recently_finished_turn_replays_on_reconnect() {
    let app = test_app(
        ScriptedProvider::new().then_text_step("the answer"),
        CapabilityRegistry::new(),
    );

    let response = app
        .router
        .clone()
        .oneshot(chat_request(json!({
            "user_id": UserId::generate(),
            "prompt": "question"
        })))
        .await
        .unwrap();
    let conversation_id = response
        .headers()
        .get("x-conversation-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    // Drain the original stream so the turn is fully persisted.
    body_string(response).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri(format!("/stream/{conversation_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("event: replay"));
    assert!(body.contains("the answer"));
}

fn run_task_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/run-task")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn running_an_unknown_task_is_a_404() {
    let app = test_app(ScriptedProvider::new(), CapabilityRegistry::new());

    let response = app
        .router
        .oneshot(run_task_request(json!({
            "task_id": uuid::Uuid::new_v4(),
            "owner_id": UserId::generate()
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn running_someone_elses_task_is_forbidden() {
    let app = test_app(ScriptedProvider::new(), CapabilityRegistry::new());
    let task = ScheduledTask::new(UserId::generate(), "private digest", Recurrence::Once);
    let id = task.id;
    app.tasks.insert(task);

    let response = app
        .router
        .oneshot(run_task_request(json!({
            "task_id": id,
            "owner_id": UserId::generate()
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn triggered_task_streams_its_run_and_records_bookkeeping() {
    let app = test_app(
        ScriptedProvider::new().then_text_step("today's briefing"),
        CapabilityRegistry::new(),
    );
    let owner = UserId::generate();
    let task = ScheduledTask::new(owner, "daily briefing", Recurrence::Once);
    let id = task.id;
    app.tasks.insert(task);

    let response = app
        .router
        .oneshot(run_task_request(json!({
            "task_id": id,
            "owner_id": owner
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("event: finish"));

    // Bookkeeping lands just after the stream closes.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let stored = app.tasks.get(&id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Paused);
    assert!(stored.last_run.is_some());
}
