//! Full-turn integration tests: persistence, billing and scheduled-run
//! bookkeeping across the assembled pipeline.

use serde_json::json;
use std::sync::Arc;
use tidepool_core::{
    CapabilityRegistry, FinishReason, GenerationEvent, InMemoryConversationStore,
    InMemoryTaskStore, InMemoryUsageLedger, Recurrence, Role, RunOutcome, ScheduledTask,
    TaskStatus, TaskStore, UserId,
};
use tidepool_pipeline::admission::AllowAll;
use tidepool_pipeline::testing::{DailyAtNine, MockCapability, ScriptedProvider, drain_events};
use tidepool_pipeline::{
    BackgroundQueue, ChatPipeline, ModelConfig, PersistenceCoordinator, StepLoop, StepLoopConfig,
    TurnRequest,
};
use tokio::sync::mpsc;

struct World {
    conversations: Arc<InMemoryConversationStore>,
    usage: Arc<InMemoryUsageLedger>,
    tasks: Arc<InMemoryTaskStore>,
    pipeline: ChatPipeline,
}

fn world(provider: ScriptedProvider, registry: CapabilityRegistry) -> World {
    let conversations = Arc::new(InMemoryConversationStore::new());
    let usage = Arc::new(InMemoryUsageLedger::new());
    let tasks = Arc::new(InMemoryTaskStore::new());
    let coordinator = Arc::new(PersistenceCoordinator::new(
        conversations.clone(),
        usage.clone(),
        tasks.clone(),
        Arc::new(DailyAtNine),
    ));
    let step_loop = StepLoop::new(
        Arc::new(provider),
        Arc::new(registry),
        StepLoopConfig::default(),
    );
    let pipeline = ChatPipeline::new(
        Arc::new(AllowAll),
        coordinator,
        step_loop,
        BackgroundQueue::new(),
        ModelConfig::default(),
    );
    World {
        conversations,
        usage,
        tasks,
        pipeline,
    }
}

async fn run_turn(
    world: &World,
    request: TurnRequest,
) -> (tidepool_pipeline::TurnReport, Vec<GenerationEvent>) {
    let grant = world.pipeline.admit(&request.user_id).await.unwrap();
    let (tx, rx) = mpsc::channel(64);
    let report = world
        .pipeline
        .run_turn(grant, request, tx)
        .await
        .expect("turn completes");
    (report, drain_events(rx).await)
}

#[tokio::test]
async fn simple_question_persists_bills_and_finishes_once() {
    let w = world(
        ScriptedProvider::new().then_text_step("2 + 2 = 4"),
        CapabilityRegistry::new(),
    );
    let user = UserId::generate();

    let (report, events) = run_turn(&w, TurnRequest::new_conversation(user, "What is 2+2?")).await;

    // Exactly one user and one assistant message, in order.
    let messages = w.conversations.all_messages(&report.conversation_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].text(), "2 + 2 = 4");

    // Exactly one terminal finish, with real token counts.
    let finishes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            GenerationEvent::Finish { reason, usage, .. } => Some((reason, usage)),
            _ => None,
        })
        .collect();
    assert_eq!(finishes.len(), 1);
    assert_eq!(*finishes[0].0, FinishReason::Stop);
    assert!(finishes[0].1.total_tokens > 0);

    // Billed exactly once, even after deferred work runs.
    assert_eq!(w.usage.message_count(&user), 1);
    w.pipeline.background().drain().await;
    assert_eq!(w.usage.message_count(&user), 1);
    assert_eq!(
        w.conversations
            .conversation(&report.conversation_id)
            .unwrap()
            .title,
        "What is 2+2?"
    );
}

#[tokio::test]
async fn follow_up_turns_accumulate_in_one_conversation() {
    let w = world(
        ScriptedProvider::new()
            .then_text_step("four")
            .then_text_step("eight"),
        CapabilityRegistry::new(),
    );
    let user = UserId::generate();

    let (first, _) = run_turn(&w, TurnRequest::new_conversation(user, "2+2?")).await;
    let (second, _) = run_turn(
        &w,
        TurnRequest::follow_up(first.conversation_id, user, "double it"),
    )
    .await;

    assert_eq!(first.conversation_id, second.conversation_id);
    assert_eq!(w.conversations.conversation_count(), 1);
    assert_eq!(w.conversations.all_messages(&first.conversation_id).len(), 4);
    assert_eq!(w.usage.message_count(&user), 2);
}

#[tokio::test]
async fn premium_tool_use_bills_the_premium_counter_once_per_turn() {
    let registry = CapabilityRegistry::new()
        .with_capability(Arc::new(MockCapability::echo("deep_research").premium()));
    let w = world(
        ScriptedProvider::new()
            .then_tool_step(vec![
                ("call_1", "deep_research", json!({ "text": "a" })),
                ("call_2", "deep_research", json!({ "text": "b" })),
            ])
            .then_text_step("synthesis"),
        registry,
    );
    let user = UserId::generate();

    let (report, _) = run_turn(&w, TurnRequest::new_conversation(user, "research this")).await;

    assert_eq!(report.outcome.premium_invocations, 2);
    assert_eq!(w.usage.message_count(&user), 1);
    assert_eq!(w.usage.premium_count(&user), 1);
}

#[tokio::test]
async fn recurring_task_advances_through_consecutive_runs() {
    let w = world(
        ScriptedProvider::new()
            .then_text_step("monday briefing")
            .then_text_step("tuesday briefing"),
        CapabilityRegistry::new(),
    );
    let task = ScheduledTask::new(
        UserId::generate(),
        "daily briefing",
        Recurrence::Cron {
            expression: "0 9 * * *".to_string(),
            timezone: "UTC".to_string(),
        },
    );
    let id = task.id;
    w.tasks.insert(task);

    let (tx, rx) = mpsc::channel(64);
    let first = w.pipeline.run_scheduled(&id, None, tx).await.unwrap();
    drain_events(rx).await;

    let after_first = w.tasks.get(&id).await.unwrap();
    assert_eq!(after_first.status, TaskStatus::Active);
    let first_next = after_first.next_run_at.unwrap();

    let (tx, rx) = mpsc::channel(64);
    let second = w.pipeline.run_scheduled(&id, None, tx).await.unwrap();
    drain_events(rx).await;

    let after_second = w.tasks.get(&id).await.unwrap();
    assert!(after_second.next_run_at.unwrap() >= first_next);
    assert_eq!(after_second.last_run.unwrap().outcome, RunOutcome::Success);

    // Each run opened its own conversation.
    assert_ne!(first.conversation_id, second.conversation_id);
    assert_eq!(w.conversations.conversation_count(), 2);
}
