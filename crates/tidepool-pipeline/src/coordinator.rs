//! The persistence coordinator.
//!
//! Runs at generation boundaries. Before generation: the triggering user
//! message is persisted unconditionally, so any later failure is always
//! attributable to a real, visible turn. After generation: the assistant
//! message, usage counters, scheduled-task bookkeeping and the optional
//! completion notification. All best-effort, and none may mask a result
//! the client has already received.

use crate::step_loop::GenerationOutcome;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tidepool_core::{
    Conversation, ConversationId, ConversationStore, CronSchedule, LastRun, Message, PipelineError,
    Recurrence, RunOutcome, ScheduledTask, TaskId, TaskStatus, TaskStore, UsageLedger, UserId,
    Visibility,
};
use tidepool_core::message::placeholder_title;

/// How much history feeds the model.
const TRANSCRIPT_WINDOW: usize = 20;

/// One inbound chat turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    /// True when this turn opens a new conversation under that id.
    pub new_conversation: bool,
    pub user_id: UserId,
    pub prompt: String,
    /// Model id override for this turn; the pipeline default otherwise.
    pub model: Option<String>,
}

impl TurnRequest {
    /// A turn that opens a fresh conversation.
    pub fn new_conversation(user_id: UserId, prompt: impl Into<String>) -> Self {
        Self {
            conversation_id: ConversationId::generate(),
            new_conversation: true,
            user_id,
            prompt: prompt.into(),
            model: None,
        }
    }

    /// A follow-up turn in an existing conversation.
    pub fn follow_up(
        conversation_id: ConversationId,
        user_id: UserId,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            new_conversation: false,
            user_id,
            prompt: prompt.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Request-scoped state established by [`PersistenceCoordinator::begin`].
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: ConversationId,
    pub owner: UserId,
    pub created_conversation: bool,
    /// History plus the just-persisted user message, oldest first.
    pub transcript: Vec<Message>,
}

/// A failed turn: the terminal error plus whatever assistant output the
/// completed steps produced (already persisted by the time this exists).
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct TurnError {
    pub error: PipelineError,
    /// Output accumulated before the failure; `None` when the turn
    /// failed before generation started.
    pub partial: Option<GenerationOutcome>,
}

impl From<PipelineError> for TurnError {
    fn from(error: PipelineError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

/// Completion-notification failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("notification failed: {message}")]
pub struct NotifyError {
    pub message: String,
}

/// Optional completion notification (e.g. email) for unattended runs.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        owner: &UserId,
        conversation_id: &ConversationId,
        summary: &str,
    ) -> Result<(), NotifyError>;
}

/// Writes at generation boundaries.
pub struct PersistenceCoordinator {
    conversations: Arc<dyn ConversationStore>,
    usage: Arc<dyn UsageLedger>,
    tasks: Arc<dyn TaskStore>,
    cron: Arc<dyn CronSchedule>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PersistenceCoordinator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        usage: Arc<dyn UsageLedger>,
        tasks: Arc<dyn TaskStore>,
        cron: Arc<dyn CronSchedule>,
    ) -> Self {
        Self {
            conversations,
            usage,
            tasks,
            cron,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.conversations
    }

    pub async fn task(&self, id: &TaskId) -> Result<ScheduledTask, tidepool_core::StoreError> {
        self.tasks.get(id).await
    }

    /// Flip a task to `Running` for the duration of a run. Best-effort;
    /// the run proceeds even if the status write fails.
    pub async fn mark_task_running(&self, id: &TaskId) {
        if let Err(err) = self.tasks.set_status(id, TaskStatus::Running).await {
            tracing::warn!(task = %id, error = %err, "failed to mark task running");
        }
    }

    /// Persist the user turn before any generation.
    ///
    /// Failures here are terminal: a generation whose trigger was never
    /// written would be unattributable.
    pub async fn begin(&self, request: &TurnRequest) -> Result<TurnContext, PipelineError> {
        let mut transcript = if request.new_conversation {
            let conversation = Conversation {
                id: request.conversation_id,
                owner: request.user_id,
                visibility: Visibility::Private,
                title: placeholder_title(&request.prompt),
                created_at: Utc::now(),
            };
            self.conversations
                .create_conversation(conversation)
                .await
                .map_err(|e| PipelineError::persistence("create_conversation", e))?;
            Vec::new()
        } else {
            self.conversations
                .latest_messages(&request.conversation_id, TRANSCRIPT_WINDOW)
                .await
                .map_err(|e| PipelineError::persistence("load_transcript", e))?
        };

        let user_message = Message::user(request.conversation_id, request.prompt.clone());
        self.conversations
            .append_message(user_message.clone())
            .await
            .map_err(|e| PipelineError::persistence("append_user_message", e))?;
        transcript.push(user_message);

        Ok(TurnContext {
            conversation_id: request.conversation_id,
            owner: request.user_id,
            created_conversation: request.new_conversation,
            transcript,
        })
    }

    /// Persist the assistant output and run the billing side effects.
    ///
    /// The response has already streamed to the client by the time this
    /// runs, so every failure here is logged and swallowed. Returns the
    /// assistant message (persisted or not) for replay registration.
    pub async fn finalize(
        &self,
        ctx: &TurnContext,
        outcome: &GenerationOutcome,
        billable: bool,
    ) -> Message {
        let message = Message::assistant(ctx.conversation_id, outcome.parts.clone(), outcome.usage);
        if let Err(err) = self.conversations.append_message(message.clone()).await {
            tracing::warn!(
                conversation = %ctx.conversation_id,
                error = %err,
                "failed to persist assistant message"
            );
        }

        if outcome.finish_reason.is_clean_stop() && billable {
            if let Err(err) = self.usage.increment_messages(&ctx.owner).await {
                tracing::warn!(owner = %ctx.owner, error = %err, "message counter increment failed");
            }
            if outcome.premium_used() {
                if let Err(err) = self.usage.increment_premium_tools(&ctx.owner).await {
                    tracing::warn!(
                        owner = %ctx.owner,
                        error = %err,
                        "premium counter increment failed"
                    );
                }
            }
        }

        message
    }

    /// Upgrade a placeholder title once the first turn is known. Runs on
    /// the background queue; best-effort.
    pub async fn upgrade_title(&self, conversation_id: ConversationId, prompt: String) {
        let title = placeholder_title(prompt.lines().next().unwrap_or(&prompt));
        if let Err(err) = self.conversations.set_title(&conversation_id, title).await {
            tracing::debug!(
                conversation = %conversation_id,
                error = %err,
                "title upgrade skipped"
            );
        }
    }

    /// Record scheduled-task bookkeeping for a finished run.
    ///
    /// Success on a recurring task advances `next_run_at` in the task's
    /// timezone; success on a one-shot task parks it as `Paused`. Every
    /// other terminal path returns the task to `Active` so one failed
    /// run never blocks future runs. A failed run still records the
    /// token usage of the steps that completed before the failure.
    pub async fn finalize_task_run(
        &self,
        task: &ScheduledTask,
        conversation_id: ConversationId,
        result: Result<&GenerationOutcome, &TurnError>,
        duration_ms: u64,
    ) {
        let now = Utc::now();
        let (last_run, next_run_at, status) = match result {
            Ok(outcome) => {
                let (next_run_at, status) = match &task.recurrence {
                    Recurrence::Cron {
                        expression,
                        timezone,
                    } => (
                        self.cron.next_after(expression, timezone, now),
                        TaskStatus::Active,
                    ),
                    Recurrence::Once => (None, TaskStatus::Paused),
                };
                let last_run = LastRun {
                    at: now,
                    conversation_id,
                    outcome: RunOutcome::Success,
                    duration_ms,
                    input_tokens: outcome.usage.input_tokens,
                    output_tokens: outcome.usage.output_tokens,
                    total_tokens: outcome.usage.total_tokens,
                    premium_invocations: outcome.premium_invocations,
                    error: None,
                };
                (last_run, next_run_at, status)
            }
            Err(failure) => {
                let partial = failure.partial.as_ref();
                let last_run = LastRun {
                    at: now,
                    conversation_id,
                    outcome: RunOutcome::Error,
                    duration_ms,
                    input_tokens: partial.map_or(0, |p| p.usage.input_tokens),
                    output_tokens: partial.map_or(0, |p| p.usage.output_tokens),
                    total_tokens: partial.map_or(0, |p| p.usage.total_tokens),
                    premium_invocations: partial.map_or(0, |p| p.premium_invocations),
                    error: Some(failure.error.to_string()),
                };
                (last_run, task.next_run_at, TaskStatus::Active)
            }
        };

        if let Err(err) = self
            .tasks
            .record_run(&task.id, last_run, next_run_at, status)
            .await
        {
            tracing::warn!(task = %task.id, error = %err, "task bookkeeping write failed");
        }

        if let (Some(notifier), Ok(outcome)) = (&self.notifier, result) {
            let summary = summarize(outcome);
            if let Err(err) = notifier
                .notify(&task.owner, &conversation_id, &summary)
                .await
            {
                tracing::warn!(task = %task.id, error = %err, "completion notification failed");
            }
        }
    }
}

fn summarize(outcome: &GenerationOutcome) -> String {
    let text: String = outcome
        .parts
        .iter()
        .filter_map(|part| match part {
            tidepool_core::MessagePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    placeholder_title(&text)
}
