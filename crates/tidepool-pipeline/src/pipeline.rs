//! The assembled pipeline.
//!
//! [`ChatPipeline`] wires admission, the persistence coordinator, the
//! step loop and the background queue into one entry point shared by
//! interactive turns and unattended scheduled runs. The caller owns the
//! event channel; the pipeline owns everything else.

use crate::admission::{AccessGrant, AdmissionGate};
use crate::background::BackgroundQueue;
use crate::coordinator::{PersistenceCoordinator, TurnError, TurnRequest};
use crate::provider::ModelConfig;
use crate::step_loop::{GenerationOutcome, StepLoop};
use std::sync::Arc;
use std::time::Instant;
use tidepool_core::{
    AdmissionError, ConversationId, GenerationEvent, Message, PipelineError, TaskId, UserId,
};
use tokio::sync::mpsc;

/// What one completed turn produced, for the transport layer.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub conversation_id: ConversationId,
    /// The persisted assistant message, for replay registration.
    pub message: Message,
    pub outcome: GenerationOutcome,
}

/// One pipeline instance serves all conversations.
pub struct ChatPipeline {
    admission: Arc<dyn AdmissionGate>,
    coordinator: Arc<PersistenceCoordinator>,
    step_loop: StepLoop,
    background: BackgroundQueue,
    model: ModelConfig,
}

impl ChatPipeline {
    pub fn new(
        admission: Arc<dyn AdmissionGate>,
        coordinator: Arc<PersistenceCoordinator>,
        step_loop: StepLoop,
        background: BackgroundQueue,
        model: ModelConfig,
    ) -> Self {
        Self {
            admission,
            coordinator,
            step_loop,
            background,
            model,
        }
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.coordinator
    }

    pub fn background(&self) -> &BackgroundQueue {
        &self.background
    }

    /// Admission check, separated from the run so the transport can
    /// reject before committing to a stream.
    pub async fn admit(&self, user: &UserId) -> Result<AccessGrant, AdmissionError> {
        self.admission.check_access(user).await
    }

    /// Run one interactive turn, streaming events to `events`.
    ///
    /// Emits a terminal `Finish` on success and a terminal `Error` on
    /// failure before returning. A closed `events` channel never stops
    /// the run; persistence happens regardless of who is listening. When
    /// generation fails after completed steps, the output those steps
    /// produced is persisted before the error event fires; the client
    /// has already seen it streamed.
    pub async fn run_turn(
        &self,
        grant: AccessGrant,
        request: TurnRequest,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Result<TurnReport, TurnError> {
        let ctx = match self.coordinator.begin(&request).await {
            Ok(ctx) => ctx,
            Err(err) => {
                self.emit_error(&events, &err).await;
                return Err(err.into());
            }
        };

        if ctx.created_conversation {
            let coordinator = self.coordinator.clone();
            let conversation_id = ctx.conversation_id;
            let prompt = request.prompt.clone();
            self.background.enqueue("upgrade_title", async move {
                coordinator.upgrade_title(conversation_id, prompt).await;
            });
        }

        let model = match &request.model {
            Some(id) => ModelConfig {
                id: id.clone(),
                ..self.model.clone()
            },
            None => self.model.clone(),
        };
        let outcome = match self
            .step_loop
            .run(ctx.conversation_id, ctx.transcript.clone(), &model, &events)
            .await
        {
            Ok(outcome) => outcome,
            Err(failure) => {
                if !failure.partial.parts.is_empty() {
                    self.coordinator
                        .finalize(&ctx, &failure.partial, grant.billable)
                        .await;
                }
                self.emit_error(&events, &failure.error).await;
                return Err(TurnError {
                    error: failure.error,
                    partial: Some(failure.partial),
                });
            }
        };

        let message = self.coordinator.finalize(&ctx, &outcome, grant.billable).await;
        let _ = events
            .send(GenerationEvent::Finish {
                model: model.id,
                reason: outcome.finish_reason,
                usage: outcome.usage,
            })
            .await;

        Ok(TurnReport {
            conversation_id: ctx.conversation_id,
            message,
            outcome,
        })
    }

    /// Run a scheduled task unattended.
    ///
    /// Each run opens a fresh conversation owned by the task's owner and
    /// goes through the same admission gate and step loop as an
    /// interactive turn. Bookkeeping (status, next run, last-run record)
    /// is written on every terminal path.
    pub async fn run_scheduled(
        &self,
        task_id: &TaskId,
        prompt_override: Option<String>,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Result<TurnReport, TurnError> {
        let task = self
            .coordinator
            .task(task_id)
            .await
            .map_err(|e| TurnError::from(PipelineError::persistence("load_task", e)))?;

        let grant = match self.admit(&task.owner).await {
            Ok(grant) => grant,
            Err(err) => {
                let err = PipelineError::from(err);
                self.emit_error(&events, &err).await;
                return Err(err.into());
            }
        };

        self.coordinator.mark_task_running(task_id).await;

        let prompt = prompt_override.unwrap_or_else(|| task.prompt.clone());
        let request = TurnRequest::new_conversation(task.owner, prompt);
        let conversation_id = request.conversation_id;
        let started = Instant::now();

        let result = self.run_turn(grant, request, events).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let run_result = match &result {
            Ok(report) => Ok(&report.outcome),
            Err(err) => Err(err),
        };
        self.coordinator
            .finalize_task_run(&task, conversation_id, run_result, duration_ms)
            .await;

        result
    }

    async fn emit_error(&self, events: &mpsc::Sender<GenerationEvent>, err: &PipelineError) {
        let message = if err.is_user_visible() {
            err.to_string()
        } else {
            "generation failed".to_string()
        };
        let _ = events.send(GenerationEvent::Error { message }).await;
    }
}
