//! Scheduled ("lookout") task types.
//!
//! A scheduled task runs the same generation pipeline unattended, on a
//! recurrence rule or once. Cron-expression parsing is an external
//! collaborator behind [`CronSchedule`]; this crate only carries the
//! expression and timezone.

use crate::identifiers::{ConversationId, TaskId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When a task runs again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// One-shot: after a successful run the task parks as `Paused`.
    Once,
    /// Recurring on a cron expression evaluated in `timezone`.
    Cron { expression: String, timezone: String },
}

impl Recurrence {
    pub fn is_recurring(&self) -> bool {
        matches!(self, Recurrence::Cron { .. })
    }
}

/// Operational status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Running,
    Paused,
}

/// How the last run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Error,
}

/// Bookkeeping recorded after every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRun {
    pub at: DateTime<Utc>,
    pub conversation_id: ConversationId,
    pub outcome: RunOutcome,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub premium_invocations: u32,
    pub error: Option<String>,
}

/// An unattended job bound to a user and a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub owner: UserId,
    pub prompt: String,
    pub recurrence: Recurrence,
    pub status: TaskStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run: Option<LastRun>,
}

impl ScheduledTask {
    /// A new active task with no run history.
    pub fn new(owner: UserId, prompt: impl Into<String>, recurrence: Recurrence) -> Self {
        Self {
            id: TaskId::generate(),
            owner,
            prompt: prompt.into(),
            recurrence,
            status: TaskStatus::Active,
            next_run_at: None,
            last_run: None,
        }
    }
}

/// External collaborator that evaluates cron expressions.
///
/// `next_after` returns the next fire time strictly after `after`,
/// evaluated in the rule's timezone, or `None` when the expression or
/// timezone cannot be evaluated.
pub trait CronSchedule: Send + Sync {
    fn next_after(
        &self,
        expression: &str,
        timezone: &str,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}
