//! Store traits and in-memory implementations.
//!
//! The relational schema lives outside this workspace; the pipeline
//! persists through these traits and treats them as transactional. The
//! in-memory implementations back the tests and the default wiring.
//!
//! Usage counters are increment-only from the core's point of view:
//! there is no read-modify-write, so concurrent runs can never lose an
//! increment.

use crate::error::StoreError;
use crate::identifiers::{ConversationId, TaskId, UserId};
use crate::message::{Conversation, Message};
use crate::schedule::{LastRun, ScheduledTask, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Conversation and message persistence.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;

    /// Append a message. Ordering within a conversation is insertion
    /// order and is monotonic.
    async fn append_message(&self, message: Message) -> Result<(), StoreError>;

    /// The most recent `limit` messages, oldest first.
    async fn latest_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn set_title(
        &self,
        conversation_id: &ConversationId,
        title: String,
    ) -> Result<(), StoreError>;
}

/// Atomic usage counters, bucketed per owner and calendar month.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn increment_messages(&self, owner: &UserId) -> Result<(), StoreError>;
    async fn increment_premium_tools(&self, owner: &UserId) -> Result<(), StoreError>;
}

/// Scheduled-task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: &TaskId) -> Result<ScheduledTask, StoreError>;

    async fn set_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), StoreError>;

    /// Record a finished run: last-run metadata, the next fire time (if
    /// any) and the resulting status, in one write.
    async fn record_run(
        &self,
        id: &TaskId,
        last_run: LastRun,
        next_run_at: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> Result<(), StoreError>;
}

fn lock_error<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable {
        reason: "store lock poisoned".to_string(),
    }
}

/// In-memory conversation store.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
    messages: Mutex<HashMap<ConversationId, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages of a conversation, oldest first. Test helper.
    pub fn all_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.messages
            .lock()
            .map(|messages| messages.get(conversation_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations
            .lock()
            .map(|conversations| conversations.len())
            .unwrap_or(0)
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.conversations
            .lock()
            .ok()
            .and_then(|conversations| conversations.get(conversation_id).cloned())
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut conversations = self.conversations.lock().map_err(lock_error)?;
        conversations.insert(conversation.id, conversation);
        Ok(())
    }

    async fn append_message(&self, message: Message) -> Result<(), StoreError> {
        {
            let conversations = self.conversations.lock().map_err(lock_error)?;
            if !conversations.contains_key(&message.conversation_id) {
                return Err(StoreError::ConversationNotFound {
                    id: message.conversation_id.to_string(),
                });
            }
        }
        let mut messages = self.messages.lock().map_err(lock_error)?;
        messages
            .entry(message.conversation_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn latest_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.lock().map_err(lock_error)?;
        let all = messages.get(conversation_id).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn set_title(
        &self,
        conversation_id: &ConversationId,
        title: String,
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.lock().map_err(lock_error)?;
        match conversations.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.title = title;
                Ok(())
            }
            None => Err(StoreError::ConversationNotFound {
                id: conversation_id.to_string(),
            }),
        }
    }
}

/// Current `YYYY-MM` billing period.
fn current_period() -> String {
    let now = Utc::now();
    format!("{:04}-{:02}", now.year(), now.month())
}

/// In-memory usage ledger with per-(owner, period) counters.
#[derive(Default)]
pub struct InMemoryUsageLedger {
    messages: Mutex<HashMap<(UserId, String), u64>>,
    premium_tools: Mutex<HashMap<(UserId, String), u64>>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self, owner: &UserId) -> u64 {
        self.messages
            .lock()
            .map(|counters| {
                counters
                    .get(&(*owner, current_period()))
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn premium_count(&self, owner: &UserId) -> u64 {
        self.premium_tools
            .lock()
            .map(|counters| {
                counters
                    .get(&(*owner, current_period()))
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn increment_messages(&self, owner: &UserId) -> Result<(), StoreError> {
        let mut counters = self.messages.lock().map_err(lock_error)?;
        *counters.entry((*owner, current_period())).or_insert(0) += 1;
        Ok(())
    }

    async fn increment_premium_tools(&self, owner: &UserId) -> Result<(), StoreError> {
        let mut counters = self.premium_tools.lock().map_err(lock_error)?;
        *counters.entry((*owner, current_period())).or_insert(0) += 1;
        Ok(())
    }
}

/// In-memory scheduled-task store.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, ScheduledTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: ScheduledTask) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(task.id, task);
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, id: &TaskId) -> Result<ScheduledTask, StoreError> {
        let tasks = self.tasks.lock().map_err(lock_error)?;
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound { id: id.to_string() })
    }

    async fn set_status(&self, id: &TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().map_err(lock_error)?;
        match tasks.get_mut(id) {
            Some(task) => {
                task.status = status;
                Ok(())
            }
            None => Err(StoreError::TaskNotFound { id: id.to_string() }),
        }
    }

    async fn record_run(
        &self,
        id: &TaskId,
        last_run: LastRun,
        next_run_at: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().map_err(lock_error)?;
        match tasks.get_mut(id) {
            Some(task) => {
                task.last_run = Some(last_run);
                task.next_run_at = next_run_at;
                task.status = status;
                Ok(())
            }
            None => Err(StoreError::TaskNotFound { id: id.to_string() }),
        }
    }
}
