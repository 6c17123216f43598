//! Resumable streams.
//!
//! A client that loses its SSE connection mid-generation can reconnect
//! and resume. Three cases, checked in order:
//!
//! 1. The generation is still running: tail its live broadcast.
//! 2. It finished recently (the latest persisted message is an assistant
//!    message younger than the resume window): replay that message as a
//!    single synthesized event.
//! 3. Otherwise there is nothing to resume: the stream is gone and the
//!    client falls back to fetching the conversation.
//!
//! Resumption is an optional service; a deployment without it degrades
//! to every reconnect being case 3.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tidepool_core::{
    ConversationId, ConversationStore, GenerationEvent, Message, Role, StreamHandleId,
};
use tokio::sync::broadcast;

/// What a reconnecting client gets.
pub enum ResumeOutcome {
    /// The generation is live; tail it from here on.
    Live(broadcast::Receiver<GenerationEvent>),
    /// The generation finished moments ago; here is its message.
    Replay(Message),
    /// Nothing to resume.
    Gone,
}

struct HandleEntry {
    id: StreamHandleId,
    created_at: chrono::DateTime<Utc>,
    sender: broadcast::Sender<GenerationEvent>,
}

/// Live-generation handles, one per conversation.
///
/// A conversation has at most one in-flight generation; registering over
/// an existing handle replaces it (last writer wins) so a crashed run
/// never wedges its conversation.
pub struct StreamHandleRegistry {
    handles: DashMap<ConversationId, HandleEntry>,
    store: Arc<dyn ConversationStore>,
    window: Duration,
    capacity: usize,
}

impl StreamHandleRegistry {
    pub fn new(store: Arc<dyn ConversationStore>, window: Duration, capacity: usize) -> Self {
        Self {
            handles: DashMap::new(),
            store,
            window,
            capacity,
        }
    }

    /// Register a live generation. Events sent on the returned sender
    /// reach every subscriber that resumed onto this conversation.
    pub fn register(&self, conversation_id: ConversationId) -> broadcast::Sender<GenerationEvent> {
        let (sender, _) = broadcast::channel(self.capacity);
        let entry = HandleEntry {
            id: StreamHandleId::generate(),
            created_at: Utc::now(),
            sender: sender.clone(),
        };
        if let Some(previous) = self.handles.insert(conversation_id, entry) {
            tracing::debug!(
                conversation = %conversation_id,
                replaced = %previous.id,
                "replaced live stream handle"
            );
        }
        sender
    }

    /// Drop the live handle once the generation has emitted its terminal
    /// event. Subsequent resumes go through the persisted-replay path.
    pub fn complete(&self, conversation_id: &ConversationId) {
        self.handles.remove(conversation_id);
    }

    pub fn live_count(&self) -> usize {
        self.handles.len()
    }

    pub async fn resume(&self, conversation_id: &ConversationId) -> ResumeOutcome {
        if let Some(entry) = self.handles.get(conversation_id) {
            tracing::debug!(
                conversation = %conversation_id,
                handle = %entry.id,
                age_ms = (Utc::now() - entry.created_at).num_milliseconds(),
                "resuming onto live stream"
            );
            return ResumeOutcome::Live(entry.sender.subscribe());
        }

        match self.store.latest_messages(conversation_id, 1).await {
            Ok(messages) => match messages.into_iter().next() {
                Some(message) if self.replayable(&message) => ResumeOutcome::Replay(message),
                _ => ResumeOutcome::Gone,
            },
            Err(err) => {
                tracing::warn!(
                    conversation = %conversation_id,
                    error = %err,
                    "replay lookup failed"
                );
                ResumeOutcome::Gone
            }
        }
    }

    fn replayable(&self, message: &Message) -> bool {
        if message.role != Role::Assistant {
            return false;
        }
        let age = Utc::now() - message.created_at;
        age.to_std().map(|age| age <= self.window).unwrap_or(false)
    }
}

/// The resumption service as the handlers see it. `disabled()` turns
/// every resume into [`ResumeOutcome::Gone`] without touching the rest
/// of the transport.
#[derive(Clone)]
pub struct ResumableStreams {
    registry: Option<Arc<StreamHandleRegistry>>,
}

impl ResumableStreams {
    pub fn enabled(registry: Arc<StreamHandleRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Resumption unsupported; reconnects always come back empty.
    pub fn disabled() -> Self {
        Self { registry: None }
    }

    pub fn register(
        &self,
        conversation_id: ConversationId,
    ) -> Option<broadcast::Sender<GenerationEvent>> {
        self.registry
            .as_ref()
            .map(|registry| registry.register(conversation_id))
    }

    pub fn complete(&self, conversation_id: &ConversationId) {
        if let Some(registry) = &self.registry {
            registry.complete(conversation_id);
        }
    }

    pub async fn resume(&self, conversation_id: &ConversationId) -> ResumeOutcome {
        match &self.registry {
            Some(registry) => registry.resume(conversation_id).await,
            None => ResumeOutcome::Gone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::{InMemoryConversationStore, MessagePart, Usage, UserId, Conversation};

    fn registry_with_store() -> (Arc<InMemoryConversationStore>, StreamHandleRegistry) {
        let store = Arc::new(InMemoryConversationStore::new());
        let registry = StreamHandleRegistry::new(store.clone(), Duration::from_secs(15), 16);
        (store, registry)
    }

    async fn seeded_conversation(store: &Arc<InMemoryConversationStore>) -> ConversationId {
        let conversation = Conversation::begin(UserId::generate(), "hello");
        let id = conversation.id;
        tidepool_core::ConversationStore::create_conversation(store.as_ref(), conversation)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn live_handle_wins_over_replay() {
        let (store, registry) = registry_with_store();
        let id = seeded_conversation(&store).await;

        let sender = registry.register(id);
        let outcome = registry.resume(&id).await;
        let mut receiver = match outcome {
            ResumeOutcome::Live(receiver) => receiver,
            _ => panic!("expected live resume"),
        };

        sender
            .send(GenerationEvent::TextDelta {
                delta: "hi".to_string(),
            })
            .unwrap();
        assert!(matches!(
            receiver.recv().await,
            Ok(GenerationEvent::TextDelta { .. })
        ));
    }

    #[tokio::test]
    async fn recent_assistant_message_replays_after_completion() {
        let (store, registry) = registry_with_store();
        let id = seeded_conversation(&store).await;

        registry.register(id);
        let message = Message::assistant(
            id,
            vec![MessagePart::Text {
                text: "the answer".to_string(),
            }],
            Usage::default(),
        );
        tidepool_core::ConversationStore::append_message(store.as_ref(), message)
            .await
            .unwrap();
        registry.complete(&id);

        match registry.resume(&id).await {
            ResumeOutcome::Replay(message) => assert_eq!(message.text(), "the answer"),
            _ => panic!("expected replay"),
        }
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn stale_or_user_latest_message_is_gone() {
        let (store, registry) = registry_with_store();
        let id = seeded_conversation(&store).await;

        // Latest message is the user's; nothing to replay.
        tidepool_core::ConversationStore::append_message(
            store.as_ref(),
            Message::user(id, "still there?"),
        )
        .await
        .unwrap();
        assert!(matches!(registry.resume(&id).await, ResumeOutcome::Gone));

        // An assistant message outside the window is also gone.
        let mut message = Message::assistant(
            id,
            vec![MessagePart::Text {
                text: "old".to_string(),
            }],
            Usage::default(),
        );
        message.created_at = Utc::now() - chrono::Duration::seconds(60);
        tidepool_core::ConversationStore::append_message(store.as_ref(), message)
            .await
            .unwrap();
        assert!(matches!(registry.resume(&id).await, ResumeOutcome::Gone));
    }

    #[tokio::test]
    async fn re_registration_replaces_the_previous_handle() {
        let (store, registry) = registry_with_store();
        let id = seeded_conversation(&store).await;

        let first = registry.register(id);
        let second = registry.register(id);
        assert_eq!(registry.live_count(), 1);

        let ResumeOutcome::Live(mut receiver) = registry.resume(&id).await else {
            panic!("expected live resume");
        };
        drop(first);
        second
            .send(GenerationEvent::TextDelta {
                delta: "new".to_string(),
            })
            .unwrap();
        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn disabled_service_never_resumes() {
        let streams = ResumableStreams::disabled();
        let id = ConversationId::generate();
        assert!(streams.register(id).is_none());
        assert!(matches!(streams.resume(&id).await, ResumeOutcome::Gone));
    }
}
