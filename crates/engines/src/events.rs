//! Typed pub/sub between adapters, the engine manager, and the gateway.
//!
//! Adapters publish into their own [`EventBus`] and hold no reference to
//! whoever listens; the manager subscribes and fans events upward. Built on
//! `tokio::sync::broadcast` so publication never blocks — a lagging
//! subscriber drops events rather than stalling an adapter.

use crate::engine::EngineState;
use crate::model::{EngineType, Message, Part, Permission, Session};
use serde_json::Value;
use tokio::sync::broadcast;

/// Everything an adapter can tell the outside world.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StatusChanged {
        engine: EngineType,
        state: EngineState,
        error: Option<String>,
    },
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionDeleted {
        engine: EngineType,
        session_id: String,
    },
    MessagePartUpdated {
        part: Part,
    },
    MessageUpdated {
        message: Message,
    },
    PermissionAsked {
        permission: Permission,
    },
    PermissionReplied {
        engine: EngineType,
        permission_id: String,
        option_id: Option<String>,
    },
    /// Interactive question prompts from HTTP backends, forwarded opaquely.
    QuestionAsked {
        engine: EngineType,
        payload: Value,
    },
    QuestionReplied {
        engine: EngineType,
        payload: Value,
    },
    QuestionRejected {
        engine: EngineType,
        payload: Value,
    },
}

impl EngineEvent {
    /// Dotted topic name, used verbatim as the notification frame type.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status.changed",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::MessagePartUpdated { .. } => "message.part.updated",
            Self::MessageUpdated { .. } => "message.updated",
            Self::PermissionAsked { .. } => "permission.asked",
            Self::PermissionReplied { .. } => "permission.replied",
            Self::QuestionAsked { .. } => "question.asked",
            Self::QuestionReplied { .. } => "question.replied",
            Self::QuestionRejected { .. } => "question.rejected",
        }
    }
}

const DEFAULT_CAPACITY: usize = 1024;

/// Clonable handle to one broadcast channel of [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Fine to call with no subscribers.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::SessionDeleted {
            engine: EngineType::from("mock"),
            session_id: "s1".into(),
        });
        let event = rx.recv().await.expect("receive event");
        assert_eq!(event.topic(), "session.deleted");
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::SessionDeleted {
            engine: EngineType::from("mock"),
            session_id: "s1".into(),
        });
    }
}
