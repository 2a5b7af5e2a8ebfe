use crate::types::{ConversationStatus, DeliveryStatus, Message};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::trace;

pub const TOPIC_CONVERSATION_UPDATED: &str = "conversation:updated";
pub const TOPIC_MESSAGE_NEW: &str = "message:new";
pub const TOPIC_MESSAGE_STATUS: &str = "message:status";

/// Why a conversation changed, as shown to real-time subscribers.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    NewMessage,
    BotResponse,
    StatusUpdated,
}

/// A state change worth pushing to connected clients.
#[derive(Debug, Clone)]
pub enum Event {
    ConversationUpdated {
        conversation_id: String,
        status: ConversationStatus,
        kind: UpdateKind,
    },
    MessageNew {
        conversation_id: String,
        message: Message,
    },
    MessageStatus {
        message_id: String,
        status: DeliveryStatus,
    },
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::ConversationUpdated { .. } => TOPIC_CONVERSATION_UPDATED,
            Event::MessageNew { .. } => TOPIC_MESSAGE_NEW,
            Event::MessageStatus { .. } => TOPIC_MESSAGE_STATUS,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Event::ConversationUpdated {
                conversation_id,
                status,
                kind,
            } => json!({
                "id": conversation_id,
                "status": status,
                "type": kind,
            }),
            Event::MessageNew {
                conversation_id,
                message,
            } => json!({
                "conversation_id": conversation_id,
                "message": message,
            }),
            Event::MessageStatus { message_id, status } => json!({
                "message_id": message_id,
                "status": status,
            }),
        }
    }
}

/// Fire-and-forget fan-out of events.
///
/// Implementations must never block and never fail: a publish with nobody
/// listening is simply dropped.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

pub struct MessageBus {
    tx: broadcast::Sender<Event>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventPublisher for MessageBus {
    fn publish(&self, event: Event) {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(receivers) => trace!(topic, receivers, "event published"),
            Err(_) => trace!(topic, "event dropped, no subscribers"),
        }
    }
}

/// Publisher that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: Event) {}
}
