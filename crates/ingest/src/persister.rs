use crate::envelope::MessageContent;
use chatdesk_core::types::{DeliveryStatus, Direction, Message, MessageKind};
use chatdesk_persistence::{ConversationStore, InsertOutcome, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A message write and whether it actually created a row.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub message: Message,
    pub outcome: InsertOutcome,
}

impl Recorded {
    pub fn is_new(&self) -> bool {
        self.outcome == InsertOutcome::Inserted
    }
}

/// Writes messages and their delivery transitions.
#[derive(Clone)]
pub struct MessagePersister {
    store: Arc<dyn ConversationStore>,
}

impl MessagePersister {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Store an inbound message under the provider's id.
    ///
    /// A second write with the same id is reported as `AlreadyRecorded`,
    /// never as an error.
    pub async fn record_inbound(
        &self,
        conversation_id: &str,
        external_id: &str,
        content: &MessageContent,
    ) -> Result<Recorded, StoreError> {
        let message = Message {
            id: external_id.to_string(),
            conversation_id: conversation_id.to_string(),
            direction: Direction::Inbound,
            content: content.content.clone(),
            kind: content.kind,
            status: DeliveryStatus::Delivered,
            media_ref: content.media_ref.clone(),
            timestamp: Utc::now(),
        };

        let outcome = self.store.insert_message(&message).await?;
        match outcome {
            InsertOutcome::Inserted => debug!(message_id = %external_id, "inbound message saved"),
            InsertOutcome::AlreadyRecorded => {
                info!(message_id = %external_id, "message already recorded")
            }
        }
        Ok(Recorded { message, outcome })
    }

    /// Store an outbound message under a generated id.
    pub async fn record_outbound(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message, StoreError> {
        let message = Message {
            id: generate_outbound_id(),
            conversation_id: conversation_id.to_string(),
            direction: Direction::Outbound,
            content: content.to_string(),
            kind,
            status: DeliveryStatus::Sent,
            media_ref: None,
            timestamp: Utc::now(),
        };

        if self.store.insert_message(&message).await? == InsertOutcome::AlreadyRecorded {
            info!(message_id = %message.id, "message already recorded");
        }
        Ok(message)
    }

    /// Apply a delivery status. Unknown ids are a silent no-op.
    pub async fn update_status(
        &self,
        external_id: &str,
        status: DeliveryStatus,
    ) -> Result<Option<Message>, StoreError> {
        let updated = self.store.update_message_status(external_id, status).await?;
        if updated.is_none() {
            debug!(message_id = %external_id, %status, "status for unknown message ignored");
        }
        Ok(updated)
    }
}

/// `bot-<unix millis>-<6 hex chars>`; unique in practice, not by construction.
pub fn generate_outbound_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("bot-{}-{}", Utc::now().timestamp_millis(), &suffix[..6])
}
