use crate::envelope::{InboundEvent, StatusEvent};
use crate::error::IngestError;
use crate::persister::MessagePersister;
use crate::relay::{BotRelay, RelayOrchestrator};
use crate::resolver::ContactResolver;
use chatdesk_core::bus::{Event, EventPublisher, UpdateKind};
use chatdesk_core::metrics::MetricsStore;
use chatdesk_core::types::{Conversation, ConversationStatus};
use chatdesk_persistence::ConversationStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything that happens to one inbound event once it reaches the front of
/// its contact's lane: resolve, persist, publish, relay.
pub struct Pipeline {
    store: Arc<dyn ConversationStore>,
    resolver: ContactResolver,
    persister: MessagePersister,
    orchestrator: RelayOrchestrator,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsStore>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        publisher: Arc<dyn EventPublisher>,
        relay: Option<Arc<dyn BotRelay>>,
        relay_timeout: Duration,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            resolver: ContactResolver::new(store.clone()),
            persister: MessagePersister::new(store.clone()),
            orchestrator: RelayOrchestrator::new(
                relay,
                relay_timeout,
                store.clone(),
                publisher.clone(),
                metrics.clone(),
            ),
            store,
            publisher,
            metrics,
        }
    }

    pub async fn handle_message(
        &self,
        event: InboundEvent,
        envelope: Arc<Value>,
    ) -> Result<(), IngestError> {
        // Replayed after the in-memory window (e.g. across a restart): the
        // first delivery already resolved, published and relayed.
        if self.store.get_message(&event.message_id).await?.is_some() {
            info!(message_id = %event.message_id, "message already recorded, replay ignored");
            return Ok(());
        }

        let (contact, conversation) = self
            .resolver
            .resolve(&event.phone, event.display_name.as_deref())
            .await?;

        let recorded = self
            .persister
            .record_inbound(&conversation.id, &event.message_id, &event.content)
            .await?;
        if !recorded.is_new() {
            return Ok(());
        }

        self.metrics.inc_messages_in();
        info!(
            phone = %event.phone,
            contact_id = %contact.id,
            conversation_id = %conversation.id,
            message_id = %event.message_id,
            "inbound message recorded"
        );

        self.publisher.publish(Event::ConversationUpdated {
            conversation_id: conversation.id.clone(),
            status: conversation.status,
            kind: UpdateKind::NewMessage,
        });
        self.publisher.publish(Event::MessageNew {
            conversation_id: conversation.id.clone(),
            message: recorded.message,
        });

        self.orchestrator.relay(&conversation, &envelope).await?;
        Ok(())
    }

    /// Move a conversation to `status` on behalf of an operator and tell
    /// subscribers. Returns `None` for an unknown conversation.
    pub async fn transition_conversation(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> Result<Option<Conversation>, IngestError> {
        let Some(conversation) = self
            .store
            .set_conversation_status(conversation_id, status, false)
            .await?
        else {
            return Ok(None);
        };

        info!(conversation_id, status = %conversation.status, "conversation status changed");
        self.publisher.publish(Event::ConversationUpdated {
            conversation_id: conversation.id.clone(),
            status: conversation.status,
            kind: UpdateKind::StatusUpdated,
        });
        Ok(Some(conversation))
    }

    /// Delivery receipts never fail the caller; problems are only logged.
    pub async fn handle_status(&self, event: StatusEvent) -> Result<(), IngestError> {
        match self.persister.update_status(&event.message_id, event.status).await {
            Ok(Some(message)) => {
                self.metrics.inc_status_updates();
                info!(message_id = %message.id, status = %message.status, "delivery status updated");
                self.publisher.publish(Event::MessageStatus {
                    message_id: message.id,
                    status: message.status,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(message_id = %event.message_id, error = %e, "delivery status not applied");
            }
        }
        Ok(())
    }
}
