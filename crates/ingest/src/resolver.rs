use chatdesk_core::types::{Contact, Conversation, ConversationStatus};
use chatdesk_persistence::{ConversationStore, StoreError};
use std::sync::Arc;
use tracing::info;

/// Turns a phone number into a durable contact and its active conversation.
///
/// Not safe to run concurrently for the same phone: callers go through the
/// per-contact sequencer so two deliveries cannot both create a conversation.
#[derive(Clone)]
pub struct ContactResolver {
    store: Arc<dyn ConversationStore>,
}

impl ContactResolver {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        phone: &str,
        display_name: Option<&str>,
    ) -> Result<(Contact, Conversation), StoreError> {
        let contact = self.store.upsert_contact(phone, display_name).await?;

        if let Some(existing) = self.store.latest_conversation(&contact.id).await? {
            if let Some(conversation) = self
                .store
                .set_conversation_status(&existing.id, ConversationStatus::Unread, true)
                .await?
            {
                return Ok((contact, conversation));
            }
        }

        let conversation = self
            .store
            .create_conversation(&contact.id, ConversationStatus::Unread, true)
            .await?;
        info!(
            phone = %phone,
            contact_id = %contact.id,
            conversation_id = %conversation.id,
            "conversation created"
        );
        Ok((contact, conversation))
    }
}
