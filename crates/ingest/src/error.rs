use chatdesk_persistence::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("conversation {0} disappeared mid-processing")]
    ConversationVanished(String),
}
