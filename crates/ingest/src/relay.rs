use crate::error::IngestError;
use crate::persister::MessagePersister;
use async_trait::async_trait;
use chatdesk_core::bus::{Event, EventPublisher, UpdateKind};
use chatdesk_core::config::RelayConfig;
use chatdesk_core::metrics::MetricsStore;
use chatdesk_core::types::{Conversation, ConversationStatus, Message, MessageKind};
use chatdesk_persistence::ConversationStore;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay transport error: {0}")]
    Transport(String),
    #[error("relay returned HTTP {0}")]
    Status(u16),
}

/// External automation endpoint that may answer an inbound event.
#[async_trait]
pub trait BotRelay: Send + Sync {
    /// Forward the raw envelope; `Ok(None)` means the bot chose not to reply.
    async fn forward(&self, envelope: &Value) -> Result<Option<String>, RelayError>;
}

/// Relay over HTTP: POSTs the envelope and reads `{"response": "..."}` back.
pub struct HttpRelay {
    client: Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
            timeout,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.url.clone(),
            config.token.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    fn map_error(&self, err: reqwest::Error) -> RelayError {
        if err.is_timeout() {
            RelayError::Timeout(self.timeout)
        } else {
            RelayError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl BotRelay for HttpRelay {
    async fn forward(&self, envelope: &Value) -> Result<Option<String>, RelayError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(envelope);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| self.map_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Status(status.as_u16()));
        }

        let body = resp.bytes().await.map_err(|e| self.map_error(e))?;
        Ok(reply_text(&body))
    }
}

/// Pull a non-blank `response` string out of a relay reply body.
fn reply_text(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => value
            .get("response")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        Err(e) => {
            debug!(error = %e, "relay reply is not JSON, treating as no reply");
            None
        }
    }
}

/// Hands inbound events to the bot and records whatever it answers.
///
/// Side effects happen at most once per call: one relay request, no retries.
#[derive(Clone)]
pub struct RelayOrchestrator {
    relay: Option<Arc<dyn BotRelay>>,
    timeout: Duration,
    store: Arc<dyn ConversationStore>,
    persister: MessagePersister,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsStore>,
}

impl RelayOrchestrator {
    pub fn new(
        relay: Option<Arc<dyn BotRelay>>,
        timeout: Duration,
        store: Arc<dyn ConversationStore>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            relay,
            timeout,
            persister: MessagePersister::new(store.clone()),
            store,
            publisher,
            metrics,
        }
    }

    /// Relay `envelope` for `conversation` and persist the bot's reply.
    ///
    /// Returns the stored reply, or `None` when the bot is disabled, no relay
    /// is configured, the relay failed or timed out, or it had nothing to say.
    pub async fn relay(
        &self,
        conversation: &Conversation,
        envelope: &Value,
    ) -> Result<Option<Message>, IngestError> {
        let Some(relay) = &self.relay else {
            return Ok(None);
        };
        if !conversation.bot_enabled {
            debug!(conversation_id = %conversation.id, "bot disabled, relay skipped");
            return Ok(None);
        }

        let reply = match tokio::time::timeout(self.timeout, relay.forward(envelope)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.metrics.inc_relay_failures();
                warn!(conversation_id = %conversation.id, error = %e, "relay call failed");
                return Ok(None);
            }
            Err(_) => {
                self.metrics.inc_relay_failures();
                warn!(
                    conversation_id = %conversation.id,
                    timeout_secs = self.timeout.as_secs(),
                    "relay call timed out"
                );
                return Ok(None);
            }
        };

        let Some(text) = reply else {
            debug!(conversation_id = %conversation.id, "relay produced no reply");
            return Ok(None);
        };

        let message = self
            .persister
            .record_outbound(&conversation.id, &text, MessageKind::Text)
            .await?;
        let updated = self
            .store
            .set_conversation_status(&conversation.id, ConversationStatus::Open, true)
            .await?
            .ok_or_else(|| IngestError::ConversationVanished(conversation.id.clone()))?;

        self.metrics.inc_bot_replies();
        info!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            "bot reply saved"
        );

        self.publisher.publish(Event::MessageNew {
            conversation_id: conversation.id.clone(),
            message: message.clone(),
        });
        self.publisher.publish(Event::ConversationUpdated {
            conversation_id: conversation.id.clone(),
            status: updated.status,
            kind: UpdateKind::BotResponse,
        });

        Ok(Some(message))
    }
}
