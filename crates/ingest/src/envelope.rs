//! Provider webhook payloads.
//!
//! The provider nests everything as `entry[].changes[].value`, where a value
//! carries either inbound `messages` (with sender `contacts`) or delivery
//! `statuses`. Only the fields the pipeline reads are modelled; everything
//! else is ignored.

use chatdesk_core::types::{DeliveryStatus, MessageKind};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// `object` value of envelopes the pipeline handles.
pub const WHATSAPP_OBJECT: &str = "whatsapp_business_account";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported envelope object: {0:?}")]
    UnsupportedObject(String),
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    value: ChangeValue,
}

/// Items stay raw so one badly shaped entry cannot sink its siblings.
#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    contacts: Vec<Value>,
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    statuses: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ProfileContact {
    wa_id: Option<String>,
    profile: Option<Profile>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<String>,
    from: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<TextPart>,
    image: Option<MediaPart>,
    audio: Option<MediaPart>,
    video: Option<MediaPart>,
    document: Option<MediaPart>,
    location: Option<LocationPart>,
    interactive: Option<InteractivePart>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaPart {
    id: Option<String>,
    caption: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocationPart {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct InteractivePart {
    #[serde(rename = "type")]
    kind: Option<String>,
    button_reply: Option<ReplyPart>,
    list_reply: Option<ReplyPart>,
}

#[derive(Debug, Deserialize)]
struct ReplyPart {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    id: Option<String>,
    status: Option<String>,
    recipient_id: Option<String>,
}

/// Normalized message body ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContent {
    pub content: String,
    pub kind: MessageKind,
    pub media_ref: Option<String>,
}

impl MessageContent {
    fn new(content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            content: content.into(),
            kind,
            media_ref: None,
        }
    }

    fn with_media(mut self, media: Option<&MediaPart>) -> Self {
        self.media_ref = media.and_then(|m| m.id.clone());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub message_id: String,
    pub phone: String,
    pub display_name: Option<String>,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub message_id: String,
    pub status: DeliveryStatus,
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    Message(InboundEvent),
    Status(StatusEvent),
}

/// Flatten an envelope into events, in document order.
///
/// Individual messages or statuses missing their identifiers are skipped with
/// a warning rather than failing the whole envelope.
pub fn parse_envelope(raw: &Value) -> Result<Vec<WebhookEvent>, EnvelopeError> {
    let envelope = WebhookEnvelope::deserialize(raw)?;
    if envelope.object != WHATSAPP_OBJECT {
        return Err(EnvelopeError::UnsupportedObject(envelope.object));
    }

    let mut events = Vec::new();
    for change in envelope.entry.into_iter().flat_map(|e| e.changes) {
        let value = change.value;
        let contacts: Vec<ProfileContact> = value
            .contacts
            .iter()
            .filter_map(|raw| decode_item(raw, "contact"))
            .collect();

        for raw in &value.messages {
            let Some(message) = decode_item::<RawMessage>(raw, "message") else {
                continue;
            };
            match inbound_event(&message, &contacts) {
                Some(event) => events.push(WebhookEvent::Message(event)),
                None => warn!(message_id = ?message.id, "skipping message without id or sender"),
            }
        }

        for status in value
            .statuses
            .iter()
            .filter_map(|raw| decode_item::<RawStatus>(raw, "status"))
        {
            let (Some(message_id), Some(raw_status)) = (status.id, status.status) else {
                warn!("skipping status without message id or status");
                continue;
            };
            match raw_status.parse::<DeliveryStatus>() {
                Ok(status_value) => events.push(WebhookEvent::Status(StatusEvent {
                    message_id,
                    status: status_value,
                    recipient: status.recipient_id,
                })),
                Err(e) => debug!(message_id = %message_id, error = %e, "ignoring status"),
            }
        }
    }

    Ok(events)
}

fn decode_item<T: DeserializeOwned>(raw: &Value, what: &str) -> Option<T> {
    match T::deserialize(raw) {
        Ok(item) => Some(item),
        Err(e) => {
            warn!(
                id = ?raw.get("id").and_then(serde_json::Value::as_str),
                error = %e,
                "skipping malformed {what}"
            );
            None
        }
    }
}

fn inbound_event(message: &RawMessage, contacts: &[ProfileContact]) -> Option<InboundEvent> {
    let message_id = message.id.clone().filter(|id| !id.is_empty())?;

    // A sender missing from `contacts` keeps its own number; the first
    // profile only stands in when the message names no sender at all.
    let profile = match message.from.as_deref() {
        Some(from) => contacts.iter().find(|c| c.wa_id.as_deref() == Some(from)),
        None => contacts.first(),
    };

    let phone = profile
        .and_then(|c| c.wa_id.clone())
        .or_else(|| message.from.clone())
        .filter(|p| !p.is_empty())?;

    let display_name = profile
        .and_then(|c| c.profile.as_ref())
        .and_then(|p| p.name.clone())
        .filter(|n| !n.trim().is_empty());

    Some(InboundEvent {
        message_id,
        phone,
        display_name,
        content: extract_content(message),
    })
}

fn extract_content(message: &RawMessage) -> MessageContent {
    let kind = message.kind.as_deref().unwrap_or("text");
    let caption_or = |part: Option<&MediaPart>, fallback: &str| {
        part.and_then(|p| p.caption.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    };

    match kind {
        "text" => MessageContent::new(
            message
                .text
                .as_ref()
                .and_then(|t| t.body.clone())
                .unwrap_or_default(),
            MessageKind::Text,
        ),
        "image" => MessageContent::new(
            caption_or(message.image.as_ref(), "[Image]"),
            MessageKind::Image,
        )
        .with_media(message.image.as_ref()),
        "audio" => {
            MessageContent::new("[Audio]", MessageKind::Audio).with_media(message.audio.as_ref())
        }
        "video" => MessageContent::new(
            caption_or(message.video.as_ref(), "[Video]"),
            MessageKind::Video,
        )
        .with_media(message.video.as_ref()),
        "document" => MessageContent::new(
            message
                .document
                .as_ref()
                .and_then(|d| d.filename.clone())
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| "[Document]".to_string()),
            MessageKind::Document,
        )
        .with_media(message.document.as_ref()),
        "location" => {
            let (lat, lng) = message
                .location
                .as_ref()
                .map(|l| (l.latitude, l.longitude))
                .unwrap_or_default();
            let coord = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_else(|| "?".into());
            MessageContent::new(
                format!("📍 {}, {}", coord(lat), coord(lng)),
                MessageKind::Location,
            )
        }
        "interactive" => {
            let interactive = message.interactive.as_ref();
            let reply = match interactive.and_then(|i| i.kind.as_deref()) {
                Some("button_reply") => interactive.and_then(|i| i.button_reply.as_ref()),
                Some("list_reply") => interactive.and_then(|i| i.list_reply.as_ref()),
                _ => None,
            };
            let content = match reply {
                Some(r) => r.title.clone().unwrap_or_default(),
                None => "[Interactive]".to_string(),
            };
            MessageContent::new(content, MessageKind::Text)
        }
        other => MessageContent::new(format!("[{other}]"), MessageKind::Text),
    }
}
