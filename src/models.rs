use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw delivery as posted by the chat platform.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reply_token: Option<String>,
    #[serde(default)]
    pub source: Option<EventSource>,
    #[serde(default)]
    pub message: Option<EventMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Follow,
    Unfollow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text { text: String },
    Image { media_id: String },
    Other { kind: String },
}

/// One normalized webhook event. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub sender_id: String,
    pub message: Option<InboundMessage>,
    pub reply_token: Option<String>,
}

impl InboundEvent {
    /// Returns `None` for event types this service does not handle or
    /// events without a sender identity.
    pub fn from_webhook(event: WebhookEvent) -> Option<Self> {
        let kind = match event.kind.as_str() {
            "message" => EventKind::Message,
            "follow" => EventKind::Follow,
            "unfollow" => EventKind::Unfollow,
            _ => return None,
        };
        let sender_id = event
            .source
            .and_then(|source| source.user_id)
            .filter(|id| !id.trim().is_empty())?;
        let message = event.message.map(|message| match message.kind.as_str() {
            "text" => InboundMessage::Text {
                text: message.text.unwrap_or_default(),
            },
            "image" => match message.id {
                Some(media_id) if !media_id.is_empty() => InboundMessage::Image { media_id },
                _ => InboundMessage::Other {
                    kind: "image".to_string(),
                },
            },
            other => InboundMessage::Other {
                kind: other.to_string(),
            },
        });
        Some(Self {
            kind,
            sender_id,
            message,
            reply_token: event.reply_token.filter(|token| !token.is_empty()),
        })
    }
}

/// Links an uploaded image to the text expected to follow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub sender_id: String,
    pub media_ref: String,
    pub workflow_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedListing {
    pub listing_id: String,
    pub feed_post_id: Option<String>,
    pub feed_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub processed: usize,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
