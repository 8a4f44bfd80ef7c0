use chrono::{DateTime, Utc};

use crate::api::models::{MessageType, WireChatMessage};

/// Where a message entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOrigin {
    Poll,
    Channel,
    OptimisticLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Image { url: String, caption: String },
}

impl MessageBody {
    pub fn text(&self) -> &str {
        match self {
            MessageBody::Text(text) => text,
            MessageBody::Image { caption, .. } => caption,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Text(_) => MessageType::Text,
            MessageBody::Image { .. } => MessageType::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub body: MessageBody,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
    pub origin: DeliveryOrigin,
    pub status: DeliveryStatus,
}

impl ChatMessage {
    /// Convert a server message. `fallback_time` stands in for a missing `created_at`.
    pub fn from_wire(
        wire: WireChatMessage,
        conversation_id: &str,
        origin: DeliveryOrigin,
        fallback_time: DateTime<Utc>,
    ) -> Self {
        let body = match (wire.message_type.as_deref(), wire.image_url) {
            (Some("image"), Some(url)) => MessageBody::Image {
                url,
                caption: wire.message_text,
            },
            _ => MessageBody::Text(wire.message_text),
        };
        Self {
            id: wire.id,
            conversation_id: wire
                .booking_id
                .unwrap_or_else(|| conversation_id.to_string()),
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            body,
            sent_at: wire.created_at.unwrap_or(fallback_time),
            read: wire.is_read,
            origin,
            status: DeliveryStatus::Sent,
        }
    }

    /// Local placeholder shown while a send is in flight.
    pub fn optimistic(
        temp_id: String,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        text: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: temp_id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: Some(receiver_id.to_string()),
            body: MessageBody::Text(text),
            sent_at: now,
            read: true,
            origin: DeliveryOrigin::OptimisticLocal,
            status: DeliveryStatus::Sending,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.origin == DeliveryOrigin::OptimisticLocal
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DeliveryStatus::Failed { .. })
    }

    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.sent_at, self.id.as_str())
    }
}
