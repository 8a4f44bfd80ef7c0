//! Wire models shared by the REST endpoints and the duplex channel.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

/// Notification as returned by `GET /{role}/notifications` and pushed as `new_notification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
}

impl Notification {
    /// Text shown in the alert toast.
    pub fn alert_text(&self) -> String {
        match (self.title.is_empty(), self.message.is_empty()) {
            (false, false) => format!("{}: {}", self.title, self.message),
            (false, true) => self.title.clone(),
            (true, _) => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationPage {
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

/// Chat message as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChatMessage {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub booking_id: Option<String>,
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub message_text: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatHistory {
    #[serde(default)]
    pub messages: Vec<WireChatMessage>,
}

/// `POST .../chat` answers either with the message itself or wrapped under `message`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum CreatedMessage {
    Wrapped { message: WireChatMessage },
    Bare(WireChatMessage),
}

impl CreatedMessage {
    pub(crate) fn into_inner(self) -> WireChatMessage {
        match self {
            CreatedMessage::Wrapped { message } | CreatedMessage::Bare(message) => message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
}

/// Body of `POST /{role}/bookings/{id}/chat`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendChatRequest {
    pub receiver_id: String,
    pub message_text: String,
    pub message_type: MessageType,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Millis(i64),
    Other(IgnoredAny),
}

/// RFC 3339, or a naive ISO timestamp read as UTC, or epoch milliseconds. Anything else is
/// treated as missing so one odd item cannot fail a whole page.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match Option::<RawTimestamp>::deserialize(deserializer)? {
        Some(RawTimestamp::Text(text)) => parse_timestamp(&text),
        Some(RawTimestamp::Millis(millis)) => DateTime::from_timestamp_millis(millis),
        Some(RawTimestamp::Other(_)) | None => None,
    };
    Ok(parsed)
}

pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}
