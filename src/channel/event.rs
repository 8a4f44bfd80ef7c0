//! Typed events decoded from channel frames, and the client frames we send.
//!
//! Inbound frames are `{"event": <name>, "data": {...}}`. The envelope is read lazily with
//! `sonic_rs::get` so only the payload of a recognised event is deserialized.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sonic_rs::JsonValueTrait;

use crate::api::models::{Notification, WireChatMessage};
use crate::core::{RealtimeError, RealtimeResult, WsFrame};

/// Stage reported by booking lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookingStage {
    Accepted,
    Rejected,
    Cancelled,
    ServiceStarted,
    ServiceCompleted,
    ServicerArrived,
}

impl BookingStage {
    fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "booking_accepted" => BookingStage::Accepted,
            "booking_rejected" => BookingStage::Rejected,
            "booking_cancelled" => BookingStage::Cancelled,
            "service_started" => BookingStage::ServiceStarted,
            "service_completed" => BookingStage::ServiceCompleted,
            "servicer_arrived" => BookingStage::ServicerArrived,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocationUpdate {
    pub booking_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct BookingUpdate {
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PaymentUpdate {
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct EmergencyRequest {
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthFailure {
    #[serde(default)]
    message: Option<String>,
}

/// Discriminant used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Authenticated,
    AuthenticationFailed,
    NewNotification,
    ChatMessageReceived,
    LocationUpdate,
    BookingLifecycle,
    PaymentCompleted,
    EmergencyRequest,
    Unknown,
}

/// One decoded channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Authenticated,
    AuthenticationFailed { message: String },
    NewNotification(Notification),
    ChatMessageReceived(WireChatMessage),
    LocationUpdate(LocationUpdate),
    BookingLifecycle {
        stage: BookingStage,
        update: BookingUpdate,
    },
    PaymentCompleted(PaymentUpdate),
    EmergencyRequest(EmergencyRequest),
    Unknown { name: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Authenticated => EventKind::Authenticated,
            Event::AuthenticationFailed { .. } => EventKind::AuthenticationFailed,
            Event::NewNotification(_) => EventKind::NewNotification,
            Event::ChatMessageReceived(_) => EventKind::ChatMessageReceived,
            Event::LocationUpdate(_) => EventKind::LocationUpdate,
            Event::BookingLifecycle { .. } => EventKind::BookingLifecycle,
            Event::PaymentCompleted(_) => EventKind::PaymentCompleted,
            Event::EmergencyRequest(_) => EventKind::EmergencyRequest,
            Event::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Decode a JSON envelope. Unknown event names decode to [`Event::Unknown`]; a known name
    /// with an unusable payload is a [`RealtimeError::MalformedEvent`].
    pub fn decode(payload: &[u8]) -> RealtimeResult<Event> {
        let name_value = sonic_rs::get(payload, &["event"])
            .map_err(|err| RealtimeError::MalformedEvent(format!("missing event name: {err}")))?;
        let Some(name) = name_value.as_str() else {
            return Err(RealtimeError::MalformedEvent(
                "event name is not a string".to_string(),
            ));
        };

        let event = match name {
            "authenticated" => Event::Authenticated,
            "auth_error" | "unauthorized" => {
                let failure: AuthFailure = data_or_default(payload, name)?;
                Event::AuthenticationFailed {
                    message: failure
                        .message
                        .unwrap_or_else(|| "authentication rejected".to_string()),
                }
            }
            "new_notification" => Event::NewNotification(data(payload, name)?),
            "receive_message" => Event::ChatMessageReceived(data(payload, name)?),
            "location_update" => Event::LocationUpdate(data(payload, name)?),
            "payment_completed" => Event::PaymentCompleted(data_or_default(payload, name)?),
            "emergency_request" => Event::EmergencyRequest(data_or_default(payload, name)?),
            other => match BookingStage::from_wire(other) {
                Some(stage) => Event::BookingLifecycle {
                    stage,
                    update: data_or_default(payload, name)?,
                },
                None => Event::Unknown {
                    name: other.to_string(),
                },
            },
        };
        Ok(event)
    }

    /// Decode a transport frame; control frames yield `None`.
    pub fn from_frame(frame: &WsFrame) -> Option<RealtimeResult<Event>> {
        frame.payload().map(Event::decode)
    }
}

fn data<T: DeserializeOwned>(payload: &[u8], name: &str) -> RealtimeResult<T> {
    let raw = sonic_rs::get(payload, &["data"])
        .map_err(|_| RealtimeError::MalformedEvent(format!("{name}: missing data")))?;
    sonic_rs::from_str(raw.as_raw_str())
        .map_err(|err| RealtimeError::MalformedEvent(format!("{name}: {err}")))
}

fn data_or_default<T: DeserializeOwned + Default>(
    payload: &[u8],
    name: &str,
) -> RealtimeResult<T> {
    match sonic_rs::get(payload, &["data"]) {
        Ok(raw) if raw.is_null() => Ok(T::default()),
        Ok(raw) => sonic_rs::from_str(raw.as_raw_str())
            .map_err(|err| RealtimeError::MalformedEvent(format!("{name}: {err}"))),
        Err(_) => Ok(T::default()),
    }
}

/// Frames the client sends over the channel.
#[derive(Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    SendMessage {
        booking_id: String,
        sender_id: String,
        receiver_id: String,
        message_text: String,
    },
    LocationUpdate {
        booking_id: String,
        latitude: f64,
        longitude: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
    },
    StartTracking {
        booking_id: String,
        latitude: f64,
        longitude: f64,
    },
    ServicerArrived {
        booking_id: String,
    },
    Typing {
        receiver_id: String,
        sender_id: String,
    },
}

impl ClientFrame {
    /// Wire event name, safe to log (never includes payload).
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Authenticate { .. } => "authenticate",
            ClientFrame::SendMessage { .. } => "send_message",
            ClientFrame::LocationUpdate { .. } => "location_update",
            ClientFrame::StartTracking { .. } => "start_tracking",
            ClientFrame::ServicerArrived { .. } => "servicer_arrived",
            ClientFrame::Typing { .. } => "typing",
        }
    }

    pub fn encode(&self) -> RealtimeResult<WsFrame> {
        sonic_rs::to_string(self)
            .map(WsFrame::text)
            .map_err(|err| RealtimeError::SendFailure {
                message: format!("encode {}: {err}", self.name()),
            })
    }
}

impl std::fmt::Debug for ClientFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFrame")
            .field("event", &self.name())
            .finish_non_exhaustive()
    }
}
