use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result alias used across the delivery layer.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Canonical error surface shared by the channel, pollers and chat sessions.
///
/// Only `AuthRejected`, `SendFailure` and `NotReady` are meant to reach the UI;
/// the remaining variants are recovered where they arise and only logged.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    #[error("Transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("Authentication rejected: {message}")]
    AuthRejected { message: String },

    #[error("Poll failed ({endpoint}): {error}")]
    PollFailure { endpoint: String, error: String },

    #[error("Send failed: {message}")]
    SendFailure { message: String },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Channel not ready: state={state}")]
    NotReady { state: ConnectionState },

    #[error("No active session")]
    NoSession,

    #[error("Conversation {0} is not open")]
    ConversationNotOpen(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RealtimeError {
    pub fn transport(context: &'static str, err: impl ToString) -> Self {
        Self::Transport {
            context,
            error: err.to_string(),
        }
    }

    /// True for errors that must be shown to the session owner.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected { .. })
    }
}

/// Lifecycle of the duplex channel. Exactly one per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Degraded,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a booking the logged-in user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Servicer,
}

impl Role {
    /// Leading REST path segment for this role.
    pub fn path_segment(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Servicer => "servicer",
        }
    }

    /// The other side of a booking.
    pub fn counterpart(self) -> Role {
        match self {
            Role::Customer => Role::Servicer,
            Role::Servicer => Role::Customer,
        }
    }
}

/// Authenticated session handed to the service on login.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub role: Role,
}

impl Session {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>, role: Role) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            role,
        }
    }
}

// Never print the bearer token.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .finish()
    }
}

/// Fatal condition surfaced to the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFault {
    /// The server explicitly refused the token; the user must log in again.
    AuthRejected { message: String },
}

/// Why a live transport went away.
#[derive(Debug, Clone)]
pub enum DisconnectCause {
    RemoteClosed { reason: String },
    ReadFailure { error: String },
    WriteFailure { error: String },
    ConnectFailed { error: String },
    AuthTimeout { after: Duration },
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketBufferConfig {
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        // Marketplace frames are small JSON envelopes.
        Self {
            write_buffer_bytes: 64 << 10,
            max_write_buffer_bytes: 128 << 10,
            max_message_bytes: 4 * 1024 * 1024,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Abstract reconnect strategy trait.
pub trait ReconnectStrategy: Send + Sync + 'static {
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
    fn should_retry(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_debug_redacts_token() {
        let session = Session::new("secret-token", "user-1", Role::Customer);
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("user-1"));
    }

    #[test]
    fn only_auth_rejection_is_fatal() {
        assert!(
            RealtimeError::AuthRejected {
                message: "expired".into()
            }
            .is_fatal()
        );
        assert!(!RealtimeError::transport("read", "reset by peer").is_fatal());
        assert!(
            !RealtimeError::NotReady {
                state: ConnectionState::Reconnecting
            }
            .is_fatal()
        );
    }

    #[test]
    fn role_path_segments() {
        assert_eq!(Role::Customer.path_segment(), "customer");
        assert_eq!(Role::Servicer.path_segment(), "servicer");
        assert_eq!(Role::Customer.counterpart(), Role::Servicer);
    }
}
