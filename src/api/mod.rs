//! REST boundary consumed by the pollers and chat sessions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::core::{RealtimeResult, Session};

pub mod http;
pub mod models;

pub use http::HttpMarketplaceApi;
pub use models::{
    ChatHistory, MessageType, Notification, NotificationPage, SendChatRequest, WireChatMessage,
};

/// Boxed future returned by [`MarketplaceApi`] calls.
pub type ApiFuture<T> = Pin<Box<dyn Future<Output = RealtimeResult<T>> + Send>>;

/// Shared handle to the REST client.
pub type SharedApi = Arc<dyn MarketplaceApi>;

/// Bearer-authenticated marketplace endpoints.
///
/// Returned futures own everything they need so callers can drive them from spawned tasks.
/// Read failures are reported as `PollFailure`, the chat POST as `SendFailure`.
pub trait MarketplaceApi: Send + Sync + 'static {
    /// `GET /{role}/notifications?page={page}&limit={limit}`, newest first.
    fn fetch_notifications(
        &self,
        session: &Session,
        page: u32,
        limit: u32,
    ) -> ApiFuture<Vec<Notification>>;

    /// `GET /{role}/bookings/{booking_id}/chat`.
    fn fetch_chat(&self, session: &Session, booking_id: &str) -> ApiFuture<Vec<WireChatMessage>>;

    /// `POST /{role}/bookings/{booking_id}/chat`.
    fn send_chat(
        &self,
        session: &Session,
        booking_id: &str,
        request: SendChatRequest,
    ) -> ApiFuture<WireChatMessage>;
}
