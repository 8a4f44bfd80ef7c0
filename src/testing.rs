//! Reusable test utilities for driving the delivery layer without a network.
//!
//! [`MockTransport::hub`] hands out a transport for the supervisor plus a [`MockHub`] that yields
//! one [`MockServer`] per accepted connection, so reconnect flows can be scripted end to end.
//! [`MockApi`] is an in-memory REST backend and [`RecordingPresenter`] captures alerts.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Sink, Stream};
use sonic_rs::JsonValueTrait;
use tokio::sync::mpsc;

use crate::alert::{Alert, AlertId, AlertPresenter};
use crate::api::{ApiFuture, MarketplaceApi, Notification, SendChatRequest, WireChatMessage};
use crate::core::{RealtimeError, RealtimeResult, ReconnectStrategy, Session, WebSocketBufferConfig, WsFrame};
use crate::transport::{WsTransport, WsTransportConnectFuture};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HubShared {
    accepted_tx: mpsc::UnboundedSender<MockServer>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

/// In-memory transport. Every successful `connect` produces a fresh [`MockServer`].
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<HubShared>,
}

/// Test-side handle collecting the server ends of accepted connections.
pub struct MockHub {
    accepted_rx: mpsc::UnboundedReceiver<MockServer>,
    shared: Arc<HubShared>,
}

impl MockTransport {
    pub fn hub() -> (Self, MockHub) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(HubShared {
            accepted_tx,
            fail_next: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockHub {
                accepted_rx,
                shared,
            },
        )
    }
}

impl MockHub {
    /// Wait for the supervisor to open its next connection.
    pub async fn next_connection(&mut self, timeout: Duration) -> Option<MockServer> {
        tokio::time::timeout(timeout, self.accepted_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total connect attempts, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        url: String,
        _buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = shared
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(RealtimeError::transport("mock_connect", "connection refused"));
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let broken = Arc::new(AtomicBool::new(false));
            let server = MockServer {
                url,
                outbound_rx,
                inbound_tx: Some(inbound_tx),
                broken: Arc::clone(&broken),
            };
            shared
                .accepted_tx
                .send(server)
                .map_err(|_| RealtimeError::transport("mock_connect", "hub dropped"))?;
            Ok((
                MockReader { rx: inbound_rx },
                MockWriter {
                    sent_tx: outbound_tx,
                    broken,
                },
            ))
        })
    }
}

/// Error surface for operations on [`MockServer`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side is no longer reading.
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock client channel is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server end of one mock connection.
pub struct MockServer {
    url: String,
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<RealtimeResult<WsFrame>>>,
    broken: Arc<AtomicBool>,
}

impl MockServer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Receive a frame written by the client, with a timeout.
    pub async fn recv_outbound(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next client frame as text.
    pub async fn recv_outbound_text(&mut self, timeout: Duration) -> Option<String> {
        let frame = self.recv_outbound(timeout).await?;
        let payload = frame.payload()?;
        String::from_utf8(payload.to_vec()).ok()
    }

    /// Receive the next client frame and return its `event` name.
    pub async fn recv_event_name(&mut self, timeout: Duration) -> Option<String> {
        let text = self.recv_outbound_text(timeout).await?;
        let name = sonic_rs::get(text.as_str(), &["event"]).ok()?;
        name.as_str().map(str::to_string)
    }

    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Ok(frame)).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::text(text))
    }

    /// Push `{"event": name, "data": data}`; `data` must be JSON.
    pub fn send_event(&self, name: &str, data: &str) -> Result<(), MockServerError> {
        self.send_text(format!(r#"{{"event":"{name}","data":{data}}}"#))
    }

    /// Acknowledge the authenticate frame.
    pub fn authenticate(&self) -> Result<(), MockServerError> {
        self.send_event("authenticated", "{}")
    }

    /// Send a close frame.
    pub fn close(&self, reason: &str) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::close(1000, Bytes::copy_from_slice(reason.as_bytes())))
    }

    /// Surface a read error on the client's stream.
    pub fn fail_read(&self, error: &str) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Err(RealtimeError::transport("mock_read", error)))
            .map_err(|_| MockServerError::ChannelClosed)
    }

    /// End the client's stream as if the socket vanished.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    /// Make every later client write fail.
    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<RealtimeResult<WsFrame>>,
}

impl Stream for MockReader {
    type Item = RealtimeResult<WsFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    sent_tx: mpsc::UnboundedSender<WsFrame>,
    broken: Arc<AtomicBool>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = RealtimeError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        let this = self.get_mut();
        if this.broken.load(Ordering::SeqCst) {
            return Err(RealtimeError::transport("mock_write", "broken pipe"));
        }
        this.sent_tx
            .send(item)
            .map_err(|_| RealtimeError::transport("mock_write", "mock outbound channel closed"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Reconnect strategy that never retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReconnect;

impl ReconnectStrategy for NoReconnect {
    fn next_delay(&mut self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    fn reset(&mut self) {}

    fn should_retry(&self) -> bool {
        false
    }
}

/// Fixed delay, useful with a paused clock.
#[derive(Clone, Copy, Debug)]
pub struct FixedReconnect(pub Duration);

impl ReconnectStrategy for FixedReconnect {
    fn next_delay(&mut self) -> Duration {
        self.0
    }

    fn reset(&mut self) {}

    fn should_retry(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct ApiState {
    notifications: Vec<Notification>,
    chats: HashMap<String, Vec<WireChatMessage>>,
    sent: Vec<(String, SendChatRequest)>,
    fail_polls: bool,
    fail_sends: bool,
    notification_fetches: usize,
    chat_fetches: usize,
    next_id: u64,
}

/// In-memory marketplace backend.
///
/// Successful sends are stored in the conversation history with a server id, as the real
/// backend does, so later polls return them.
#[derive(Clone, Default)]
pub struct MockApi {
    state: Arc<Mutex<ApiState>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the notification feed (newest first).
    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        lock(&self.state).notifications = notifications;
    }

    /// Prepend a notification, as the server does when something happens.
    pub fn push_notification(&self, notification: Notification) {
        lock(&self.state).notifications.insert(0, notification);
    }

    pub fn set_chat(&self, booking_id: &str, messages: Vec<WireChatMessage>) {
        lock(&self.state)
            .chats
            .insert(booking_id.to_string(), messages);
    }

    pub fn chat(&self, booking_id: &str) -> Vec<WireChatMessage> {
        lock(&self.state)
            .chats
            .get(booking_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_polls(&self, fail: bool) {
        lock(&self.state).fail_polls = fail;
    }

    pub fn fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }

    /// Every send attempt, failed ones included.
    pub fn sent_chats(&self) -> Vec<(String, SendChatRequest)> {
        lock(&self.state).sent.clone()
    }

    pub fn notification_fetches(&self) -> usize {
        lock(&self.state).notification_fetches
    }

    pub fn chat_fetches(&self) -> usize {
        lock(&self.state).chat_fetches
    }
}

impl MarketplaceApi for MockApi {
    fn fetch_notifications(
        &self,
        _session: &Session,
        page: u32,
        limit: u32,
    ) -> ApiFuture<Vec<Notification>> {
        let mut state = lock(&self.state);
        state.notification_fetches += 1;
        let result = if state.fail_polls {
            Err(RealtimeError::PollFailure {
                endpoint: "notifications".into(),
                error: "mock outage".into(),
            })
        } else {
            let skip = (page.saturating_sub(1) as usize).saturating_mul(limit as usize);
            Ok(state
                .notifications
                .iter()
                .skip(skip)
                .take(limit as usize)
                .cloned()
                .collect())
        };
        Box::pin(async move { result })
    }

    fn fetch_chat(&self, _session: &Session, booking_id: &str) -> ApiFuture<Vec<WireChatMessage>> {
        let mut state = lock(&self.state);
        state.chat_fetches += 1;
        let result = if state.fail_polls {
            Err(RealtimeError::PollFailure {
                endpoint: format!("bookings/{booking_id}/chat"),
                error: "mock outage".into(),
            })
        } else {
            Ok(state.chats.get(booking_id).cloned().unwrap_or_default())
        };
        Box::pin(async move { result })
    }

    fn send_chat(
        &self,
        session: &Session,
        booking_id: &str,
        request: SendChatRequest,
    ) -> ApiFuture<WireChatMessage> {
        let mut state = lock(&self.state);
        state.sent.push((booking_id.to_string(), request.clone()));
        let result = if state.fail_sends {
            Err(RealtimeError::SendFailure {
                message: "mock send rejected".into(),
            })
        } else {
            state.next_id += 1;
            let created = WireChatMessage {
                id: format!("srv-{}", state.next_id),
                booking_id: Some(booking_id.to_string()),
                sender_id: session.user_id.clone(),
                receiver_id: Some(request.receiver_id),
                message_text: request.message_text,
                message_type: Some("text".into()),
                image_url: None,
                created_at: Some(Utc::now()),
                is_read: false,
            };
            state
                .chats
                .entry(booking_id.to_string())
                .or_default()
                .push(created.clone());
            Ok(created)
        };
        Box::pin(async move { result })
    }
}

/// Build a notification for tests.
pub fn notification(id: &str, notification_type: &str) -> Notification {
    Notification {
        id: id.to_string(),
        title: format!("title {id}"),
        message: format!("message {id}"),
        notification_type: Some(notification_type.to_string()),
        created_at: None,
        is_read: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterCall {
    Present(AlertId),
    Dismiss(AlertId),
}

/// Presenter that records every call.
#[derive(Clone, Default)]
pub struct RecordingPresenter {
    calls: Arc<Mutex<Vec<PresenterCall>>>,
    presented: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingPresenter {
    pub fn presented(&self) -> Vec<Alert> {
        lock(&self.presented).clone()
    }

    pub fn dismissed(&self) -> Vec<AlertId> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                PresenterCall::Dismiss(id) => Some(*id),
                PresenterCall::Present(_) => None,
            })
            .collect()
    }

    pub fn calls(&self) -> Vec<PresenterCall> {
        lock(&self.calls).clone()
    }
}

impl AlertPresenter for RecordingPresenter {
    fn present(&self, alert: &Alert) {
        lock(&self.presented).push(alert.clone());
        lock(&self.calls).push(PresenterCall::Present(alert.id));
    }

    fn dismiss(&self, id: AlertId) {
        lock(&self.calls).push(PresenterCall::Dismiss(id));
    }
}
