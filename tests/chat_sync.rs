use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use kameo::prelude::{Actor, ActorRef};
use realtime_sync::api::{
    ApiFuture, MarketplaceApi, Notification, SendChatRequest, WireChatMessage,
};
use realtime_sync::channel::{Event, EventRegistry};
use realtime_sync::chat::{
    ChatSessionArgs, ChatSessionController, CloseChat, DeliveryOrigin, DeliveryStatus,
    GetMessages, RefreshHistory, SendChat, WatchMessages,
};
use realtime_sync::core::{RealtimeError, Role, Session};
use realtime_sync::testing::MockApi;
use tokio::sync::Semaphore;

const WAIT: Duration = Duration::from_secs(5);

/// Holds send responses until the test releases them.
#[derive(Clone)]
struct GatedApi {
    inner: MockApi,
    gate: Arc<Semaphore>,
}

impl GatedApi {
    fn new(inner: MockApi) -> Self {
        Self {
            inner,
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

impl MarketplaceApi for GatedApi {
    fn fetch_notifications(&self, session: &Session, page: u32, limit: u32) -> ApiFuture<Vec<Notification>> {
        self.inner.fetch_notifications(session, page, limit)
    }

    fn fetch_chat(&self, session: &Session, booking_id: &str) -> ApiFuture<Vec<WireChatMessage>> {
        self.inner.fetch_chat(session, booking_id)
    }

    fn send_chat(
        &self,
        session: &Session,
        booking_id: &str,
        request: SendChatRequest,
    ) -> ApiFuture<WireChatMessage> {
        let gate = Arc::clone(&self.gate);
        let response = self.inner.send_chat(session, booking_id, request);
        Box::pin(async move {
            let _permit = gate.acquire().await.map_err(|err| RealtimeError::SendFailure {
                message: err.to_string(),
            })?;
            response.await
        })
    }
}

fn open(api: Arc<dyn MarketplaceApi>, channel: &EventRegistry) -> ActorRef<ChatSessionController> {
    ChatSessionController::spawn(ChatSessionArgs {
        session: Session::new("tok", "me", Role::Customer),
        booking_id: "b1".into(),
        peer_id: "peer".into(),
        api,
        channel: channel.clone(),
        sender: None,
        poll_interval: Duration::from_secs(3600),
    })
}

fn own_copy(id: &str, text: &str) -> WireChatMessage {
    WireChatMessage {
        id: id.into(),
        booking_id: Some("b1".into()),
        sender_id: "me".into(),
        receiver_id: Some("peer".into()),
        message_text: text.into(),
        message_type: Some("text".into()),
        image_url: None,
        created_at: Some(Utc::now()),
        is_read: false,
    }
}

async fn messages_eventually(
    chat: &ActorRef<ChatSessionController>,
    pred: impl Fn(&[realtime_sync::chat::ChatMessage]) -> bool,
) -> Vec<realtime_sync::chat::ChatMessage> {
    tokio::time::timeout(WAIT, async {
        loop {
            let messages = chat.ask(GetMessages).await.unwrap();
            if pred(&messages) {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached")
}

#[tokio::test]
async fn channel_echo_before_send_response_is_not_duplicated() {
    let mock = MockApi::new();
    let api = GatedApi::new(mock.clone());
    let channel = EventRegistry::new();
    let chat = open(Arc::new(api.clone()), &channel);

    let ticket = chat.ask(SendChat { text: "on my way".into() }).await.unwrap();
    let pending = chat.ask(GetMessages).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].origin, DeliveryOrigin::OptimisticLocal);
    assert_eq!(pending[0].status, DeliveryStatus::Sending);

    // MockApi numbers sends from srv-1; the peer-facing echo carries the same id.
    channel.dispatch(&Event::ChatMessageReceived(own_copy("srv-1", "on my way")));
    let echoed = messages_eventually(&chat, |m| m.len() == 1 && m[0].id == "srv-1").await;
    assert_eq!(echoed[0].origin, DeliveryOrigin::Channel);

    api.release(1);
    let confirmed = ticket.confirmed().await.unwrap();
    assert_eq!(confirmed.id, "srv-1");
    let settled = chat.ask(GetMessages).await.unwrap();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].id, "srv-1");
}

#[tokio::test]
async fn poll_echo_before_send_response_is_not_duplicated() {
    let mock = MockApi::new();
    let api = GatedApi::new(mock.clone());
    let channel = EventRegistry::new();
    let chat = open(Arc::new(api.clone()), &channel);

    let ticket = chat.ask(SendChat { text: "ok".into() }).await.unwrap();
    // The server has stored the message; the next poll sees it before our response lands.
    chat.ask(RefreshHistory).await.unwrap();
    messages_eventually(&chat, |m| m.len() == 1 && m[0].id == "srv-1").await;

    api.release(1);
    ticket.confirmed().await.unwrap();
    chat.ask(RefreshHistory).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = chat.ask(GetMessages).await.unwrap();
    assert_eq!(settled.len(), 1);
}

#[tokio::test]
async fn echo_skips_failed_placeholder_with_same_text() {
    let mock = MockApi::new();
    let api = GatedApi::new(mock.clone());
    let channel = EventRegistry::new();
    let chat = open(Arc::new(api.clone()), &channel);

    mock.fail_sends(true);
    let first = chat.ask(SendChat { text: "hi".into() }).await.unwrap();
    let failed_id = first.temp_id.clone();
    api.release(1);
    assert!(first.confirmed().await.is_err());

    mock.fail_sends(false);
    let second = chat.ask(SendChat { text: "hi".into() }).await.unwrap();
    let sending_id = second.temp_id.clone();
    channel.dispatch(&Event::ChatMessageReceived(own_copy("srv-1", "hi")));
    let echoed = messages_eventually(&chat, |m| m.iter().any(|x| x.id == "srv-1")).await;
    assert_eq!(echoed.len(), 2);
    assert!(echoed.iter().all(|m| m.id != sending_id));
    let failed = echoed.iter().find(|m| m.id == failed_id).expect("failed entry kept");
    assert!(failed.is_failed());

    api.release(1);
    assert_eq!(second.confirmed().await.unwrap().id, "srv-1");
    let settled = chat.ask(GetMessages).await.unwrap();
    assert_eq!(settled.len(), 2);
    assert!(settled.iter().any(|m| m.id == failed_id && m.is_failed()));
}

#[tokio::test]
async fn identical_texts_reconcile_one_placeholder_each() {
    let mock = MockApi::new();
    let api = GatedApi::new(mock.clone());
    let channel = EventRegistry::new();
    let chat = open(Arc::new(api.clone()), &channel);

    let first = chat.ask(SendChat { text: "yes".into() }).await.unwrap();
    let second = chat.ask(SendChat { text: "yes".into() }).await.unwrap();
    channel.dispatch(&Event::ChatMessageReceived(own_copy("srv-1", "yes")));
    let messages = messages_eventually(&chat, |m| m.iter().any(|msg| msg.id == "srv-1")).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages.iter().filter(|msg| msg.is_optimistic()).count(), 1);

    api.release(2);
    first.confirmed().await.unwrap();
    second.confirmed().await.unwrap();
    let mut ids: Vec<String> = chat
        .ask(GetMessages)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["srv-1", "srv-2"]);
}

#[tokio::test]
async fn display_order_ignores_arrival_order() {
    let mock = MockApi::new();
    let channel = EventRegistry::new();
    let chat = open(Arc::new(mock.clone()), &channel);
    let at = |sec: i64| Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(sec);

    let mut late = own_copy("m3", "third");
    late.sender_id = "peer".into();
    late.created_at = Some(at(30));
    channel.dispatch(&Event::ChatMessageReceived(late));
    messages_eventually(&chat, |m| m.len() == 1).await;

    let mut early = own_copy("m1", "first");
    early.created_at = Some(at(10));
    let mut middle = own_copy("m2", "second");
    middle.sender_id = "peer".into();
    middle.created_at = Some(at(20));
    mock.set_chat("b1", vec![middle, early]);
    chat.ask(RefreshHistory).await.unwrap();

    let messages = messages_eventually(&chat, |m| m.len() == 3).await;
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn watchers_see_updates_and_close_detaches() {
    let mock = MockApi::new();
    let channel = EventRegistry::new();
    let chat = open(Arc::new(mock.clone()), &channel);
    let mut view = chat.ask(WatchMessages).await.unwrap();

    let mut incoming = own_copy("m1", "hello");
    incoming.sender_id = "peer".into();
    channel.dispatch(&Event::ChatMessageReceived(incoming));
    tokio::time::timeout(WAIT, view.wait_for(|messages| messages.len() == 1))
        .await
        .unwrap()
        .unwrap();

    chat.ask(CloseChat).await.unwrap();
    assert!(channel.is_empty());
    let fetches = mock.chat_fetches();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.chat_fetches(), fetches);
}
