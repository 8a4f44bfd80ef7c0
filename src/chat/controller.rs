//! Per-conversation chat session.
//!
//! One actor per booking owns the [`MessageStore`]. History arrives from a 5s poll task and,
//! while the channel is Ready, from `receive_message` events. Sends are optimistic: a `tmp-`
//! placeholder is stored at once and the REST call runs in a spawned task whose outcome comes
//! back as [`SendCompleted`]. Every path funnels through the same id check, so a message seen
//! by poll, channel and send response is stored once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{ChatMessage, DeliveryOrigin, DeliveryStatus};
use super::store::MessageStore;
use crate::api::{MessageType, SendChatRequest, SharedApi, WireChatMessage};
use crate::channel::{ClientFrame, Event, EventKind, EventRegistry, SharedFrameSender, Subscription};
use crate::core::{RealtimeError, RealtimeResult, Session};
use crate::poll::{PollStatsSnapshot, PollTask};

pub const DEFAULT_CHAT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot of a conversation, ordered by `(sent_at, id)`.
pub type ChatView = Arc<Vec<ChatMessage>>;

pub struct ChatSessionArgs {
    pub session: Session,
    pub booking_id: String,
    /// The other party of the booking.
    pub peer_id: String,
    pub api: SharedApi,
    pub channel: EventRegistry,
    /// Used for `send_message` echoes after a confirmed send.
    pub sender: Option<SharedFrameSender>,
    pub poll_interval: Duration,
}

type Waiter = oneshot::Sender<RealtimeResult<ChatMessage>>;

/// Bookkeeping for a placeholder until its send succeeds.
struct PendingSend {
    text: String,
    in_flight: bool,
    waiters: Vec<Waiter>,
}

/// Handle returned by a send: the placeholder id plus the eventual outcome.
#[derive(Debug)]
pub struct SendTicket {
    pub temp_id: String,
    outcome: oneshot::Receiver<RealtimeResult<ChatMessage>>,
}

impl SendTicket {
    /// Wait for the server to confirm or reject the message.
    pub async fn confirmed(self) -> RealtimeResult<ChatMessage> {
        self.outcome
            .await
            .map_err(|_| RealtimeError::ConversationNotOpen(self.temp_id))?
    }
}

pub struct ChatSessionController {
    session: Session,
    booking_id: String,
    peer_id: String,
    api: SharedApi,
    sender: Option<SharedFrameSender>,
    store: MessageStore,
    pending: HashMap<String, PendingSend>,
    view_tx: watch::Sender<ChatView>,
    poller: Option<PollTask>,
    channel_sub: Option<Subscription>,
    forwarder: Option<JoinHandle<()>>,
    actor_ref: ActorRef<Self>,
}

impl Actor for ChatSessionController {
    type Args = ChatSessionArgs;
    type Error = RealtimeError;

    fn name() -> &'static str {
        "ChatSessionController"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> RealtimeResult<Self> {
        let ChatSessionArgs {
            session,
            booking_id,
            peer_id,
            api,
            channel,
            sender,
            poll_interval,
        } = args;

        let (channel_sub, mut pushed) = channel.subscribe_queue(EventKind::ChatMessageReceived);
        let forward_ref = actor_ref.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = pushed.recv().await {
                if let Event::ChatMessageReceived(message) = event {
                    if forward_ref.tell(ChannelChat(message)).send().await.is_err() {
                        break;
                    }
                }
            }
        });

        let poll_api = api.clone();
        let poll_session = session.clone();
        let poll_booking = booking_id.clone();
        let poll_ref = actor_ref.clone();
        let poller = PollTask::spawn(format!("chat:{booking_id}"), poll_interval, move || {
            let history = poll_api.fetch_chat(&poll_session, &poll_booking);
            let actor_ref = poll_ref.clone();
            async move {
                let history = history.await?;
                actor_ref
                    .tell(HistoryFetched(history))
                    .send()
                    .await
                    .map_err(|e| RealtimeError::Actor(e.to_string()))
            }
        });

        info!(
            booking = %booking_id,
            peer = %peer_id,
            peer_role = session.role.counterpart().path_segment(),
            "chat session opened"
        );

        let (view_tx, _) = watch::channel(ChatView::default());
        Ok(Self {
            session,
            booking_id,
            peer_id,
            api,
            sender,
            store: MessageStore::new(),
            pending: HashMap::new(),
            view_tx,
            poller: Some(poller),
            channel_sub: Some(channel_sub),
            forwarder: Some(forwarder),
            actor_ref,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> RealtimeResult<()> {
        self.close();
        Ok(())
    }
}

/// Submit a text message.
#[derive(Debug, Clone)]
pub struct SendChat {
    pub text: String,
}

/// Re-issue a placeholder whose send failed.
#[derive(Debug, Clone)]
pub struct RetrySend {
    pub temp_id: String,
}

/// Build the `typing` frame for this conversation.
#[derive(Debug, Clone, Copy)]
pub struct TypingFrame;

#[derive(Debug, Clone, Copy)]
pub struct GetMessages;

#[derive(Debug, Clone, Copy)]
pub struct WatchMessages;

/// Fetch history now instead of waiting for the next tick.
#[derive(Debug, Clone, Copy)]
pub struct RefreshHistory;

#[derive(Debug, Clone, Copy)]
pub struct GetChatPollStats;

/// Stop polling and detach from the channel.
#[derive(Debug, Clone, Copy)]
pub struct CloseChat;

#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct HistoryFetched(pub Vec<WireChatMessage>);

#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct ChannelChat(pub WireChatMessage);

#[doc(hidden)]
#[derive(Debug)]
pub struct SendCompleted {
    pub temp_id: String,
    pub result: RealtimeResult<WireChatMessage>,
}

impl KameoMessage<SendChat> for ChatSessionController {
    type Reply = RealtimeResult<SendTicket>;

    async fn handle(&mut self, msg: SendChat, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.ensure_open()?;
        let text = msg.text.trim().to_string();
        if text.is_empty() {
            return Err(RealtimeError::SendFailure {
                message: "message is empty".into(),
            });
        }

        let temp_id = format!("tmp-{}", Uuid::new_v4());
        self.store.insert(ChatMessage::optimistic(
            temp_id.clone(),
            &self.booking_id,
            &self.session.user_id,
            &self.peer_id,
            text.clone(),
            Utc::now(),
        ));
        let (waiter, outcome) = oneshot::channel();
        self.pending.insert(
            temp_id.clone(),
            PendingSend {
                text: text.clone(),
                in_flight: true,
                waiters: vec![waiter],
            },
        );
        self.dispatch_send(temp_id.clone(), text);
        self.publish();
        Ok(SendTicket { temp_id, outcome })
    }
}

impl KameoMessage<RetrySend> for ChatSessionController {
    type Reply = RealtimeResult<SendTicket>;

    async fn handle(&mut self, msg: RetrySend, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.ensure_open()?;
        let Some(pending) = self.pending.get_mut(&msg.temp_id) else {
            return Err(RealtimeError::UnknownMessage(msg.temp_id));
        };
        let (waiter, outcome) = oneshot::channel();
        pending.waiters.push(waiter);
        if !pending.in_flight {
            pending.in_flight = true;
            let text = pending.text.clone();
            self.store.set_status(&msg.temp_id, DeliveryStatus::Sending);
            info!(booking = %self.booking_id, message = %msg.temp_id, "retrying chat send");
            self.dispatch_send(msg.temp_id.clone(), text);
            self.publish();
        }
        Ok(SendTicket {
            temp_id: msg.temp_id,
            outcome,
        })
    }
}

impl KameoMessage<SendCompleted> for ChatSessionController {
    type Reply = ();

    async fn handle(&mut self, msg: SendCompleted, _ctx: &mut Context<Self, ()>) {
        let SendCompleted { temp_id, result } = msg;
        match result {
            Ok(wire) => {
                let waiters = self
                    .pending
                    .remove(&temp_id)
                    .map(|p| p.waiters)
                    .unwrap_or_default();
                let mut confirmed = ChatMessage::from_wire(
                    wire,
                    &self.booking_id,
                    DeliveryOrigin::OptimisticLocal,
                    Utc::now(),
                );
                confirmed.read = true;
                let frame = ClientFrame::SendMessage {
                    booking_id: self.booking_id.clone(),
                    sender_id: self.session.user_id.clone(),
                    receiver_id: self.peer_id.clone(),
                    message_text: confirmed.body.text().to_string(),
                };
                debug!(booking = %self.booking_id, temp = %temp_id, id = %confirmed.id, "chat send confirmed");
                if self.store.replace(&temp_id, confirmed.clone()) {
                    self.publish();
                }
                let stored = self.store.get(&confirmed.id).cloned().unwrap_or(confirmed);
                for waiter in waiters {
                    let _ = waiter.send(Ok(stored.clone()));
                }
                self.echo_on_channel(frame);
            }
            Err(err) => {
                warn!(booking = %self.booking_id, temp = %temp_id, error = %err, "chat send failed");
                let failed = self.store.set_status(
                    &temp_id,
                    DeliveryStatus::Failed {
                        reason: err.to_string(),
                    },
                );
                let waiters = if failed {
                    self.pending.get_mut(&temp_id).map(|pending| {
                        pending.in_flight = false;
                        std::mem::take(&mut pending.waiters)
                    })
                } else {
                    // Reconciled by an echo while the request was out; nothing left to retry.
                    self.pending.remove(&temp_id).map(|p| p.waiters)
                };
                for waiter in waiters.unwrap_or_default() {
                    let _ = waiter.send(Err(err.clone()));
                }
                if failed {
                    self.publish();
                }
            }
        }
    }
}

impl KameoMessage<HistoryFetched> for ChatSessionController {
    type Reply = ();

    async fn handle(&mut self, HistoryFetched(history): HistoryFetched, _ctx: &mut Context<Self, ()>) {
        if self.poller.is_none() {
            return;
        }
        if self.merge_remote(history, DeliveryOrigin::Poll) {
            self.publish();
        }
    }
}

impl KameoMessage<ChannelChat> for ChatSessionController {
    type Reply = ();

    async fn handle(&mut self, ChannelChat(message): ChannelChat, _ctx: &mut Context<Self, ()>) {
        if self.channel_sub.is_none() || !self.belongs_here(&message) {
            return;
        }
        if self.merge_remote(vec![message], DeliveryOrigin::Channel) {
            self.publish();
        }
    }
}

impl KameoMessage<TypingFrame> for ChatSessionController {
    type Reply = RealtimeResult<ClientFrame>;

    async fn handle(&mut self, _msg: TypingFrame, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.ensure_open()?;
        Ok(ClientFrame::Typing {
            receiver_id: self.peer_id.clone(),
            sender_id: self.session.user_id.clone(),
        })
    }
}

impl KameoMessage<GetMessages> for ChatSessionController {
    type Reply = RealtimeResult<Vec<ChatMessage>>;

    async fn handle(&mut self, _msg: GetMessages, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(self.store.messages().to_vec())
    }
}

impl KameoMessage<WatchMessages> for ChatSessionController {
    type Reply = RealtimeResult<watch::Receiver<ChatView>>;

    async fn handle(
        &mut self,
        _msg: WatchMessages,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.view_tx.subscribe())
    }
}

impl KameoMessage<RefreshHistory> for ChatSessionController {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        _msg: RefreshHistory,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.ensure_open()?;
        if let Some(poller) = self.poller.as_ref() {
            poller.poll_now();
        }
        Ok(())
    }
}

impl KameoMessage<GetChatPollStats> for ChatSessionController {
    type Reply = RealtimeResult<PollStatsSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetChatPollStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self
            .poller
            .as_ref()
            .map(PollTask::stats)
            .unwrap_or_default())
    }
}

impl KameoMessage<CloseChat> for ChatSessionController {
    type Reply = RealtimeResult<()>;

    async fn handle(&mut self, _msg: CloseChat, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.close();
        Ok(())
    }
}

impl ChatSessionController {
    fn ensure_open(&self) -> RealtimeResult<()> {
        if self.poller.is_none() {
            return Err(RealtimeError::ConversationNotOpen(self.booking_id.clone()));
        }
        Ok(())
    }

    fn dispatch_send(&self, temp_id: String, text: String) {
        let request = SendChatRequest {
            receiver_id: self.peer_id.clone(),
            message_text: text,
            message_type: MessageType::Text,
        };
        let request = self.api.send_chat(&self.session, &self.booking_id, request);
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            let result = request.await;
            let _ = actor_ref.tell(SendCompleted { temp_id, result }).send().await;
        });
    }

    fn echo_on_channel(&self, frame: ClientFrame) {
        let Some(sender) = self.sender.clone() else {
            return;
        };
        let booking = self.booking_id.clone();
        tokio::spawn(async move {
            if let Err(err) = sender.send_frame(frame).await {
                debug!(booking = %booking, error = %err, "send_message echo skipped");
            }
        });
    }

    /// Channel events may omit `booking_id`; fall back to the two participants.
    fn belongs_here(&self, message: &WireChatMessage) -> bool {
        match message.booking_id.as_deref() {
            Some(booking) => booking == self.booking_id,
            None => {
                message.sender_id == self.peer_id
                    || (message.sender_id == self.session.user_id
                        && message.receiver_id.as_deref() == Some(self.peer_id.as_str()))
            }
        }
    }

    /// Merge server copies. Returns true if the visible list changed.
    fn merge_remote(&mut self, messages: Vec<WireChatMessage>, origin: DeliveryOrigin) -> bool {
        let now = Utc::now();
        let mut changed = false;
        for wire in messages {
            if wire
                .booking_id
                .as_deref()
                .is_some_and(|booking| booking != self.booking_id)
            {
                continue;
            }
            if self.store.contains(&wire.id) {
                if origin == DeliveryOrigin::Poll {
                    changed |= self.store.mark_read(&wire.id, wire.is_read);
                }
                continue;
            }
            let message = ChatMessage::from_wire(wire, &self.booking_id, origin, now);
            if message.sender_id == self.session.user_id {
                let echo_of = self
                    .store
                    .echo_target(&message.sender_id, &message.body)
                    .filter(|m| self.pending.get(&m.id).is_some_and(|p| p.in_flight))
                    .map(|m| m.id.clone());
                if let Some(temp_id) = echo_of {
                    self.reconcile_echo(&temp_id, message);
                    changed = true;
                    continue;
                }
            }
            changed |= self.store.insert(message);
        }
        changed
    }

    /// A server copy of our own message beat the send response. The pending entry stays until
    /// the response lands so its waiters still hear the outcome.
    fn reconcile_echo(&mut self, temp_id: &str, message: ChatMessage) {
        debug!(booking = %self.booking_id, temp = %temp_id, id = %message.id, origin = ?message.origin, "optimistic message reconciled by echo");
        self.store.replace(temp_id, message);
    }

    fn publish(&self) {
        self.view_tx
            .send_replace(Arc::new(self.store.messages().to_vec()));
    }

    fn close(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.cancel();
            info!(booking = %self.booking_id, "chat session closed");
        }
        self.channel_sub = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        for (temp_id, pending) in self.pending.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(RealtimeError::ConversationNotOpen(temp_id.clone())));
            }
        }
    }
}
