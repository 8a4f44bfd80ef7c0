//! Session-scoped facade over the delivery layer.
//!
//! `start(session)` spawns the alert scheduler, the connection supervisor and the notification
//! dispatcher; chat sessions are opened on demand. `stop()` tears them down in the order
//! supervisor, chats, notification polling, scheduler. Subscriber registries and the state
//! watches outlive sessions, so UI code can subscribe once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use kameo::prelude::{Actor, ActorRef};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alert::{
    AlertId, AlertPresenter, AlertScheduler, AlertSchedulerArgs, DismissAlert, LogPresenter,
};
use crate::api::{HttpMarketplaceApi, Notification, SharedApi};
use crate::channel::sender::flatten_send_error;
use crate::channel::{
    ClientFrame, Connect, ConnectionSupervisor, Event, EventFilter, EventKind, EventRegistry,
    FrameSender, GetChannelStats, LocationUpdate, Logout, ReconnectNow, Subscription,
    SupervisorArgs,
};
use crate::chat::{
    ChatMessage, ChatSessionArgs, ChatSessionController, ChatView, CloseChat, GetChatPollStats,
    GetMessages, RefreshHistory, RetrySend, SendChat, SendTicket, TypingFrame, WatchMessages,
};
use crate::config::RealtimeConfig;
use crate::core::{
    ChannelStats, ConnectionState, ExponentialBackoffReconnect, RealtimeError, RealtimeResult,
    Session, SessionFault,
};
use crate::notify::{
    GetPollStats, GetUnreadCount, NotificationDispatcher, NotificationDispatcherArgs, PollNow,
    StopPolling,
};
use crate::poll::PollStatsSnapshot;
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

type Supervisor<T> = ConnectionSupervisor<T, ExponentialBackoffReconnect>;

struct ActiveSession<T: WsTransport> {
    session: Session,
    supervisor: ActorRef<Supervisor<T>>,
    dispatcher: ActorRef<NotificationDispatcher>,
    scheduler: ActorRef<AlertScheduler>,
    chats: HashMap<String, ActorRef<ChatSessionController>>,
}

/// Keeps a chat view callback alive; dropping it stops the callbacks.
#[derive(Debug)]
pub struct ChatSubscription {
    task: JoinHandle<()>,
}

impl Drop for ChatSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct RealtimeService<T: WsTransport = TungsteniteTransport> {
    config: RealtimeConfig,
    transport: T,
    api: SharedApi,
    presenter: Arc<dyn AlertPresenter>,
    channel: EventRegistry,
    notifications: EventRegistry,
    state_tx: watch::Sender<ConnectionState>,
    fault_tx: watch::Sender<Option<SessionFault>>,
    active: Option<ActiveSession<T>>,
}

impl RealtimeService<TungsteniteTransport> {
    /// Production wiring: tungstenite channel, reqwest REST client, logging presenter.
    pub fn new(config: RealtimeConfig) -> RealtimeResult<Self> {
        config.validate()?;
        let api = HttpMarketplaceApi::new(&config.api.base_url, config.api.timeout())?;
        Ok(Self::with_parts(
            config,
            TungsteniteTransport::default(),
            Arc::new(api),
            Arc::new(LogPresenter),
        ))
    }
}

impl<T: WsTransport> RealtimeService<T> {
    pub fn with_parts(
        config: RealtimeConfig,
        transport: T,
        api: SharedApi,
        presenter: Arc<dyn AlertPresenter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (fault_tx, _) = watch::channel(None);
        Self {
            config,
            transport,
            api,
            presenter,
            channel: EventRegistry::new(),
            notifications: EventRegistry::new(),
            state_tx,
            fault_tx,
            active: None,
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|active| &active.session)
    }

    pub fn is_started(&self) -> bool {
        self.active.is_some()
    }

    /// Begin delivery for `session`. Restarting with another session stops the current one first.
    pub async fn start(&mut self, session: Session) -> RealtimeResult<()> {
        if let Some(active) = self.active.as_ref() {
            if active.session == session {
                return Ok(());
            }
            self.stop().await;
        }
        self.fault_tx.send_replace(None);

        let scheduler = AlertScheduler::spawn(AlertSchedulerArgs {
            presenter: Arc::clone(&self.presenter),
            stagger: self.config.alerts.stagger(),
            display_time: self.config.alerts.display_time(),
        });

        let supervisor = Supervisor::<T>::spawn(SupervisorArgs {
            url: self.config.channel.socket_url.clone(),
            session: session.clone(),
            transport: self.transport.clone(),
            reconnect: self.config.channel.backoff.strategy(),
            auth_timeout: self.config.channel.auth_timeout(),
            buffers: self.config.channel.buffers(),
            registry: self.channel.clone(),
            state_tx: self.state_tx.clone(),
            fault_tx: self.fault_tx.clone(),
        });

        let dispatcher = NotificationDispatcher::spawn(NotificationDispatcherArgs {
            session: session.clone(),
            api: Arc::clone(&self.api),
            scheduler: scheduler.clone(),
            channel: self.channel.clone(),
            feed: self.notifications.clone(),
            interval: self.config.polling.interval(),
            page_size: self.config.polling.page_size,
        });

        info!(user = %session.user_id, role = session.role.path_segment(), "realtime session started");
        let connected = supervisor.ask(Connect).await.map_err(flatten_send_error);
        self.active = Some(ActiveSession {
            session,
            supervisor,
            dispatcher,
            scheduler,
            chats: HashMap::new(),
        });
        connected
    }

    /// Tear everything down. Safe to call when not started.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveSession {
            session,
            supervisor,
            dispatcher,
            scheduler,
            chats,
        } = active;

        if let Err(err) = supervisor.ask(Logout).await {
            warn!(error = %err, "channel logout failed");
        }
        shutdown(&supervisor).await;

        for (booking_id, chat) in chats {
            if let Err(err) = chat.ask(CloseChat).await {
                warn!(booking = %booking_id, error = %err, "chat close failed");
            }
            shutdown(&chat).await;
        }

        if let Err(err) = dispatcher.ask(StopPolling).await {
            warn!(error = %err, "notification polling stop failed");
        }
        shutdown(&dispatcher).await;
        shutdown(&scheduler).await;

        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!(user = %session.user_id, "realtime session stopped");
    }

    fn active(&self) -> RealtimeResult<&ActiveSession<T>> {
        self.active.as_ref().ok_or(RealtimeError::NoSession)
    }

    fn chat(&self, booking_id: &str) -> RealtimeResult<&ActorRef<ChatSessionController>> {
        self.active()?
            .chats
            .get(booking_id)
            .ok_or_else(|| RealtimeError::ConversationNotOpen(booking_id.to_string()))
    }

    // Notifications

    /// Called once per newly observed notification, from either delivery path.
    pub fn subscribe_notifications<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.notifications.subscribe(
            EventKind::NewNotification,
            Arc::new(move |event: &Event| {
                if let Event::NewNotification(notification) = event {
                    handler(notification);
                }
            }),
        )
    }

    pub async fn poll_notifications_now(&self) -> RealtimeResult<()> {
        self.active()?
            .dispatcher
            .ask(PollNow)
            .await
            .map_err(flatten_send_error)
    }

    pub async fn unread_count(&self) -> RealtimeResult<usize> {
        self.active()?
            .dispatcher
            .ask(GetUnreadCount)
            .await
            .map_err(flatten_send_error)
    }

    pub async fn notification_poll_stats(&self) -> RealtimeResult<PollStatsSnapshot> {
        self.active()?
            .dispatcher
            .ask(GetPollStats)
            .await
            .map_err(flatten_send_error)
    }

    pub async fn dismiss_alert(&self, id: AlertId) -> RealtimeResult<bool> {
        self.active()?
            .scheduler
            .ask(DismissAlert(id))
            .await
            .map_err(flatten_send_error)
    }

    // Chat

    /// Open the conversation for `booking_id` with `peer_id`. Opening twice is a no-op.
    pub async fn open_chat(&mut self, booking_id: &str, peer_id: &str) -> RealtimeResult<()> {
        let poll_interval = self.config.chat.poll_interval();
        let api = Arc::clone(&self.api);
        let channel = self.channel.clone();
        let active = self.active.as_mut().ok_or(RealtimeError::NoSession)?;
        if active.chats.contains_key(booking_id) {
            return Ok(());
        }
        let sender: Arc<dyn FrameSender> = Arc::new(active.supervisor.clone());
        let chat = ChatSessionController::spawn(ChatSessionArgs {
            session: active.session.clone(),
            booking_id: booking_id.to_string(),
            peer_id: peer_id.to_string(),
            api,
            channel,
            sender: Some(sender),
            poll_interval,
        });
        active.chats.insert(booking_id.to_string(), chat);
        Ok(())
    }

    /// Stop polling the conversation and drop its channel listener.
    pub async fn close_chat(&mut self, booking_id: &str) -> RealtimeResult<()> {
        let active = self.active.as_mut().ok_or(RealtimeError::NoSession)?;
        let Some(chat) = active.chats.remove(booking_id) else {
            return Err(RealtimeError::ConversationNotOpen(booking_id.to_string()));
        };
        let closed = chat.ask(CloseChat).await.map_err(flatten_send_error);
        shutdown(&chat).await;
        closed
    }

    pub fn open_chats(&self) -> Vec<String> {
        self.active
            .as_ref()
            .map(|active| active.chats.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn watch_chat(&self, booking_id: &str) -> RealtimeResult<watch::Receiver<ChatView>> {
        self.chat(booking_id)?
            .ask(WatchMessages)
            .await
            .map_err(flatten_send_error)
    }

    /// Call `handler` with the ordered message list now and after every change.
    pub async fn subscribe_chat<F>(&self, booking_id: &str, handler: F) -> RealtimeResult<ChatSubscription>
    where
        F: Fn(&[ChatMessage]) + Send + Sync + 'static,
    {
        let mut view = self.watch_chat(booking_id).await?;
        let task = tokio::spawn(async move {
            loop {
                let snapshot = view.borrow_and_update().clone();
                handler(&snapshot);
                if view.changed().await.is_err() {
                    break;
                }
            }
        });
        Ok(ChatSubscription { task })
    }

    pub async fn chat_messages(&self, booking_id: &str) -> RealtimeResult<Vec<ChatMessage>> {
        self.chat(booking_id)?
            .ask(GetMessages)
            .await
            .map_err(flatten_send_error)
    }

    /// Send optimistically. The returned ticket resolves once the server answers.
    pub async fn send_chat_message(&self, booking_id: &str, text: &str) -> RealtimeResult<SendTicket> {
        self.chat(booking_id)?
            .ask(SendChat {
                text: text.to_string(),
            })
            .await
            .map_err(flatten_send_error)
    }

    pub async fn retry_chat_message(&self, booking_id: &str, temp_id: &str) -> RealtimeResult<SendTicket> {
        self.chat(booking_id)?
            .ask(RetrySend {
                temp_id: temp_id.to_string(),
            })
            .await
            .map_err(flatten_send_error)
    }

    pub async fn refresh_chat(&self, booking_id: &str) -> RealtimeResult<()> {
        self.chat(booking_id)?
            .ask(RefreshHistory)
            .await
            .map_err(flatten_send_error)
    }

    pub async fn chat_poll_stats(&self, booking_id: &str) -> RealtimeResult<PollStatsSnapshot> {
        self.chat(booking_id)?
            .ask(GetChatPollStats)
            .await
            .map_err(flatten_send_error)
    }

    pub async fn notify_typing(&self, booking_id: &str) -> RealtimeResult<()> {
        let frame = self
            .chat(booking_id)?
            .ask(TypingFrame)
            .await
            .map_err(flatten_send_error)?;
        self.send_frame(frame).await
    }

    // Channel

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Fatal faults for the session owner; currently only auth rejection.
    pub fn session_faults(&self) -> watch::Receiver<Option<SessionFault>> {
        self.fault_tx.subscribe()
    }

    /// Location, booking lifecycle, payment and emergency events while Ready.
    pub fn subscribe_live_events<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.channel.subscribe(
            EventFilter::Kinds(vec![
                EventKind::LocationUpdate,
                EventKind::BookingLifecycle,
                EventKind::PaymentCompleted,
                EventKind::EmergencyRequest,
            ]),
            Arc::new(handler),
        )
    }

    pub async fn share_location(&self, update: LocationUpdate) -> RealtimeResult<()> {
        self.send_frame(ClientFrame::LocationUpdate {
            booking_id: update.booking_id,
            latitude: update.latitude,
            longitude: update.longitude,
            speed: update.speed,
            heading: update.heading,
        })
        .await
    }

    pub async fn start_tracking(&self, booking_id: &str, latitude: f64, longitude: f64) -> RealtimeResult<()> {
        self.send_frame(ClientFrame::StartTracking {
            booking_id: booking_id.to_string(),
            latitude,
            longitude,
        })
        .await
    }

    pub async fn announce_arrival(&self, booking_id: &str) -> RealtimeResult<()> {
        self.send_frame(ClientFrame::ServicerArrived {
            booking_id: booking_id.to_string(),
        })
        .await
    }

    /// Skip the pending backoff and connect now.
    pub async fn reconnect_now(&self) -> RealtimeResult<()> {
        self.active()?
            .supervisor
            .ask(ReconnectNow)
            .await
            .map_err(flatten_send_error)
    }

    pub async fn channel_stats(&self) -> RealtimeResult<ChannelStats> {
        self.active()?
            .supervisor
            .ask(GetChannelStats)
            .await
            .map_err(flatten_send_error)
    }

    async fn send_frame(&self, frame: ClientFrame) -> RealtimeResult<()> {
        self.active()?.supervisor.send_frame(frame).await
    }
}

async fn shutdown<A: Actor>(actor: &ActorRef<A>) {
    let _ = actor.stop_gracefully().await;
    actor.wait_for_shutdown().await;
}
