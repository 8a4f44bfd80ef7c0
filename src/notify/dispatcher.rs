//! Notification dispatcher: the single owner of the notification cursor.
//!
//! Two paths feed it. The poll task fetches the newest page on a fixed cadence and hands it over
//! as [`PageFetched`]; the channel pushes `new_notification` events while Ready. Both are
//! reconciled against the same cursor inside this actor, so an item seen on one path is never
//! alerted again by the other.

use std::time::Duration;

use chrono::Utc;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::severity::alert_for;
use crate::alert::{AlertRequest, AlertScheduler, EnqueueAlerts};
use crate::api::{Notification, SharedApi};
use crate::channel::{Event, EventKind, EventRegistry, Subscription};
use crate::core::{RealtimeError, RealtimeResult, Session};
use crate::poll::{NotificationCursor, PollStatsSnapshot, PollTask};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PAGE_SIZE: u32 = 20;

pub struct NotificationDispatcherArgs {
    pub session: Session,
    pub api: SharedApi,
    pub scheduler: ActorRef<AlertScheduler>,
    /// Channel events (source of pushed notifications).
    pub channel: EventRegistry,
    /// Outbound feed of newly observed notifications.
    pub feed: EventRegistry,
    pub interval: Duration,
    pub page_size: u32,
}

pub struct NotificationDispatcher {
    session: Session,
    scheduler: ActorRef<AlertScheduler>,
    feed: EventRegistry,
    cursor: NotificationCursor,
    unread: usize,
    poller: Option<PollTask>,
    channel_sub: Option<Subscription>,
    forwarder: Option<JoinHandle<()>>,
}

impl Actor for NotificationDispatcher {
    type Args = NotificationDispatcherArgs;
    type Error = RealtimeError;

    fn name() -> &'static str {
        "NotificationDispatcher"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> RealtimeResult<Self> {
        let NotificationDispatcherArgs {
            session,
            api,
            scheduler,
            channel,
            feed,
            interval,
            page_size,
        } = args;

        let (channel_sub, mut pushed) = channel.subscribe_queue(EventKind::NewNotification);
        let forward_ref = actor_ref.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = pushed.recv().await {
                if let Event::NewNotification(notification) = event {
                    if forward_ref
                        .tell(ChannelNotification(notification))
                        .send()
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        let poll_session = session.clone();
        let poll_ref = actor_ref.clone();
        let poller = PollTask::spawn(
            format!("notifications:{}", session.role.path_segment()),
            interval,
            move || {
                let page = api.fetch_notifications(&poll_session, 1, page_size);
                let actor_ref = poll_ref.clone();
                async move {
                    let page = page.await?;
                    actor_ref
                        .tell(PageFetched(page))
                        .send()
                        .await
                        .map_err(|e| RealtimeError::Actor(e.to_string()))
                }
            },
        );
        info!(user = %session.user_id, interval_ms = interval.as_millis() as u64, page_size, "notification polling started");

        Ok(Self {
            session,
            scheduler,
            feed,
            cursor: NotificationCursor::new(),
            unread: 0,
            poller: Some(poller),
            channel_sub: Some(channel_sub),
            forwarder: Some(forwarder),
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> RealtimeResult<()> {
        self.stop_polling();
        Ok(())
    }
}

/// A fetched notification page, newest first.
#[derive(Debug, Clone)]
pub struct PageFetched(pub Vec<Notification>);

/// A notification pushed over the channel.
#[derive(Debug, Clone)]
pub struct ChannelNotification(pub Notification);

/// Trigger an out-of-cadence poll.
#[derive(Debug, Clone, Copy)]
pub struct PollNow;

#[derive(Debug, Clone, Copy)]
pub struct GetUnreadCount;

#[derive(Debug, Clone, Copy)]
pub struct GetCursor;

#[derive(Debug, Clone, Copy)]
pub struct GetPollStats;

/// Cancel the poll timer and detach from the channel.
#[derive(Debug, Clone, Copy)]
pub struct StopPolling;

impl KameoMessage<PageFetched> for NotificationDispatcher {
    type Reply = ();

    async fn handle(&mut self, PageFetched(page): PageFetched, _ctx: &mut Context<Self, ()>) {
        if self.poller.is_none() {
            return;
        }
        self.unread = page.iter().filter(|n| !n.is_read).count();
        let changes = self.cursor.observe_page(page, Utc::now());
        if changes.first_poll {
            info!(
                user = %self.session.user_id,
                last_seen = ?self.cursor.last_seen_id(),
                "notification cursor initialized"
            );
            return;
        }
        if changes.is_empty() {
            return;
        }
        if changes.truncated {
            warn!(
                user = %self.session.user_id,
                count = changes.new_items.len(),
                "notification cursor not on page, reporting whole page"
            );
        }
        self.emit(changes.into_oldest_first()).await;
    }
}

impl KameoMessage<ChannelNotification> for NotificationDispatcher {
    type Reply = ();

    async fn handle(
        &mut self,
        ChannelNotification(notification): ChannelNotification,
        _ctx: &mut Context<Self, ()>,
    ) {
        let advanced = self
            .cursor
            .advance_if_newer(&notification.id, notification.created_at);
        if !advanced {
            debug!(notification = %notification.id, "pushed notification already seen");
            return;
        }
        if !notification.is_read {
            self.unread += 1;
        }
        self.emit(vec![notification]).await;
    }
}

impl KameoMessage<PollNow> for NotificationDispatcher {
    type Reply = RealtimeResult<()>;

    async fn handle(&mut self, _msg: PollNow, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if let Some(poller) = self.poller.as_ref() {
            poller.poll_now();
        }
        Ok(())
    }
}

impl KameoMessage<GetUnreadCount> for NotificationDispatcher {
    type Reply = RealtimeResult<usize>;

    async fn handle(
        &mut self,
        _msg: GetUnreadCount,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.unread)
    }
}

impl KameoMessage<GetCursor> for NotificationDispatcher {
    type Reply = RealtimeResult<NotificationCursor>;

    async fn handle(&mut self, _msg: GetCursor, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(self.cursor.clone())
    }
}

impl KameoMessage<GetPollStats> for NotificationDispatcher {
    type Reply = RealtimeResult<PollStatsSnapshot>;

    async fn handle(
        &mut self,
        _msg: GetPollStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self
            .poller
            .as_ref()
            .map(PollTask::stats)
            .unwrap_or_default())
    }
}

impl KameoMessage<StopPolling> for NotificationDispatcher {
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        _msg: StopPolling,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.stop_polling();
        Ok(())
    }
}

impl NotificationDispatcher {
    async fn emit(&mut self, notifications: Vec<Notification>) {
        let mut alerts: Vec<AlertRequest> = Vec::with_capacity(notifications.len());
        for notification in notifications {
            alerts.push(alert_for(&notification));
            self.feed.dispatch(&Event::NewNotification(notification));
        }
        let count = alerts.len();
        if let Err(err) = self.scheduler.tell(EnqueueAlerts(alerts)).send().await {
            warn!(error = %err, count, "alert scheduler unavailable");
        }
    }

    fn stop_polling(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.cancel();
            info!(poller = %poller.name(), "notification polling stopped");
        }
        self.channel_sub = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
