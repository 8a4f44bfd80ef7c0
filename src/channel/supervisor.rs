//! Connection supervisor for the duplex event channel.
//!
//! Socket IO runs outside kameo: a reader task forwards frames into the actor and a
//! [`ChannelWriter`] owns the sink. The actor owns [`ConnectionState`], the auth deadline and the
//! reconnect timer. Every transport instance gets a fresh epoch; messages tagged with an older
//! epoch are ignored, so a late frame or timer from a torn-down socket can never affect the
//! current one.

use std::time::Duration;

use futures_util::StreamExt;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use super::event::{ClientFrame, Event};
use super::registry::EventRegistry;
use super::writer::{ChannelWriter, WriteFrame};
use crate::core::{
    ChannelHealth, ChannelStats, ConnectionState, DisconnectCause, ExponentialBackoffReconnect,
    RealtimeError, RealtimeResult, ReconnectStrategy, Session, SessionFault,
    WebSocketBufferConfig, WsFrame,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments used to spawn a [`ConnectionSupervisor`].
pub struct SupervisorArgs<T = TungsteniteTransport, R = ExponentialBackoffReconnect>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    pub url: String,
    pub session: Session,
    pub transport: T,
    pub reconnect: R,
    pub auth_timeout: Duration,
    pub buffers: WebSocketBufferConfig,
    pub registry: EventRegistry,
    pub state_tx: watch::Sender<ConnectionState>,
    pub fault_tx: watch::Sender<Option<SessionFault>>,
}

pub struct ConnectionSupervisor<T = TungsteniteTransport, R = ExponentialBackoffReconnect>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    url: String,
    session: Session,
    transport: T,
    reconnect: R,
    auth_timeout: Duration,
    buffers: WebSocketBufferConfig,
    registry: EventRegistry,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    fault_tx: watch::Sender<Option<SessionFault>>,
    rejected: Option<String>,
    epoch: u64,
    attempt: u64,
    health: ChannelHealth,
    actor_ref: ActorRef<Self>,
    writer_ref: Option<ActorRef<ChannelWriter<T::Writer>>>,
    reader_task: Option<JoinHandle<()>>,
    timer_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T, R> Actor for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Args = SupervisorArgs<T, R>;
    type Error = RealtimeError;

    fn name() -> &'static str {
        "ConnectionSupervisor"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> RealtimeResult<Self> {
        let SupervisorArgs {
            url,
            session,
            transport,
            reconnect,
            auth_timeout,
            buffers,
            registry,
            state_tx,
            fault_tx,
        } = args;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        state_tx.send_replace(ConnectionState::Disconnected);

        Ok(Self {
            url,
            session,
            transport,
            reconnect,
            auth_timeout,
            buffers,
            registry,
            state: ConnectionState::Disconnected,
            state_tx,
            fault_tx,
            rejected: None,
            epoch: 0,
            attempt: 0,
            health: ChannelHealth::new(),
            actor_ref,
            writer_ref: None,
            reader_task: None,
            timer_task: None,
            shutdown_tx,
            shutdown_rx,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> RealtimeResult<()> {
        self.teardown_transport().await;
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }
}

/// Begin connecting; a no-op unless the channel is Disconnected.
#[derive(Debug, Clone, Copy)]
pub struct Connect;

/// Send a client frame. Fails with [`RealtimeError::NotReady`] outside Ready.
#[derive(Debug, Clone)]
pub struct SendFrame(pub ClientFrame);

/// Skip any pending backoff and connect immediately.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectNow;

/// Tear the transport down and stay Disconnected.
#[derive(Debug, Clone, Copy)]
pub struct Logout;

#[derive(Debug, Clone, Copy)]
pub struct GetConnectionState;

#[derive(Debug, Clone, Copy)]
pub struct GetChannelStats;

/// Transport handed back by the connect task.
#[doc(hidden)]
pub struct TransportOpened<T: WsTransport> {
    epoch: u64,
    reader: T::Reader,
    writer: T::Writer,
}

/// Internal lifecycle notifications, always tagged with the epoch they belong to.
#[derive(Debug)]
#[doc(hidden)]
pub enum LinkEvent {
    ConnectFailed { epoch: u64, error: String },
    Inbound { epoch: u64, frame: WsFrame },
    Closed { epoch: u64, cause: DisconnectCause },
    AuthDeadline { epoch: u64 },
    ReconnectDue { epoch: u64 },
}

impl LinkEvent {
    fn epoch(&self) -> u64 {
        match self {
            LinkEvent::ConnectFailed { epoch, .. }
            | LinkEvent::Inbound { epoch, .. }
            | LinkEvent::Closed { epoch, .. }
            | LinkEvent::AuthDeadline { epoch }
            | LinkEvent::ReconnectDue { epoch } => *epoch,
        }
    }
}

impl<T, R> KameoMessage<Connect> for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = RealtimeResult<()>;

    async fn handle(&mut self, _msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if let Some(message) = self.rejected.clone() {
            return Err(RealtimeError::AuthRejected { message });
        }
        if self.state == ConnectionState::Disconnected {
            self.begin_connect();
        }
        Ok(())
    }
}

impl<T, R> KameoMessage<SendFrame> for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        SendFrame(frame): SendFrame,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if !self.state.is_ready() {
            return Err(RealtimeError::NotReady { state: self.state });
        }
        let name = frame.name();
        let frame = frame.encode()?;
        debug!(connection = %self.url, event = name, "channel frame queued");
        self.write(frame).await
    }
}

impl<T, R> KameoMessage<ReconnectNow> for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = RealtimeResult<()>;

    async fn handle(
        &mut self,
        _msg: ReconnectNow,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if let Some(message) = self.rejected.clone() {
            return Err(RealtimeError::AuthRejected { message });
        }
        match self.state {
            ConnectionState::Reconnecting | ConnectionState::Degraded => {
                info!(connection = %self.url, attempt = self.attempt, "manual reconnect requested");
                self.cancel_timer();
                self.begin_connect();
            }
            ConnectionState::Disconnected => self.begin_connect(),
            ConnectionState::Connecting
            | ConnectionState::Authenticating
            | ConnectionState::Ready => {}
        }
        Ok(())
    }
}

impl<T, R> KameoMessage<Logout> for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = RealtimeResult<()>;

    async fn handle(&mut self, _msg: Logout, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        info!(connection = %self.url, state = %self.state, "channel logout");
        self.teardown_transport().await;
        self.health.mark_down();
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }
}

impl<T, R> KameoMessage<GetConnectionState> for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = RealtimeResult<ConnectionState>;

    async fn handle(
        &mut self,
        _msg: GetConnectionState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.state)
    }
}

impl<T, R> KameoMessage<GetChannelStats> for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = RealtimeResult<ChannelStats>;

    async fn handle(
        &mut self,
        _msg: GetChannelStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.stats())
    }
}

impl<T, R> KameoMessage<TransportOpened<T>> for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: TransportOpened<T>, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(connection = %self.url, epoch = msg.epoch, "discarding stale transport");
            return;
        }
        self.on_transport_opened(msg.reader, msg.writer).await;
    }
}

impl<T, R> KameoMessage<LinkEvent> for ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, event: LinkEvent, _ctx: &mut Context<Self, Self::Reply>) {
        if event.epoch() != self.epoch {
            return;
        }
        match event {
            LinkEvent::ConnectFailed { error, .. } => {
                if self.state == ConnectionState::Connecting {
                    let reason = format!("connect failed: {error}");
                    self.schedule_reconnect(&reason, DisconnectCause::ConnectFailed { error })
                        .await;
                }
            }
            LinkEvent::Inbound { frame, .. } => self.process_inbound(frame).await,
            LinkEvent::Closed { cause, .. } => {
                if matches!(
                    self.state,
                    ConnectionState::Authenticating | ConnectionState::Ready
                ) {
                    let reason = match &cause {
                        DisconnectCause::RemoteClosed { reason } => reason.clone(),
                        DisconnectCause::ReadFailure { error } => format!("read error: {error}"),
                        DisconnectCause::WriteFailure { error } => {
                            format!("write error: {error}")
                        }
                        other => format!("{other:?}"),
                    };
                    self.schedule_reconnect(&reason, cause).await;
                }
            }
            LinkEvent::AuthDeadline { .. } => {
                if self.state == ConnectionState::Authenticating {
                    let after = self.auth_timeout;
                    self.schedule_reconnect(
                        "authentication timed out",
                        DisconnectCause::AuthTimeout { after },
                    )
                    .await;
                }
            }
            LinkEvent::ReconnectDue { .. } => {
                if self.state == ConnectionState::Reconnecting {
                    self.begin_connect();
                }
            }
        }
    }
}

impl<T, R> ConnectionSupervisor<T, R>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!(connection = %self.url, from = %self.state, to = %next, "channel state changed");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn begin_connect(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.set_state(ConnectionState::Connecting);

        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let transport = self.transport.clone();
        let url = self.url.clone();
        let buffers = self.buffers;
        tokio::spawn(async move {
            match transport.connect(url, buffers).await {
                Ok((reader, writer)) => {
                    let _ = actor_ref
                        .tell(TransportOpened::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(err) => {
                    let _ = actor_ref
                        .tell(LinkEvent::ConnectFailed {
                            epoch,
                            error: err.to_string(),
                        })
                        .send()
                        .await;
                }
            }
        });
    }

    async fn on_transport_opened(&mut self, reader: T::Reader, writer: T::Writer) {
        info!(connection = %self.url, epoch = self.epoch, "channel transport opened");

        let (failure_tx, failure_rx) = watch::channel(None);
        let writer = ChannelWriter::spawn(ChannelWriter::new(
            writer,
            self.shutdown_rx.clone(),
            failure_tx,
        ));
        self.writer_ref = Some(writer);
        self.reader_task = Some(spawn_reader(
            self.actor_ref.clone(),
            self.epoch,
            reader,
            self.shutdown_rx.clone(),
            failure_rx,
        ));
        self.set_state(ConnectionState::Authenticating);

        // A fresh socket never inherits authentication from a previous one.
        let handshake = ClientFrame::Authenticate {
            token: self.session.token.clone(),
        }
        .encode();
        let sent = match handshake {
            Ok(frame) => self.write(frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            let reason = format!("authenticate send failed: {err}");
            self.schedule_reconnect(
                &reason,
                DisconnectCause::WriteFailure {
                    error: err.to_string(),
                },
            )
            .await;
            return;
        }

        let epoch = self.epoch;
        self.arm_timer(self.auth_timeout, LinkEvent::AuthDeadline { epoch });
    }

    async fn process_inbound(&mut self, frame: WsFrame) {
        self.health.record_frame();
        let Some(decoded) = Event::from_frame(&frame) else {
            return;
        };
        let event = match decoded {
            Ok(event) => event,
            Err(err) => {
                self.health.record_malformed();
                warn!(connection = %self.url, error = %err, "dropping malformed channel frame");
                return;
            }
        };

        match (self.state, event) {
            (ConnectionState::Authenticating, Event::Authenticated) => self.on_ready(),
            (
                ConnectionState::Authenticating | ConnectionState::Ready,
                Event::AuthenticationFailed { message },
            ) => self.on_auth_rejected(message).await,
            (ConnectionState::Ready, Event::Authenticated) => {
                debug!(connection = %self.url, "duplicate authenticated event ignored");
            }
            (ConnectionState::Ready, Event::Unknown { name }) => {
                info!(connection = %self.url, event = %name, "unknown channel event ignored");
            }
            (ConnectionState::Ready, event) => {
                let delivered = self.registry.dispatch(&event);
                debug!(connection = %self.url, kind = ?event.kind(), delivered, "channel event dispatched");
            }
            (state, event) => {
                debug!(
                    connection = %self.url,
                    state = %state,
                    kind = ?event.kind(),
                    "channel event outside ready dropped"
                );
            }
        }
    }

    fn on_ready(&mut self) {
        self.cancel_timer();
        self.reconnect.reset();
        self.attempt = 0;
        self.health.mark_ready();
        self.set_state(ConnectionState::Ready);
    }

    async fn on_auth_rejected(&mut self, message: String) {
        warn!(connection = %self.url, user = %self.session.user_id, reason = %message, "channel authentication rejected");
        self.teardown_transport().await;
        self.health.mark_down();
        self.rejected = Some(message.clone());
        self.set_state(ConnectionState::Disconnected);
        self.fault_tx
            .send_replace(Some(SessionFault::AuthRejected { message }));
    }

    async fn schedule_reconnect(&mut self, reason: &str, cause: DisconnectCause) {
        let was_ready = self.state == ConnectionState::Ready;
        self.health.mark_down();
        self.health.record_transport_error(disconnect_context(&cause), reason);
        self.teardown_transport().await;

        if was_ready {
            self.set_state(ConnectionState::Degraded);
        }

        if !self.reconnect.should_retry() {
            self.log_reconnect_plan("retry_suppressed", reason, &cause, None);
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let delay = self.reconnect.next_delay();
        self.attempt = self.attempt.saturating_add(1);
        self.health.increment_reconnect();
        self.set_state(ConnectionState::Reconnecting);
        self.log_reconnect_plan("scheduled", reason, &cause, Some(delay));

        let epoch = self.epoch;
        self.arm_timer(delay, LinkEvent::ReconnectDue { epoch });
    }

    async fn write(&mut self, frame: WsFrame) -> RealtimeResult<()> {
        let Some(writer) = self.writer_ref.as_ref() else {
            return Err(RealtimeError::NotReady { state: self.state });
        };
        match writer.tell(WriteFrame { frame }).send().await {
            Ok(()) => {
                self.health.record_sent();
                Ok(())
            }
            Err(err) => {
                let msg = err.to_string();
                warn!(connection = %self.url, error = %msg, "channel writer unavailable");
                Err(RealtimeError::Actor(msg))
            }
        }
    }

    fn arm_timer(&mut self, delay: Duration, event: LinkEvent) {
        self.cancel_timer();
        let actor_ref = self.actor_ref.clone();
        self.timer_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor_ref.tell(event).send().await;
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer_task.take() {
            handle.abort();
        }
    }

    async fn teardown_transport(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.cancel_timer();
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.reader_task.take() {
            handle.abort();
        }
        if let Some(writer) = self.writer_ref.take() {
            let _ = writer.stop_gracefully().await;
            writer.wait_for_shutdown().await;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        self.shutdown_rx = shutdown_rx;
    }

    fn log_reconnect_plan(
        &self,
        note: &str,
        reason: &str,
        cause: &DisconnectCause,
        delay: Option<Duration>,
    ) {
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        let stats = self.health.stats();
        let last_frame_age_ms = stats
            .last_frame_age
            .map(|age| age.as_millis().min(u64::MAX as u128) as u64);
        warn!(
            connection = %self.url,
            note = %note,
            reason = %reason,
            cause = ?cause,
            attempt = self.attempt,
            delay_ms,
            last_frame_age_ms,
            frames = stats.frames_received,
            reconnects = stats.reconnects,
            "channel reconnect plan"
        );
    }
}

fn disconnect_context(cause: &DisconnectCause) -> &'static str {
    match cause {
        DisconnectCause::RemoteClosed { .. } => "remote_closed",
        DisconnectCause::ReadFailure { .. } => "read",
        DisconnectCause::WriteFailure { .. } => "write",
        DisconnectCause::ConnectFailed { .. } => "connect",
        DisconnectCause::AuthTimeout { .. } => "auth_timeout",
    }
}

fn spawn_reader<T, R>(
    actor_ref: ActorRef<ConnectionSupervisor<T, R>>,
    epoch: u64,
    mut reader: T::Reader,
    mut shutdown_rx: watch::Receiver<bool>,
    mut write_failed: watch::Receiver<Option<String>>,
) -> JoinHandle<()>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    tokio::spawn(async move {
        let mut writer_alive = true;
        let cause = loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow_and_update() {
                        return;
                    }
                }
                res = write_failed.changed(), if writer_alive => {
                    match res {
                        Ok(()) => {
                            let failure = write_failed.borrow_and_update().clone();
                            if let Some(error) = failure {
                                break DisconnectCause::WriteFailure { error };
                            }
                        }
                        Err(_) => writer_alive = false,
                    }
                }
                next = reader.next() => {
                    match next {
                        Some(Ok(frame @ WsFrame::Close(_))) => {
                            let reason = frame.close_reason().unwrap_or_default();
                            info!(epoch, close = %reason, "received channel close frame");
                            break DisconnectCause::RemoteClosed { reason };
                        }
                        Some(Ok(frame)) => {
                            if actor_ref
                                .tell(LinkEvent::Inbound { epoch, frame })
                                .send()
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            break DisconnectCause::ReadFailure { error: err.to_string() };
                        }
                        None => {
                            break DisconnectCause::RemoteClosed {
                                reason: "stream ended".to_string(),
                            };
                        }
                    }
                }
            }
        };
        let _ = actor_ref
            .tell(LinkEvent::Closed { epoch, cause })
            .send()
            .await;
    })
}
