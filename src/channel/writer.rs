use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::{RealtimeError, WsFrame};

/// Owns the transport sink for one connection and serializes writes.
///
/// A failed write is published on `failure_tx` so the connection's reader task can report the
/// disconnect; later frames for the same connection are discarded.
pub struct ChannelWriter<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    writer: W,
    shutdown_rx: watch::Receiver<bool>,
    failure_tx: watch::Sender<Option<String>>,
    failed: bool,
}

impl<W> ChannelWriter<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    pub fn new(
        writer: W,
        shutdown_rx: watch::Receiver<bool>,
        failure_tx: watch::Sender<Option<String>>,
    ) -> Self {
        Self {
            writer,
            shutdown_rx,
            failure_tx,
            failed: false,
        }
    }
}

impl<W> Actor for ChannelWriter<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = RealtimeError;

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    fn on_panic(
        &mut self,
        _actor_ref: kameo::actor::WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "ChannelWriter panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteFrame {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriteFrame> for ChannelWriter<W>
where
    W: Sink<WsFrame, Error = RealtimeError> + Send + Sync + Unpin + 'static,
{
    type Reply = ();

    async fn handle(&mut self, msg: WriteFrame, _ctx: &mut Context<Self, Self::Reply>) {
        if self.failed || *self.shutdown_rx.borrow() {
            debug!(target: "channel-writer", "dropping frame for closed connection");
            return;
        }
        debug!(target: "channel-writer", "sending channel frame to wire");
        if let Err(err) = self.writer.send(msg.frame).await {
            warn!(target: "channel-writer", error = %err, "channel write failed");
            self.failed = true;
            self.failure_tx.send_replace(Some(err.to_string()));
        }
    }
}
