use std::sync::Arc;

use kameo::error::SendError;
use kameo::prelude::ActorRef;

use super::event::ClientFrame;
use super::supervisor::{ConnectionSupervisor, SendFrame};
use crate::api::ApiFuture;
use crate::core::{RealtimeError, ReconnectStrategy};
use crate::transport::WsTransport;

/// Outbound half of the channel as seen by chat sessions and the service facade.
///
/// Resolves with `NotReady` unless the channel is Ready at the moment the frame is queued.
pub trait FrameSender: Send + Sync + 'static {
    fn send_frame(&self, frame: ClientFrame) -> ApiFuture<()>;
}

pub type SharedFrameSender = Arc<dyn FrameSender>;

impl<T, R> FrameSender for ActorRef<ConnectionSupervisor<T, R>>
where
    T: WsTransport,
    R: ReconnectStrategy,
{
    fn send_frame(&self, frame: ClientFrame) -> ApiFuture<()> {
        let supervisor = self.clone();
        Box::pin(async move {
            supervisor
                .ask(SendFrame(frame))
                .await
                .map_err(flatten_send_error)
        })
    }
}

/// Unwrap handler errors; mailbox failures become `Actor`.
pub(crate) fn flatten_send_error<M>(err: SendError<M, RealtimeError>) -> RealtimeError {
    match err {
        SendError::HandlerError(err) => err,
        other => RealtimeError::Actor(other.to_string()),
    }
}
