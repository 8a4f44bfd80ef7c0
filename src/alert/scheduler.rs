use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{Alert, AlertId, AlertPresenter, AlertRequest};
use crate::core::{RealtimeError, RealtimeResult};

pub const DEFAULT_STAGGER: Duration = Duration::from_millis(500);
pub const DEFAULT_DISPLAY_TIME: Duration = Duration::from_secs(5);

pub struct AlertSchedulerArgs {
    pub presenter: Arc<dyn AlertPresenter>,
    pub stagger: Duration,
    pub display_time: Duration,
}

enum Phase {
    Pending,
    Visible,
}

struct Entry {
    alert: Alert,
    phase: Phase,
    timer: JoinHandle<()>,
}

/// Spreads bursts of alerts out in time and auto-dismisses them.
///
/// Each accepted alert gets a slot at least `stagger` after the previous one; once shown it
/// stays up for `display_time` unless dismissed earlier. Dismissing an alert that is still
/// waiting for its slot cancels it.
pub struct AlertScheduler {
    presenter: Arc<dyn AlertPresenter>,
    stagger: Duration,
    display_time: Duration,
    next_slot: Option<Instant>,
    next_id: u64,
    entries: HashMap<AlertId, Entry>,
    actor_ref: ActorRef<Self>,
}

impl Actor for AlertScheduler {
    type Args = AlertSchedulerArgs;
    type Error = RealtimeError;

    fn name() -> &'static str {
        "AlertScheduler"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> RealtimeResult<Self> {
        Ok(Self {
            presenter: args.presenter,
            stagger: args.stagger,
            display_time: args.display_time,
            next_slot: None,
            next_id: 0,
            entries: HashMap::new(),
            actor_ref,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> RealtimeResult<()> {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
        Ok(())
    }
}

/// Queue alerts, in the order given.
#[derive(Debug, Clone)]
pub struct EnqueueAlerts(pub Vec<AlertRequest>);

#[derive(Debug, Clone, Copy)]
pub struct DismissAlert(pub AlertId);

/// Alerts accepted but not yet presented.
#[derive(Debug, Clone, Copy)]
pub struct PendingAlerts;

#[doc(hidden)]
pub enum TimerFired {
    Due(AlertId),
    Expired(AlertId),
}

impl KameoMessage<EnqueueAlerts> for AlertScheduler {
    type Reply = RealtimeResult<Vec<AlertId>>;

    async fn handle(
        &mut self,
        EnqueueAlerts(requests): EnqueueAlerts,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let now = Instant::now();
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            let slot = match self.next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            self.next_slot = Some(slot + self.stagger);
            self.next_id += 1;
            let id = AlertId(self.next_id);
            let alert = Alert {
                id,
                severity: request.severity,
                text: request.text,
                source_event_id: request.source_event_id,
                scheduled_at: slot,
            };
            debug!(alert = %id, severity = %alert.severity, delay_ms = (slot - now).as_millis() as u64, "alert scheduled");
            let timer = self.arm(slot, TimerFired::Due(id));
            self.entries.insert(
                id,
                Entry {
                    alert,
                    phase: Phase::Pending,
                    timer,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }
}

impl KameoMessage<DismissAlert> for AlertScheduler {
    type Reply = RealtimeResult<bool>;

    async fn handle(
        &mut self,
        DismissAlert(id): DismissAlert,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(entry) = self.entries.remove(&id) else {
            return Ok(false);
        };
        entry.timer.abort();
        match entry.phase {
            Phase::Pending => debug!(alert = %id, "pending alert cancelled"),
            Phase::Visible => self.presenter.dismiss(id),
        }
        Ok(true)
    }
}

impl KameoMessage<PendingAlerts> for AlertScheduler {
    type Reply = RealtimeResult<usize>;

    async fn handle(
        &mut self,
        _msg: PendingAlerts,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self
            .entries
            .values()
            .filter(|e| matches!(e.phase, Phase::Pending))
            .count())
    }
}

impl KameoMessage<TimerFired> for AlertScheduler {
    type Reply = ();

    async fn handle(&mut self, fired: TimerFired, _ctx: &mut Context<Self, Self::Reply>) {
        match fired {
            TimerFired::Due(id) => {
                let deadline = Instant::now() + self.display_time;
                let Some(entry) = self.entries.get(&id) else {
                    return;
                };
                if !matches!(entry.phase, Phase::Pending) {
                    return;
                }
                self.presenter.present(&entry.alert);
                let timer = self.arm(deadline, TimerFired::Expired(id));
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.phase = Phase::Visible;
                    entry.timer = timer;
                }
            }
            TimerFired::Expired(id) => {
                if let Some(entry) = self.entries.remove(&id) {
                    if matches!(entry.phase, Phase::Visible) {
                        self.presenter.dismiss(id);
                    }
                }
            }
        }
    }
}

impl AlertScheduler {
    fn arm(&self, at: Instant, fired: TimerFired) -> JoinHandle<()> {
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let _ = actor_ref.tell(fired).send().await;
        })
    }
}
