//! Fixed-cadence scheduled task with a single in-flight slot.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hdrhistogram::Histogram;
use tokio::sync::{Notify, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::core::RealtimeResult;

/// Counters and fetch latency for one poller.
#[derive(Debug)]
struct PollStats {
    ticks: u64,
    skipped: u64,
    successes: u64,
    failures: u64,
    latency_ms: Option<Histogram<u64>>,
}

impl PollStats {
    fn new() -> Self {
        Self {
            ticks: 0,
            skipped: 0,
            successes: 0,
            failures: 0,
            latency_ms: Histogram::new_with_bounds(1, 600_000, 2).ok(),
        }
    }

    fn record(&mut self, elapsed: Duration, ok: bool) {
        if ok {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if let Some(hist) = self.latency_ms.as_mut() {
            let ms = elapsed.as_millis().clamp(1, 600_000) as u64;
            let _ = hist.record(ms);
        }
    }

    fn snapshot(&self) -> PollStatsSnapshot {
        let (p50_ms, p99_ms) = match self.latency_ms.as_ref() {
            Some(hist) if !hist.is_empty() => (
                Some(hist.value_at_percentile(50.0)),
                Some(hist.value_at_percentile(99.0)),
            ),
            _ => (None, None),
        };
        PollStatsSnapshot {
            ticks: self.ticks,
            skipped: self.skipped,
            successes: self.successes,
            failures: self.failures,
            p50_ms,
            p99_ms,
        }
    }
}

/// Point-in-time copy of a poller's statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollStatsSnapshot {
    /// Scheduled and manual triggers, including skipped ones.
    pub ticks: u64,
    /// Triggers dropped because a request was still in flight.
    pub skipped: u64,
    pub successes: u64,
    pub failures: u64,
    pub p50_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

// Clears the flight flag however the job ends, including abort.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs `job` every `interval`, first tick immediately.
///
/// At most one job runs at a time: a trigger that arrives while a job is in flight is counted
/// as skipped and dropped, never queued. [`PollTask::poll_now`] requests an extra run under the
/// same rule. Cancelling (or dropping) the task stops the schedule and aborts any in-flight job.
pub struct PollTask {
    name: Arc<str>,
    trigger: Arc<Notify>,
    in_flight: Arc<AtomicBool>,
    stats: Arc<Mutex<PollStats>>,
    current: Arc<Mutex<Option<AbortHandle>>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PollTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = RealtimeResult<()>> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let trigger = Arc::new(Notify::new());
        let in_flight = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(PollStats::new()));
        let current: Arc<Mutex<Option<AbortHandle>>> = Arc::default();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let loop_name = Arc::clone(&name);
        let loop_trigger = Arc::clone(&trigger);
        let loop_flight = Arc::clone(&in_flight);
        let loop_stats = Arc::clone(&stats);
        let loop_current = Arc::clone(&current);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() { break; }
                        continue;
                    }
                    _ = ticker.tick() => {}
                    _ = loop_trigger.notified() => {
                        debug!(poller = %loop_name, "manual poll requested");
                    }
                }

                lock(&loop_stats).ticks += 1;
                if loop_flight.swap(true, Ordering::AcqRel) {
                    lock(&loop_stats).skipped += 1;
                    debug!(poller = %loop_name, "poll skipped, request in flight");
                    continue;
                }

                let guard = FlightGuard(Arc::clone(&loop_flight));
                let fut = job();
                let job_name = Arc::clone(&loop_name);
                let job_stats = Arc::clone(&loop_stats);
                let job_handle = tokio::spawn(async move {
                    let _guard = guard;
                    let started = Instant::now();
                    let result = fut.await;
                    lock(&job_stats).record(started.elapsed(), result.is_ok());
                    if let Err(err) = result {
                        warn!(poller = %job_name, error = %err, "poll failed");
                    }
                });
                *lock(&loop_current) = Some(job_handle.abort_handle());
            }

            if let Some(job) = lock(&loop_current).take() {
                job.abort();
            }
        });

        Self {
            name,
            trigger,
            in_flight,
            stats,
            current,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request an immediate run; skipped if one is already in flight.
    pub fn poll_now(&self) {
        self.trigger.notify_one();
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PollStatsSnapshot {
        lock(&self.stats).snapshot()
    }

    /// Stop the schedule and abort the in-flight job.
    pub fn cancel(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            if let Some(job) = lock(&self.current).take() {
                job.abort();
            }
            // An aborted job releases the flag only once the runtime drops it.
            self.in_flight.store(false, Ordering::Release);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn runs_on_cadence_starting_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let _task = PollTask::spawn("cadence", Duration::from_secs(30), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn overlapping_ticks_are_skipped_not_queued() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PollTask::spawn("slow", Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2500)).await;
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(2600)).await;
        // t=0 runs until 2.5s; ticks at 1s and 2s are dropped.
        let stats = task.stats();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.successes, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn poll_now_runs_out_of_cadence() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PollTask::spawn("manual", Duration::from_secs(30), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.poll_now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failures_are_counted_and_schedule_continues() {
        let task = PollTask::spawn("failing", Duration::from_secs(5), || async {
            Err(crate::core::RealtimeError::PollFailure {
                endpoint: "/customer/notifications".into(),
                error: "status 500".into(),
            })
        });
        tokio::time::sleep(Duration::from_millis(10_010)).await;
        let stats = task.stats();
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.successes, 0);
        assert!(stats.p50_ms.is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cancel_aborts_in_flight_job() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let mut task = PollTask::spawn("cancel", Duration::from_secs(30), move || {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.is_in_flight());
        task.cancel();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(!task.is_in_flight());
        assert!(task.is_cancelled());
    }
}
