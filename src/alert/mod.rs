//! User-visible alerts and their presentation schedule.

pub mod scheduler;

use std::fmt;

use tokio::time::Instant;

pub use scheduler::{
    AlertScheduler, AlertSchedulerArgs, DEFAULT_DISPLAY_TIME, DEFAULT_STAGGER, DismissAlert,
    EnqueueAlerts, PendingAlerts,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Success => "success",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler-assigned handle for one alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertId(pub u64);

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alert-{}", self.0)
    }
}

/// Something to show the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRequest {
    pub severity: Severity,
    pub text: String,
    pub source_event_id: Option<String>,
}

impl AlertRequest {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
            source_event_id: None,
        }
    }

    pub fn with_source(mut self, id: impl Into<String>) -> Self {
        self.source_event_id = Some(id.into());
        self
    }
}

/// An alert accepted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub id: AlertId,
    pub severity: Severity,
    pub text: String,
    pub source_event_id: Option<String>,
    pub scheduled_at: Instant,
}

/// UI sink for alerts. Calls arrive from the scheduler actor and must not block.
pub trait AlertPresenter: Send + Sync + 'static {
    fn present(&self, alert: &Alert);
    fn dismiss(&self, id: AlertId);
}

/// Presenter that only logs; used when the host registers none.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPresenter;

impl AlertPresenter for LogPresenter {
    fn present(&self, alert: &Alert) {
        tracing::info!(alert = %alert.id, severity = %alert.severity, text = %alert.text, "alert presented");
    }

    fn dismiss(&self, id: AlertId) {
        tracing::debug!(alert = %id, "alert dismissed");
    }
}
