use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_RECENT_ERRORS: usize = 32;
const MAX_ERROR_TEXT_BYTES: usize = 512;

#[derive(Debug, Clone)]
pub struct TransportErrorRecord {
    pub at: Instant,
    pub context: String,
    pub error: String,
}

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Connection health tracked by the supervisor across reconnects.
#[derive(Debug)]
pub struct ChannelHealth {
    ready_since: Option<Instant>,
    last_frame_received: Option<Instant>,
    frames_received: u64,
    frames_sent: u64,
    malformed_frames: u64,
    reconnects: u64,
    recent_errors: VecDeque<TransportErrorRecord>,
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHealth {
    pub fn new() -> Self {
        Self {
            ready_since: None,
            last_frame_received: None,
            frames_received: 0,
            frames_sent: 0,
            malformed_frames: 0,
            reconnects: 0,
            recent_errors: VecDeque::with_capacity(MAX_RECENT_ERRORS),
        }
    }

    pub fn mark_ready(&mut self) {
        self.ready_since = Some(Instant::now());
    }

    pub fn mark_down(&mut self) {
        self.ready_since = None;
    }

    pub fn record_frame(&mut self) {
        self.last_frame_received = Some(Instant::now());
        self.frames_received = self.frames_received.saturating_add(1);
    }

    pub fn record_sent(&mut self) {
        self.frames_sent = self.frames_sent.saturating_add(1);
    }

    pub fn record_malformed(&mut self) {
        self.malformed_frames = self.malformed_frames.saturating_add(1);
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnects = self.reconnects.saturating_add(1);
    }

    pub fn record_transport_error(&mut self, context: &str, error: &str) {
        if self.recent_errors.len() == MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(TransportErrorRecord {
            at: Instant::now(),
            context: truncate_string(context),
            error: truncate_string(error),
        });
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            ready_for: self.ready_since.map(|at| at.elapsed()),
            last_frame_age: self.last_frame_received.map(|at| at.elapsed()),
            frames_received: self.frames_received,
            frames_sent: self.frames_sent,
            malformed_frames: self.malformed_frames,
            reconnects: self.reconnects,
            recent_errors: self.recent_errors.iter().cloned().collect(),
        }
    }
}

/// Snapshot of [`ChannelHealth`].
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub ready_for: Option<Duration>,
    pub last_frame_age: Option<Duration>,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub malformed_frames: u64,
    pub reconnects: u64,
    pub recent_errors: Vec<TransportErrorRecord>,
}
