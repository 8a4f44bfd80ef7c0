pub mod dispatcher;
pub mod severity;

pub use dispatcher::{
    ChannelNotification, DEFAULT_PAGE_SIZE, DEFAULT_POLL_INTERVAL, GetCursor, GetPollStats,
    GetUnreadCount, NotificationDispatcher, NotificationDispatcherArgs, PageFetched, PollNow,
    StopPolling,
};
pub use severity::{alert_for, severity_for};
