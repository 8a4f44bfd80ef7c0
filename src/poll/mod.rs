//! Change-detection polling: cursor diffing and the scheduled poll task.

pub mod cursor;
pub mod task;

pub use cursor::{ChangeCursor, ChangeSet, CursorItem, NotificationCursor, detect_changes};
pub use task::{PollStatsSnapshot, PollTask};
