//! Change detection against a last-seen cursor.
//!
//! Pages arrive newest first and the server offers no "since" parameter, so the delta is found
//! by scanning from the head of the page down to the cursor position.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::api::models::Notification;

/// How an item exposes its cursor position.
pub trait CursorItem {
    fn cursor_id(&self) -> &str;
    fn cursor_time(&self) -> Option<DateTime<Utc>>;
}

impl CursorItem for Notification {
    fn cursor_id(&self) -> &str {
        &self.id
    }

    fn cursor_time(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

/// Ids remembered for duplicate suppression; several pages' worth.
const SEEN_CAPACITY: usize = 256;

/// Last-seen position of a newest-first feed.
///
/// Once initialized the position only moves forward: to an unseen id at the head of a later
/// page, or to an unseen pushed item. When both sides carry timestamps, `(created_at, id)` must
/// also order after the current position. Ids already observed on a page or a push are never
/// newer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeCursor {
    last_seen_id: Option<String>,
    last_seen_at: Option<DateTime<Utc>>,
    initialized_at: Option<DateTime<Utc>>,
    seen: VecDeque<String>,
}

pub type NotificationCursor = ChangeCursor;

/// Result of diffing one page against the cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet<T> {
    /// Id at position 0 of the page, if any.
    pub newest_id: Option<String>,
    /// Items newer than the cursor, newest first.
    pub new_items: Vec<T>,
    /// The cursor was uninitialized; nothing is reported.
    pub first_poll: bool,
    /// The cursor position was not on the page, so the whole page is reported.
    pub truncated: bool,
}

impl<T> ChangeSet<T> {
    pub fn is_empty(&self) -> bool {
        self.new_items.is_empty()
    }

    /// New items oldest first, the order alerts are presented in.
    pub fn into_oldest_first(self) -> Vec<T> {
        let mut items = self.new_items;
        items.reverse();
        items
    }
}

impl ChangeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen_id(&self) -> Option<&str> {
        self.last_seen_id.as_deref()
    }

    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.last_seen_at
    }

    pub fn initialized_at(&self) -> Option<DateTime<Utc>> {
        self.initialized_at
    }

    /// Set by the first poll only; pushes never initialize the cursor.
    pub fn is_initialized(&self) -> bool {
        self.initialized_at.is_some()
    }

    /// True if `id` was observed on a recent page or push.
    pub fn has_seen(&self, id: &str) -> bool {
        self.last_seen_id.as_deref() == Some(id) || self.seen.iter().any(|seen| seen == id)
    }

    /// True if `item` sits at or behind the cursor position.
    pub fn covers<T: CursorItem>(&self, item: &T) -> bool {
        let Some(last_id) = self.last_seen_id.as_deref() else {
            return false;
        };
        if item.cursor_id() == last_id {
            return true;
        }
        match (item.cursor_time(), self.last_seen_at) {
            (Some(at), Some(last_at)) => (at, item.cursor_id()) <= (last_at, last_id),
            _ => false,
        }
    }

    /// Diff a newest-first page and move the cursor to its head.
    pub fn observe_page<T: CursorItem>(&mut self, page: Vec<T>, now: DateTime<Utc>) -> ChangeSet<T> {
        let head = page
            .first()
            .map(|item| (item.cursor_id().to_owned(), item.cursor_time()));
        let ids: Vec<String> = page.iter().rev().map(|item| item.cursor_id().to_owned()).collect();
        let changes = detect_changes(self, page);

        if self.initialized_at.is_none() {
            self.initialized_at = Some(now);
        }
        if let Some((id, at)) = head {
            self.advance_if_newer(&id, at);
        }
        for id in ids {
            self.remember(id);
        }
        changes
    }

    /// Move to `id` if it is unseen and ordered after the current position. Returns whether it
    /// moved. The id is remembered either way.
    pub fn advance_if_newer(&mut self, id: &str, created_at: Option<DateTime<Utc>>) -> bool {
        let newer = !self.has_seen(id)
            && match (created_at, self.last_seen_at, self.last_seen_id.as_deref()) {
                (Some(at), Some(last_at), Some(last)) => (at, id) > (last_at, last),
                _ => true,
            };
        if newer {
            self.last_seen_id = Some(id.to_owned());
            self.last_seen_at = created_at.or(self.last_seen_at);
        }
        self.remember(id.to_owned());
        newer
    }

    fn remember(&mut self, id: String) {
        if self.seen.iter().any(|seen| *seen == id) {
            return;
        }
        if self.seen.len() == SEEN_CAPACITY {
            self.seen.pop_front();
        }
        self.seen.push_back(id);
    }
}

/// Pure diff of `page` (newest first) against `cursor`.
///
/// An uninitialized cursor reports nothing; a page whose head equals the cursor is a no-op; a
/// cursor that is not found on the page reports the whole page. Items the cursor has already
/// seen are never reported.
pub fn detect_changes<T: CursorItem>(cursor: &ChangeCursor, page: Vec<T>) -> ChangeSet<T> {
    let newest_id = page.first().map(|item| item.cursor_id().to_owned());

    if !cursor.is_initialized() {
        return ChangeSet {
            newest_id,
            new_items: Vec::new(),
            first_poll: true,
            truncated: false,
        };
    }
    if page.is_empty() || newest_id.as_deref() == cursor.last_seen_id() {
        return ChangeSet {
            newest_id,
            new_items: Vec::new(),
            first_poll: false,
            truncated: false,
        };
    }

    let mut found = false;
    let mut new_items = Vec::with_capacity(page.len());
    for item in page {
        if cursor.covers(&item) {
            found = true;
            break;
        }
        if cursor.has_seen(item.cursor_id()) {
            continue;
        }
        new_items.push(item);
    }

    ChangeSet {
        newest_id,
        new_items,
        first_poll: false,
        truncated: !found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn n(id: &str, minute: i64) -> Notification {
        Notification {
            id: id.to_string(),
            title: format!("title {id}"),
            message: String::new(),
            notification_type: None,
            created_at: Some(at(minute)),
            is_read: false,
        }
    }

    fn ids(items: &[Notification]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn first_poll_is_silent_and_records_head() {
        let mut cursor = ChangeCursor::new();
        let changes = cursor.observe_page(vec![n("c", 3), n("b", 2), n("a", 1)], at(10));
        assert!(changes.first_poll);
        assert!(changes.is_empty());
        assert_eq!(cursor.last_seen_id(), Some("c"));
        assert_eq!(cursor.initialized_at(), Some(at(10)));
    }

    #[test]
    fn head_equal_to_cursor_is_noop() {
        let mut cursor = ChangeCursor::new();
        cursor.observe_page(vec![n("b", 2), n("a", 1)], at(10));
        let changes = cursor.observe_page(vec![n("b", 2), n("a", 1)], at(11));
        assert!(changes.is_empty());
        assert!(!changes.truncated);
        assert_eq!(cursor.last_seen_id(), Some("b"));
    }

    #[test]
    fn scan_stops_at_cursor_and_reports_newest_first() {
        let mut cursor = ChangeCursor::new();
        cursor.observe_page(vec![n("b", 2), n("a", 1)], at(10));
        let changes = cursor.observe_page(vec![n("d", 4), n("c", 3), n("b", 2)], at(11));
        assert_eq!(ids(&changes.new_items), vec!["d", "c"]);
        assert_eq!(changes.newest_id.as_deref(), Some("d"));
        assert!(!changes.truncated);
        assert_eq!(ids(&changes.clone().into_oldest_first()), vec!["c", "d"]);
        assert_eq!(cursor.last_seen_id(), Some("d"));
    }

    #[test]
    fn cursor_missing_from_page_reports_whole_page() {
        let mut cursor = ChangeCursor::new();
        cursor.observe_page(vec![n("a", 1)], at(10));
        let page: Vec<Notification> = (0..20).rev().map(|i| n(&format!("x{i:02}"), 100 + i)).collect();
        let changes = cursor.observe_page(page, at(11));
        assert!(changes.truncated);
        assert_eq!(changes.new_items.len(), 20);
        assert_eq!(cursor.last_seen_id(), Some("x19"));
    }

    #[test]
    fn empty_page_leaves_cursor_unchanged() {
        let mut cursor = ChangeCursor::new();
        cursor.observe_page(vec![n("a", 1)], at(10));
        let before = cursor.clone();
        let changes = cursor.observe_page(Vec::<Notification>::new(), at(11));
        assert!(changes.is_empty());
        assert_eq!(cursor, before);
    }

    #[test]
    fn pushed_item_advances_only_when_newer() {
        let mut cursor = ChangeCursor::new();
        cursor.observe_page(vec![n("b", 2)], at(10));
        assert!(!cursor.advance_if_newer("b", Some(at(2))));
        assert!(!cursor.advance_if_newer("a", Some(at(1))));
        assert!(cursor.advance_if_newer("c", Some(at(3))));
        assert_eq!(cursor.last_seen_id(), Some("c"));

        // A later poll whose head lags behind the pushed item cannot move the cursor back.
        let changes = cursor.observe_page(vec![n("b", 2), n("a", 1)], at(12));
        assert!(changes.is_empty());
        assert_eq!(cursor.last_seen_id(), Some("c"));
    }

    #[test]
    fn cursor_is_monotonic_over_mixed_pages() {
        let mut cursor = ChangeCursor::new();
        let pages = vec![
            vec![n("c", 3), n("b", 2)],
            vec![n("b", 2), n("a", 1)],
            vec![n("e", 5), n("d", 4), n("c", 3)],
            vec![n("d", 4)],
        ];
        let mut last = None;
        for page in pages {
            cursor.observe_page(page, at(20));
            let now = cursor.last_seen_at();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(cursor.last_seen_id(), Some("e"));
    }

    fn bare(id: &str) -> Notification {
        Notification {
            created_at: None,
            ..n(id, 0)
        }
    }

    #[test]
    fn repushed_item_without_timestamp_never_moves_cursor_back() {
        let mut cursor = ChangeCursor::new();
        cursor.observe_page(vec![bare("b"), bare("a")], at(10));
        let changes = cursor.observe_page(vec![bare("c"), bare("b"), bare("a")], at(11));
        assert_eq!(ids(&changes.new_items), vec!["c"]);

        assert!(!cursor.advance_if_newer("a", None));
        assert!(!cursor.advance_if_newer("b", None));
        assert_eq!(cursor.last_seen_id(), Some("c"));
        let again = cursor.observe_page(vec![bare("c"), bare("b"), bare("a")], at(12));
        assert!(again.is_empty());
    }

    #[test]
    fn unseen_push_without_timestamp_advances_once() {
        let mut cursor = ChangeCursor::new();
        cursor.observe_page(vec![bare("a")], at(10));
        assert!(cursor.advance_if_newer("b", None));
        assert!(!cursor.advance_if_newer("b", None));

        // The poll catches up with the pushed item; only the item above it is new.
        let changes = cursor.observe_page(vec![bare("c"), bare("b"), bare("a")], at(11));
        assert_eq!(ids(&changes.new_items), vec!["c"]);
        assert_eq!(cursor.last_seen_id(), Some("c"));
    }

    #[test]
    fn push_before_first_poll_keeps_first_poll_silent() {
        let mut cursor = ChangeCursor::new();
        assert!(cursor.advance_if_newer("x", None));
        assert!(!cursor.is_initialized());

        let page: Vec<Notification> = (0..20).rev().map(|i| bare(&format!("old{i:02}"))).collect();
        let changes = cursor.observe_page(page, at(10));
        assert!(changes.first_poll);
        assert!(changes.is_empty());
        assert!(cursor.is_initialized());
    }

    #[test]
    fn seen_items_are_skipped_when_cursor_is_lost() {
        let mut cursor = ChangeCursor::new();
        cursor.observe_page(vec![bare("b"), bare("a")], at(10));
        assert!(cursor.advance_if_newer("p", None));
        // The pushed id never shows up on the page; already-seen items stay unreported.
        let changes = cursor.observe_page(vec![bare("d"), bare("c"), bare("b"), bare("a")], at(11));
        assert!(changes.truncated);
        assert_eq!(ids(&changes.new_items), vec!["d", "c"]);
    }
}
