//! Id-keyed message arena for one conversation.

use std::collections::HashSet;

use super::message::{ChatMessage, DeliveryStatus, MessageBody};

/// Messages of one conversation, sorted by `(sent_at, id)`, with unique ids.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
    ids: HashSet<String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.position(id).map(|idx| &self.messages[idx])
    }

    fn position(&self, id: &str) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().position(|m| m.id == id)
    }

    /// Insert in order. Returns false (and keeps the existing entry) if the id is known.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let idx = {
            let key = message.sort_key();
            self.messages.partition_point(|m| m.sort_key() <= key)
        };
        self.messages.insert(idx, message);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<ChatMessage> {
        let idx = self.position(id)?;
        self.ids.remove(id);
        Some(self.messages.remove(idx))
    }

    /// Swap a placeholder for its confirmed copy. If the confirmed id is already present the
    /// placeholder is simply dropped.
    pub fn replace(&mut self, temp_id: &str, confirmed: ChatMessage) -> bool {
        let removed = self.remove(temp_id).is_some();
        let inserted = self.insert(confirmed);
        removed || inserted
    }

    /// Oldest optimistic entry from `sender_id` still being sent whose body equals `body`.
    /// Failed placeholders never match; they stay put until retried.
    pub fn echo_target(&self, sender_id: &str, body: &MessageBody) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| {
            m.is_optimistic()
                && m.status == DeliveryStatus::Sending
                && m.sender_id == sender_id
                && &m.body == body
        })
    }

    pub fn set_status(&mut self, id: &str, status: DeliveryStatus) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        self.messages[idx].status = status;
        true
    }

    pub fn mark_read(&mut self, id: &str, read: bool) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        let changed = self.messages[idx].read != read;
        self.messages[idx].read = read;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::DeliveryOrigin;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(sec: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + Duration::seconds(sec)
    }

    fn msg(id: &str, sec: i64, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            conversation_id: "b1".into(),
            sender_id: "peer".into(),
            receiver_id: Some("me".into()),
            body: MessageBody::Text(text.into()),
            sent_at: at(sec),
            read: false,
            origin: DeliveryOrigin::Poll,
            status: DeliveryStatus::Sent,
        }
    }

    fn ids(store: &MessageStore) -> Vec<&str> {
        store.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn keeps_time_then_id_order() {
        let mut store = MessageStore::new();
        assert!(store.insert(msg("c", 2, "x")));
        assert!(store.insert(msg("b", 1, "x")));
        assert!(store.insert(msg("a", 2, "x")));
        assert_eq!(ids(&store), vec!["b", "a", "c"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut store = MessageStore::new();
        assert!(store.insert(msg("a", 1, "first")));
        assert!(!store.insert(msg("a", 5, "second")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().body.text(), "first");
    }

    #[test]
    fn replace_resorts_and_tolerates_existing_confirmed_id() {
        let mut store = MessageStore::new();
        store.insert(msg("a", 1, "x"));
        let mut temp = ChatMessage::optimistic("tmp-1".into(), "b1", "me", "peer", "hi".into(), at(10));
        temp.status = DeliveryStatus::Sending;
        store.insert(temp);
        store.insert(msg("z", 5, "x"));
        assert_eq!(ids(&store), vec!["a", "z", "tmp-1"]);

        let mut confirmed = msg("m9", 3, "hi");
        confirmed.sender_id = "me".into();
        assert!(store.replace("tmp-1", confirmed.clone()));
        assert_eq!(ids(&store), vec!["a", "m9", "z"]);

        // A second confirmation for the same message changes nothing.
        assert!(!store.replace("tmp-1", confirmed));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn echo_target_picks_oldest_matching_placeholder() {
        let mut store = MessageStore::new();
        store.insert(ChatMessage::optimistic("tmp-2".into(), "b1", "me", "peer", "ok".into(), at(2)));
        store.insert(ChatMessage::optimistic("tmp-1".into(), "b1", "me", "peer", "ok".into(), at(1)));
        store.insert(ChatMessage::optimistic("tmp-3".into(), "b1", "me", "peer", "other".into(), at(0)));
        let target = store
            .echo_target("me", &MessageBody::Text("ok".into()))
            .map(|m| m.id.clone());
        assert_eq!(target.as_deref(), Some("tmp-1"));
        assert!(store.echo_target("peer", &MessageBody::Text("ok".into())).is_none());
    }

    #[test]
    fn failed_placeholder_is_not_an_echo_target() {
        let mut store = MessageStore::new();
        store.insert(ChatMessage::optimistic("tmp-1".into(), "b1", "me", "peer", "hi".into(), at(1)));
        store.set_status(
            "tmp-1",
            DeliveryStatus::Failed {
                reason: "offline".into(),
            },
        );
        assert!(store.echo_target("me", &MessageBody::Text("hi".into())).is_none());

        store.insert(ChatMessage::optimistic("tmp-2".into(), "b1", "me", "peer", "hi".into(), at(2)));
        let target = store
            .echo_target("me", &MessageBody::Text("hi".into()))
            .map(|m| m.id.clone());
        assert_eq!(target.as_deref(), Some("tmp-2"));
    }

    #[test]
    fn status_and_read_updates() {
        let mut store = MessageStore::new();
        store.insert(msg("a", 1, "x"));
        assert!(store.set_status(
            "a",
            DeliveryStatus::Failed {
                reason: "offline".into()
            }
        ));
        assert!(store.get("a").unwrap().is_failed());
        assert!(store.mark_read("a", true));
        assert!(!store.mark_read("a", true));
        assert!(!store.set_status("missing", DeliveryStatus::Sent));
        assert!(store.remove("a").is_some());
        assert!(!store.contains("a"));
    }
}
