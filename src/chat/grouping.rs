//! Day buckets for display. Pure projection over an ordered message list.

use std::fmt;

use chrono::{Duration, FixedOffset, NaiveDate};

use super::message::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayLabel {
    Today,
    Yesterday,
    Date(NaiveDate),
}

impl fmt::Display for DayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayLabel::Today => f.write_str("Today"),
            DayLabel::Yesterday => f.write_str("Yesterday"),
            DayLabel::Date(date) => write!(f, "{}", date.format("%B %-d, %Y")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup<'a> {
    pub date: NaiveDate,
    pub label: DayLabel,
    pub messages: Vec<&'a ChatMessage>,
}

pub fn day_label(date: NaiveDate, today: NaiveDate) -> DayLabel {
    if date == today {
        DayLabel::Today
    } else if Some(date) == today.checked_sub_signed(Duration::days(1)) {
        DayLabel::Yesterday
    } else {
        DayLabel::Date(date)
    }
}

/// Group consecutive messages by local calendar day in `offset`.
///
/// `today` is passed in so the projection is deterministic.
pub fn group_by_day<'a>(
    messages: &'a [ChatMessage],
    today: NaiveDate,
    offset: FixedOffset,
) -> Vec<DayGroup<'a>> {
    let mut groups: Vec<DayGroup<'a>> = Vec::new();
    for message in messages {
        let date = message.sent_at.with_timezone(&offset).date_naive();
        match groups.last_mut() {
            Some(group) if group.date == date => group.messages.push(message),
            _ => groups.push(DayGroup {
                date,
                label: day_label(date, today),
                messages: vec![message],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::{DeliveryOrigin, DeliveryStatus, MessageBody};
    use chrono::{TimeZone, Utc};

    fn msg(id: &str, day: u32, hour: u32) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            conversation_id: "b1".into(),
            sender_id: "u".into(),
            receiver_id: None,
            body: MessageBody::Text(id.into()),
            sent_at: Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap(),
            read: true,
            origin: DeliveryOrigin::Poll,
            status: DeliveryStatus::Sent,
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    #[test]
    fn labels_today_yesterday_and_dates() {
        let messages = vec![msg("a", 1, 9), msg("b", 9, 8), msg("c", 10, 7), msg("d", 10, 20)];
        let utc = FixedOffset::east_opt(0).unwrap();
        let groups = group_by_day(&messages, date(10), utc);
        let labels: Vec<String> = groups.iter().map(|g| g.label.to_string()).collect();
        assert_eq!(labels, vec!["May 1, 2024", "Yesterday", "Today"]);
        assert_eq!(groups[2].messages.len(), 2);
    }

    #[test]
    fn offset_moves_messages_across_midnight() {
        let messages = vec![msg("late", 9, 23)];
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let groups = group_by_day(&messages, date(10), plus_two);
        assert_eq!(groups[0].label, DayLabel::Today);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(group_by_day(&[], date(1), FixedOffset::east_opt(0).unwrap()).is_empty());
    }
}
