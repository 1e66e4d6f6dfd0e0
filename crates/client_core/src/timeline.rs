use chrono::{FixedOffset, NaiveDate};
use shared::protocol::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    DaySeparator(NaiveDate),
    Message(Message),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimelineOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// `messages` must be ascending. A separator precedes the first message of
/// every calendar day in `offset`.
pub fn build_timeline(
    messages: &[Message],
    offset: FixedOffset,
    order: TimelineOrder,
) -> Vec<TimelineEntry> {
    let mut entries = Vec::with_capacity(messages.len() + 1);
    let mut previous_day = None;
    for message in messages {
        let day = message.created_at.with_timezone(&offset).date_naive();
        if previous_day != Some(day) {
            entries.push(TimelineEntry::DaySeparator(day));
            previous_day = Some(day);
        }
        entries.push(TimelineEntry::Message(message.clone()));
    }

    if order == TimelineOrder::NewestFirst {
        entries.reverse();
    }
    entries
}
