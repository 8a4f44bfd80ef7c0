//! Chat session synchronization: message model, per-conversation store and controller.

pub mod controller;
pub mod grouping;
pub mod message;
pub mod store;

pub use controller::{
    ChatSessionArgs, ChatSessionController, ChatView, CloseChat, DEFAULT_CHAT_POLL_INTERVAL,
    GetChatPollStats, GetMessages, RefreshHistory, RetrySend, SendChat, SendTicket, TypingFrame,
    WatchMessages,
};
pub use grouping::{DayGroup, DayLabel, day_label, group_by_day};
pub use message::{ChatMessage, DeliveryOrigin, DeliveryStatus, MessageBody};
pub use store::MessageStore;
