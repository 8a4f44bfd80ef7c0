//! Real-time delivery layer for the marketplace client.
//!
//! A kameo-supervised duplex channel, change-detection polling for notifications, staggered
//! alert presentation and per-conversation chat synchronization, behind [`RealtimeService`].

pub mod alert;
pub mod api;
pub mod channel;
pub mod chat;
pub mod config;
pub mod core;
pub mod notify;
pub mod poll;
pub mod service;
pub mod testing;
pub mod transport;

pub use alert::{Alert, AlertId, AlertPresenter, AlertRequest, LogPresenter, Severity};
pub use api::{HttpMarketplaceApi, MarketplaceApi, Notification, SharedApi, WireChatMessage};
pub use channel::{Event, EventFilter, EventKind, EventRegistry, FrameSender, Subscription};
pub use chat::{ChatMessage, DeliveryOrigin, DeliveryStatus, MessageBody, SendTicket, group_by_day};
pub use config::RealtimeConfig;
pub use core::{ConnectionState, RealtimeError, RealtimeResult, Role, Session, SessionFault};
pub use service::{ChatSubscription, RealtimeService};
