//! Duplex event channel: wire events, subscriber registry and the supervising actor.

pub mod event;
pub mod registry;
pub mod sender;
pub mod supervisor;
pub mod writer;

pub use event::{
    BookingStage, BookingUpdate, ClientFrame, EmergencyRequest, Event, EventKind, LocationUpdate,
    PaymentUpdate,
};
pub use registry::{EventFilter, EventRegistry, Listener, Subscription};
pub use sender::{FrameSender, SharedFrameSender};
pub use supervisor::{
    Connect, ConnectionSupervisor, DEFAULT_AUTH_TIMEOUT, GetChannelStats, GetConnectionState,
    Logout, ReconnectNow, SendFrame, SupervisorArgs,
};
pub use writer::{ChannelWriter, WriteFrame};
