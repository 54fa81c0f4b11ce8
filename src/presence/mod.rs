//! Presence: live WebSocket channels and the hub that routes events to them.

pub mod events;
pub mod handler;
pub mod hub;

pub use events::{ChannelEvent, ClientFrame, MessageFrame, NotificationFrame};
pub use handler::{ChannelQuery, ws_handler};
pub use hub::{ChannelId, PresenceHub, Registration, Scope};
