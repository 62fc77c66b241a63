pub mod connection;
pub mod handler;
pub mod hub;
pub mod protocol;

pub use connection::{ConnectionState, Lifecycle};
pub use hub::{ConnectionHandle, ConnectionId, Hub, HubClosed, HubHandle, HubStats, Outbound};
