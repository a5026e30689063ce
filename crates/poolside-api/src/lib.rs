// poolside-api: Async line-protocol client for IntelliCenter-style pool controllers

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow;
pub mod heartbeat;
pub mod message;

pub use codec::MessageCodec;
pub use connection::{
    CloseReason, Connection, ConnectionConfig, DEFAULT_PORT, LinkState, NotificationHandler,
};
pub use error::{DispatchError, Error};
pub use flow::CorrelationPolicy;
pub use heartbeat::HeartbeatConfig;
pub use message::{Notification, ObjectEntry, ObjectQuery, Params, Response};
