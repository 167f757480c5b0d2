//! Connection Manager.
//!
//! Owns the lifecycle of every upstream endpoint: spawning or dialing it,
//! the initialize exchange, framed request/response correlation, notification
//! fan-out, and bounded reconnection. Process endpoints speak
//! Content-Length framed JSON-RPC over stdio; HTTP endpoints POST requests
//! and stream server events. Both sit behind the [`Transport`] trait.

pub mod errors;
pub mod framing;
pub mod http;
pub mod lifecycle;
pub mod manager;
pub mod session;
#[cfg(test)]
pub mod testing;
pub mod transport;
pub mod types;

pub use errors::UpstreamError;
pub use lifecycle::BackoffPolicy;
pub use manager::{ConnectionManager, EndpointHandle, NotificationStream};
pub use transport::{Connector, DefaultConnector, Transport};
pub use types::{
    ConnectionState, EndpointConfig, EndpointEvent, EndpointTransport, Notification,
    TransportKind, UpstreamInfo, LATEST_PROTOCOL_VERSION, LEGACY_PROTOCOL_VERSION,
    PROTOCOL_VERSIONS,
};
