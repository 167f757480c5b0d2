//! Request Router.
//!
//! Front-facing handshake, routing of namespaced calls to their owning
//! endpoint, and notification relay. [`server`] wires the router to stdio
//! and HTTP clients.

pub mod errors;
pub mod handshake;
pub mod hub;
pub mod server;

pub use errors::RouterError;
pub use handshake::{merge_features, negotiate_version, NegotiatedCapabilities};
pub use hub::{Router, RouterConfig};
