//! Front ends that expose the hub to clients.

pub mod http;
pub mod stdio;

pub use http::{build_app, serve_http};
pub use stdio::{serve_io, serve_stdio};
