//! Capability Aggregator.
//!
//! Merges the tools, resources and prompts advertised by every Ready endpoint
//! into one namespaced catalog (`<endpoint>_<item>`), published as an
//! immutable snapshot.

pub mod aggregator;
pub mod errors;
pub mod filter;
pub mod types;

pub use aggregator::{Aggregator, CapabilitySource};
pub use errors::CatalogError;
pub use filter::{namespaced, sanitize, NameFilter};
pub use types::{Capability, CapabilityKind, Catalog, Conflict, RoutingEntry};
