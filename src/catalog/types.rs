//! Catalog data model.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

// ─── Capability Kinds ────────────────────────────────────────────────────────

/// What an endpoint can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Tool,
        CapabilityKind::Resource,
        CapabilityKind::Prompt,
    ];

    /// Listing method on the endpoint.
    pub fn list_method(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools/list",
            CapabilityKind::Resource => "resources/list",
            CapabilityKind::Prompt => "prompts/list",
        }
    }

    /// Array key in the listing result.
    pub fn result_key(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools",
            CapabilityKind::Resource => "resources",
            CapabilityKind::Prompt => "prompts",
        }
    }

    /// Parse a `notifications/<kind>/list_changed` method.
    pub fn from_list_changed(method: &str) -> Option<CapabilityKind> {
        match method {
            "notifications/tools/list_changed" => Some(CapabilityKind::Tool),
            "notifications/resources/list_changed" => Some(CapabilityKind::Resource),
            "notifications/prompts/list_changed" => Some(CapabilityKind::Prompt),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
        };
        f.write_str(s)
    }
}

// ─── Entries ─────────────────────────────────────────────────────────────────

/// One advertised item, as presented to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capability {
    pub kind: CapabilityKind,
    /// Globally unique name: `<endpoint>_<item>`, sanitized.
    pub namespaced: String,
    pub original: String,
    pub endpoint: String,
    /// The advertised item with `name` (and description) rewritten.
    pub item: Value,
}

/// Where a namespaced name is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub endpoint: String,
    pub original: String,
}

/// A namespaced name claimed by more than one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub kind: CapabilityKind,
    pub namespaced: String,
    pub kept_endpoint: String,
    pub dropped_endpoint: String,
    pub dropped_original: String,
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// Immutable merged view over every Ready endpoint.
///
/// Rebuilt wholesale and swapped in; never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub generation: u64,
    pub(crate) entries: Vec<Capability>,
    pub(crate) routes: HashMap<(CapabilityKind, String), RoutingEntry>,
    /// Resource URI → owning endpoint.
    pub(crate) uri_index: HashMap<String, String>,
    pub conflicts: Vec<Conflict>,
}

impl Catalog {
    pub fn lookup(&self, kind: CapabilityKind, namespaced: &str) -> Option<&RoutingEntry> {
        self.routes.get(&(kind, namespaced.to_string()))
    }

    /// Endpoint that advertised `uri`.
    pub fn resource_by_uri(&self, uri: &str) -> Option<&str> {
        self.uri_index.get(uri).map(String::as_str)
    }

    /// Presented items of one kind, in catalog order.
    pub fn list(&self, kind: CapabilityKind) -> Vec<Value> {
        self.entries
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.item.clone())
            .collect()
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: CapabilityKind) -> usize {
        self.entries.iter().filter(|c| c.kind == kind).count()
    }

    /// Namespaced name for `(endpoint, original)`, if present.
    pub fn namespaced_for(&self, kind: CapabilityKind, endpoint: &str, original: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|c| c.kind == kind && c.endpoint == endpoint && c.original == original)
            .map(|c| c.namespaced.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_changed_methods() {
        assert_eq!(
            CapabilityKind::from_list_changed("notifications/prompts/list_changed"),
            Some(CapabilityKind::Prompt)
        );
        assert_eq!(CapabilityKind::from_list_changed("notifications/message"), None);
        for kind in CapabilityKind::ALL {
            assert!(kind.list_method().starts_with(kind.result_key()));
        }
    }
}
