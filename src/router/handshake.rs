//! Front-facing negotiation: protocol version and merged feature set.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::upstream::{LATEST_PROTOCOL_VERSION, LEGACY_PROTOCOL_VERSION, PROTOCOL_VERSIONS};

/// Feature keys the hub re-advertises.
const FEATURE_KEYS: &[&str] = &["tools", "resources", "prompts", "logging", "completions"];

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NegotiatedCapabilities {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    /// Endpoints that were Ready and are part of the catalog.
    #[serde(skip)]
    pub endpoints: Vec<String>,
    /// Endpoints still pending (or closed) when the handshake finished.
    #[serde(skip)]
    pub excluded: Vec<String>,
}

fn version_rank(version: &str) -> Option<usize> {
    PROTOCOL_VERSIONS.iter().position(|v| *v == version)
}

/// Pick the protocol version to offer front-end clients.
///
/// The minimum over what Ready endpoints reported, capped at our newest.
/// A version we do not understand, a missing version, or no endpoints at all
/// fall back to the legacy revision. A known client version also caps it.
pub fn negotiate_version(reported: &[Option<String>], client: Option<&str>) -> &'static str {
    if reported.is_empty() {
        return LEGACY_PROTOCOL_VERSION;
    }
    let mut rank = version_rank(LATEST_PROTOCOL_VERSION).unwrap_or(0);
    for version in reported {
        match version.as_deref().and_then(version_rank) {
            Some(r) => rank = rank.min(r),
            None => return LEGACY_PROTOCOL_VERSION,
        }
    }
    if let Some(r) = client.and_then(version_rank) {
        rank = rank.min(r);
    }
    PROTOCOL_VERSIONS[rank]
}

/// Union of advertised features. Boolean sub-flags (`listChanged`,
/// `subscribe`) are OR-ed; other sub-values keep the first seen.
pub fn merge_features<'a>(advertised: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut merged: Map<String, Value> = Map::new();
    for caps in advertised {
        for key in FEATURE_KEYS {
            let Some(feature) = caps.get(*key) else {
                continue;
            };
            if feature.is_null() {
                continue;
            }
            let slot = merged
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let (Some(into), Some(from)) = (slot.as_object_mut(), feature.as_object()) else {
                continue;
            };
            for (flag, value) in from {
                match (into.get_mut(flag), value) {
                    (Some(Value::Bool(existing)), Value::Bool(b)) => *existing |= *b,
                    (None, v) => {
                        into.insert(flag.clone(), v.clone());
                    }
                    _ => {}
                }
            }
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_version_is_minimum_of_endpoints() {
        assert_eq!(negotiate_version(&[v("2025-06-18"), v("2025-03-26")], None), "2025-03-26");
        assert_eq!(negotiate_version(&[v("2025-06-18")], None), "2025-06-18");
        assert_eq!(
            negotiate_version(&[v("2025-06-18")], Some("2025-03-26")),
            "2025-03-26"
        );
        // Unknown client versions do not matter.
        assert_eq!(negotiate_version(&[v("2025-06-18")], Some("1999-01-01")), "2025-06-18");
    }

    #[test]
    fn test_unknown_or_missing_versions_fall_back_to_legacy() {
        assert_eq!(negotiate_version(&[], None), LEGACY_PROTOCOL_VERSION);
        assert_eq!(
            negotiate_version(&[v("2025-06-18"), v("2030-01-01")], None),
            LEGACY_PROTOCOL_VERSION
        );
        assert_eq!(negotiate_version(&[v("2025-06-18"), None], None), LEGACY_PROTOCOL_VERSION);
    }

    #[test]
    fn test_features_are_unioned_and_flags_ored() {
        let a = json!({"tools": {"listChanged": false}, "logging": {}});
        let b = json!({"tools": {"listChanged": true}, "resources": {"subscribe": true}, "sampling": {}});
        let merged = merge_features([&a, &b]);
        assert_eq!(
            merged,
            json!({
                "tools": {"listChanged": true},
                "logging": {},
                "resources": {"subscribe": true}
            })
        );
        assert_eq!(merge_features(std::iter::empty()), json!({}));
    }
}
