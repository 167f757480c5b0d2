//! Capability aggregator.
//!
//! Keeps one contribution per endpoint (its filtered, namespaced listings)
//! and rebuilds the merged [`Catalog`] from all contributions in
//! registration order whenever one changes. The result is installed with a
//! single pointer swap, so readers always see a complete catalog.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::errors::CatalogError;
use super::filter::{namespaced, NameFilter};
use super::types::{Capability, CapabilityKind, Catalog, Conflict, RoutingEntry};
use crate::upstream::types::error_codes;
use crate::upstream::{ConnectionManager, EndpointConfig, UpstreamError};

/// Upper bound on listing pages fetched per kind.
const MAX_PAGES: usize = 100;

// ─── Source ──────────────────────────────────────────────────────────────────

/// Where listings come from.
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    /// One page of `kind` listings from `endpoint`.
    async fn list_page(
        &self,
        endpoint: &str,
        kind: CapabilityKind,
        cursor: Option<&str>,
    ) -> Result<Value, UpstreamError>;
}

#[async_trait]
impl CapabilitySource for ConnectionManager {
    async fn list_page(
        &self,
        endpoint: &str,
        kind: CapabilityKind,
        cursor: Option<&str>,
    ) -> Result<Value, UpstreamError> {
        let handle = self.handle(endpoint)?;
        let params = cursor.map(|c| json!({ "cursor": c }));
        self.call(&handle, kind.list_method(), params, None).await
    }
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

struct Member {
    name: String,
    filter: NameFilter,
}

#[derive(Default)]
struct Contributions {
    by_endpoint: HashMap<String, Vec<Capability>>,
    generation: u64,
}

/// Builds and publishes the namespaced catalog.
pub struct Aggregator {
    source: Arc<dyn CapabilitySource>,
    members: StdRwLock<Vec<Member>>,
    global_tools: NameFilter,
    snapshot: StdRwLock<Arc<Catalog>>,
    /// Serializes rebuilds.
    contributions: Mutex<Contributions>,
}

impl Aggregator {
    /// `global_tools` filters namespaced tool names hub-wide.
    pub fn new(source: Arc<dyn CapabilitySource>, global_tools: NameFilter) -> Self {
        Self {
            source,
            members: StdRwLock::new(Vec::new()),
            global_tools,
            snapshot: StdRwLock::new(Arc::new(Catalog::default())),
            contributions: Mutex::new(Contributions::default()),
        }
    }

    /// Add an endpoint. Registration order is collision priority.
    pub fn add_endpoint(&self, name: &str, filter: NameFilter) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if members.iter().any(|m| m.name == name) {
            return;
        }
        members.push(Member {
            name: name.to_string(),
            filter,
        });
    }

    /// Add an endpoint with the filters from its configuration.
    pub fn add_endpoint_config(&self, config: &EndpointConfig) {
        self.add_endpoint(
            &config.name,
            NameFilter::new(config.include.as_deref(), config.exclude.as_deref()),
        );
    }

    /// The current catalog. Never blocks on a rebuild.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-fetch one endpoint's listings and swap in a rebuilt catalog.
    ///
    /// On failure the endpoint's previous contribution stays in place.
    pub async fn refresh(&self, endpoint: &str) -> Result<Arc<Catalog>, CatalogError> {
        let filter = self
            .member_filter(endpoint)
            .ok_or_else(|| CatalogError::UnknownEndpoint {
                name: endpoint.to_string(),
            })?;

        let mut contributions = self.contributions.lock().await;
        let mut items = Vec::new();
        for kind in CapabilityKind::ALL {
            let listed = self.fetch_all(endpoint, kind).await?;
            items.extend(present(endpoint, kind, listed, &filter));
        }
        tracing::debug!(endpoint, items = items.len(), "endpoint contribution fetched");
        contributions
            .by_endpoint
            .insert(endpoint.to_string(), items);
        Ok(self.rebuild(&mut contributions))
    }

    /// Drop an endpoint's contribution (it closed).
    pub async fn remove(&self, endpoint: &str) -> Arc<Catalog> {
        let mut contributions = self.contributions.lock().await;
        if contributions.by_endpoint.remove(endpoint).is_none() {
            return self.snapshot();
        }
        tracing::info!(endpoint, "endpoint removed from catalog");
        self.rebuild(&mut contributions)
    }

    /// Refresh every member. Failures are reported per endpoint.
    pub async fn refresh_all(&self) -> Vec<(String, CatalogError)> {
        let names: Vec<String> = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|m| m.name.clone())
            .collect();
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.refresh(&name).await {
                tracing::warn!(endpoint = %name, error = %e, "catalog refresh failed");
                failures.push((name, e));
            }
        }
        failures
    }

    fn member_filter(&self, endpoint: &str) -> Option<NameFilter> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|m| m.name == endpoint)
            .map(|m| m.filter.clone())
    }

    /// Follow `nextCursor` until the listing is exhausted.
    async fn fetch_all(&self, endpoint: &str, kind: CapabilityKind) -> Result<Vec<Value>, CatalogError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page = match self.source.list_page(endpoint, kind, cursor.as_deref()).await {
                Ok(page) => page,
                Err(UpstreamError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                    tracing::debug!(endpoint, %kind, "endpoint does not list this kind");
                    return Ok(Vec::new());
                }
                Err(source) => {
                    return Err(CatalogError::Listing {
                        endpoint: endpoint.to_string(),
                        kind,
                        source,
                    })
                }
            };

            match page.get(kind.result_key()) {
                Some(Value::Array(listed)) => items.extend(listed.iter().cloned()),
                None | Some(Value::Null) => {}
                Some(_) => {
                    return Err(CatalogError::InvalidListing {
                        endpoint: endpoint.to_string(),
                        kind,
                        reason: format!("'{}' is not an array", kind.result_key()),
                    })
                }
            }

            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(items),
            }
        }

        tracing::warn!(endpoint, %kind, pages = MAX_PAGES, "listing truncated");
        Ok(items)
    }

    /// Merge all contributions in registration order and swap the result in.
    fn rebuild(&self, contributions: &mut Contributions) -> Arc<Catalog> {
        contributions.generation += 1;
        let mut catalog = Catalog {
            generation: contributions.generation,
            ..Catalog::default()
        };

        let order: Vec<String> = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|m| m.name.clone())
            .collect();

        for endpoint in &order {
            let Some(items) = contributions.by_endpoint.get(endpoint) else {
                continue;
            };
            for cap in items {
                if cap.kind == CapabilityKind::Tool && !self.global_tools.allows(&cap.namespaced) {
                    continue;
                }
                let key = (cap.kind, cap.namespaced.clone());
                if let Some(kept) = catalog.routes.get(&key) {
                    let conflict = Conflict {
                        kind: cap.kind,
                        namespaced: cap.namespaced.clone(),
                        kept_endpoint: kept.endpoint.clone(),
                        dropped_endpoint: cap.endpoint.clone(),
                        dropped_original: cap.original.clone(),
                    };
                    tracing::warn!(
                        kind = %conflict.kind,
                        name = %conflict.namespaced,
                        kept = %conflict.kept_endpoint,
                        dropped = %conflict.dropped_endpoint,
                        "namespaced name collision, keeping first"
                    );
                    catalog.conflicts.push(conflict);
                    continue;
                }
                if cap.kind == CapabilityKind::Resource {
                    if let Some(uri) = cap.item.get("uri").and_then(Value::as_str) {
                        catalog
                            .uri_index
                            .entry(uri.to_string())
                            .or_insert_with(|| cap.endpoint.clone());
                    }
                }
                catalog.routes.insert(
                    key,
                    RoutingEntry {
                        endpoint: cap.endpoint.clone(),
                        original: cap.original.clone(),
                    },
                );
                catalog.entries.push(cap.clone());
            }
        }

        tracing::info!(
            generation = catalog.generation,
            tools = catalog.count(CapabilityKind::Tool),
            resources = catalog.count(CapabilityKind::Resource),
            prompts = catalog.count(CapabilityKind::Prompt),
            conflicts = catalog.conflicts.len(),
            "catalog rebuilt"
        );

        let catalog = Arc::new(catalog);
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = catalog.clone();
        catalog
    }
}

/// Filter, namespace and decorate one endpoint's listed items.
fn present(endpoint: &str, kind: CapabilityKind, listed: Vec<Value>, filter: &NameFilter) -> Vec<Capability> {
    let mut out = Vec::with_capacity(listed.len());
    for mut item in listed {
        let Some(original) = item.get("name").and_then(Value::as_str).map(str::to_string) else {
            tracing::warn!(endpoint, %kind, "skipping listed item without a name");
            continue;
        };
        if !filter.allows(&original) {
            continue;
        }
        let name = namespaced(endpoint, &original);
        item["name"] = Value::String(name.clone());
        if let Some(desc) = item.get("description").and_then(Value::as_str) {
            if !desc.is_empty() {
                item["description"] = Value::String(format!("[{endpoint}] {desc}"));
            }
        }
        out.push(Capability {
            kind,
            namespaced: name,
            original,
            endpoint: endpoint.to_string(),
            item,
        });
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
