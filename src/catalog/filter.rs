//! Name sanitization, namespacing and include/exclude filters.

/// Map every character outside `[A-Za-z0-9_]` to `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// `sanitize(endpoint) + "_" + sanitize(item)`.
pub fn namespaced(endpoint: &str, item: &str) -> String {
    format!("{}_{}", sanitize(endpoint), sanitize(item))
}

/// Include-then-exclude filter over names.
///
/// Patterns are sanitized once, so `create-issue` in config matches an item
/// advertised as `create.issue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NameFilter {
    include: Option<Vec<String>>,
    exclude: Vec<String>,
}

impl NameFilter {
    pub fn new(include: Option<&[String]>, exclude: Option<&[String]>) -> Self {
        Self {
            include: include.map(|names| names.iter().map(|n| sanitize(n)).collect()),
            exclude: exclude
                .map(|names| names.iter().map(|n| sanitize(n)).collect())
                .unwrap_or_default(),
        }
    }

    /// Allows everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_empty()
    }

    pub fn allows(&self, name: &str) -> bool {
        let name = sanitize(name);
        if let Some(include) = &self.include {
            if !include.contains(&name) {
                return false;
            }
        }
        !self.exclude.contains(&name)
    }
}
