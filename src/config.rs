//! Hub configuration loading.
//!
//! Accepts two layouts for the upstream list:
//! - array form: `{"servers": [{name, command, args, env, ...}]}` (or
//!   `"upstream"` as the key);
//! - keyed form: `{"mcpServers": {name: {command, args, env, disabled, tools}}}`.
//!
//! Files ending in `.yaml`/`.yml` are read as YAML, anything else as JSON.
//! `${VAR}` and `${VAR:-default}` are resolved in endpoint env values,
//! URLs and headers. `SWITCHYARD_*` environment variables override the
//! file; CLI flags override both.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::catalog::NameFilter;
use crate::errors::ErrorKind;
use crate::router::RouterConfig;
use crate::upstream::types::DEFAULT_CALL_TIMEOUT;
use crate::upstream::{BackoffPolicy, EndpointConfig, EndpointTransport};
use crate::workflow::{BreakerConfig, EngineConfig};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }

    fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            reason: reason.into(),
        }
    }
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// How the hub faces its own client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TransportMode {
    #[serde(rename = "stdio")]
    Stdio,
    #[serde(rename = "http-sse")]
    HttpSse,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default = "default_mode")]
    pub mode: TransportMode,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_sse_path")]
    pub sse_path: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            host: default_host(),
            port: default_port(),
            sse_path: default_sse_path(),
        }
    }
}

fn default_mode() -> TransportMode {
    TransportMode::Stdio
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    7332
}
fn default_sse_path() -> String {
    "/events".into()
}

/// Where and how logs are written.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default)]
    pub level: Option<String>,
    /// Log file instead of stderr. Rotated at startup.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

/// Fully resolved hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub name: String,
    pub endpoints: Vec<EndpointConfig>,
    pub transport: TransportConfig,
    /// Global filter over namespaced tool names.
    pub include_tools: Option<Vec<String>>,
    pub exclude_tools: Option<Vec<String>>,
    pub ready_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub workflow: EngineConfig,
    pub state_db: Option<PathBuf>,
    pub log: LogConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            endpoints: Vec::new(),
            transport: TransportConfig::default(),
            include_tools: None,
            exclude_tools: None,
            ready_timeout: Duration::from_millis(default_ready_timeout_ms()),
            backoff: BackoffPolicy::default(),
            workflow: EngineConfig::default(),
            state_db: None,
            log: LogConfig::default(),
        }
    }
}

// ─── Raw File Layout ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
struct ToolRules {
    #[serde(default)]
    allowed: Option<Vec<String>>,
    #[serde(default)]
    excluded: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    /// Absent only in the keyed form, where the map key names the server.
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    command: Option<CommandLine>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    include_tools: Option<Vec<String>>,
    #[serde(default)]
    exclude_tools: Option<Vec<String>>,
    #[serde(default)]
    tools: Option<ToolRules>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    auth_token_env: Option<String>,
    #[serde(default)]
    call_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBackoff {
    #[serde(default)]
    base_ms: Option<u64>,
    #[serde(default)]
    max_delay_ms: Option<u64>,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    jitter: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    breaker_threshold: Option<u32>,
    #[serde(default)]
    breaker_cooldown_ms: Option<u64>,
    #[serde(default)]
    deadline_ms: Option<u64>,
    #[serde(default)]
    fail_fast_on_open_circuit: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default)]
    upstream: Vec<RawServer>,
    /// Ordered by name.
    #[serde(default, rename = "mcpServers")]
    mcp_servers: BTreeMap<String, RawServer>,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(default)]
    include_tools: Option<Vec<String>>,
    #[serde(default)]
    exclude_tools: Option<Vec<String>>,
    #[serde(default = "default_ready_timeout_ms")]
    ready_timeout_ms: u64,
    #[serde(default)]
    backoff: RawBackoff,
    #[serde(default)]
    workflow: RawWorkflow,
    #[serde(default)]
    state_db: Option<String>,
    #[serde(default)]
    log: LogConfig,
}

fn default_name() -> String {
    "switchyard".into()
}
fn default_ready_timeout_ms() -> u64 {
    30_000
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl HubConfig {
    /// Load a config file and apply `SWITCHYARD_*` overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
            Some("yaml") | Some("yml")
        );
        let mut config = if yaml {
            Self::from_yaml(&text)?
        } else {
            Self::from_json(&text)?
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        tracing::debug!(path = %path.display(), endpoints = config.endpoints.len(), "config loaded");
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        raw.resolve()
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        raw.resolve()
    }

    /// Apply `SWITCHYARD_NAME`, `SWITCHYARD_INCLUDE_TOOLS`,
    /// `SWITCHYARD_EXCLUDE_TOOLS`, `SWITCHYARD_LOG` and `SWITCHYARD_STATE_DB`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = set("SWITCHYARD_NAME") {
            self.name = name;
        }
        if let Some(include) = set("SWITCHYARD_INCLUDE_TOOLS") {
            self.include_tools = Some(split_list(&include));
        }
        if let Some(exclude) = set("SWITCHYARD_EXCLUDE_TOOLS") {
            self.exclude_tools = Some(split_list(&exclude));
        }
        if let Some(level) = set("SWITCHYARD_LOG") {
            self.log.level = Some(level);
        }
        if let Some(db) = set("SWITCHYARD_STATE_DB") {
            self.state_db = Some(PathBuf::from(expand_tilde(&db)));
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            name: self.name.clone(),
            ready_timeout: self.ready_timeout,
            ..RouterConfig::default()
        }
    }

    /// Global filter over namespaced tool names.
    pub fn tool_filter(&self) -> NameFilter {
        NameFilter::new(self.include_tools.as_deref(), self.exclude_tools.as_deref())
    }

    /// State database path, defaulting into the data directory.
    pub fn state_db_path(&self) -> PathBuf {
        self.state_db
            .clone()
            .unwrap_or_else(|| crate::data_dir().join("state.db"))
    }
}

impl RawConfig {
    fn resolve(self) -> Result<HubConfig, ConfigError> {
        let mut endpoints = Vec::new();
        let listed = self.servers.into_iter().chain(self.upstream);
        for raw in listed {
            let name = raw
                .name
                .clone()
                .ok_or_else(|| ConfigError::invalid("server entry without a name"))?;
            if let Some(endpoint) = endpoint_from_raw(name, raw)? {
                endpoints.push(endpoint);
            }
        }
        for (name, raw) in self.mcp_servers {
            if let Some(endpoint) = endpoint_from_raw(name, raw)? {
                endpoints.push(endpoint);
            }
        }

        let mut seen = HashSet::new();
        for endpoint in &endpoints {
            if !seen.insert(endpoint.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate server name '{}'",
                    endpoint.name
                )));
            }
        }

        let defaults = BackoffPolicy::default();
        let backoff = BackoffPolicy {
            base: self.backoff.base_ms.map(Duration::from_millis).unwrap_or(defaults.base),
            max_delay: self
                .backoff
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            max_attempts: self.backoff.max_attempts.unwrap_or(defaults.max_attempts),
            jitter: self.backoff.jitter.unwrap_or(defaults.jitter),
        };
        if !(0.0..1.0).contains(&backoff.jitter) {
            return Err(ConfigError::invalid("backoff.jitter must be in [0, 1)"));
        }

        let engine_defaults = EngineConfig::default();
        let breaker_defaults = BreakerConfig::default();
        let workflow = EngineConfig {
            concurrency: self.workflow.concurrency.unwrap_or(engine_defaults.concurrency),
            breaker: BreakerConfig {
                threshold: self
                    .workflow
                    .breaker_threshold
                    .unwrap_or(breaker_defaults.threshold),
                cooldown: self
                    .workflow
                    .breaker_cooldown_ms
                    .map(Duration::from_millis)
                    .unwrap_or(breaker_defaults.cooldown),
            },
            deadline: self.workflow.deadline_ms.map(Duration::from_millis),
            fail_fast_on_open_circuit: self.workflow.fail_fast_on_open_circuit,
        };
        if workflow.concurrency == 0 {
            return Err(ConfigError::invalid("workflow.concurrency must be at least 1"));
        }
        if workflow.breaker.threshold == 0 {
            return Err(ConfigError::invalid("workflow.breaker_threshold must be at least 1"));
        }

        Ok(HubConfig {
            name: self.name,
            endpoints,
            transport: self.transport,
            include_tools: self.include_tools,
            exclude_tools: self.exclude_tools,
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            backoff,
            workflow,
            state_db: self.state_db.map(|p| PathBuf::from(expand_tilde(&p))),
            log: self.log,
        })
    }
}

/// Build one endpoint. Disabled entries yield `None`.
fn endpoint_from_raw(name: String, raw: RawServer) -> Result<Option<EndpointConfig>, ConfigError> {
    if raw.disabled {
        tracing::debug!(endpoint = %name, "skipping disabled server");
        return Ok(None);
    }
    if name.trim().is_empty() {
        return Err(ConfigError::invalid("server entry with an empty name"));
    }

    let transport = match (raw.command, raw.url) {
        (_, Some(url)) => EndpointTransport::Http {
            url: interpolate_env_vars(&url),
            headers: raw
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), interpolate_env_vars(v)))
                .collect(),
        },
        (Some(command), None) => {
            let mut argv = match command {
                CommandLine::Line(line) => line.split_whitespace().map(str::to_string).collect(),
                CommandLine::Argv(argv) => argv,
            };
            argv.extend(raw.args);
            if argv.is_empty() {
                return Err(ConfigError::invalid(format!("server '{name}' has an empty command")));
            }
            let command = argv.remove(0);
            EndpointTransport::Process {
                command: expand_tilde(&command),
                args: argv,
                env: raw
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), interpolate_env_vars(v)))
                    .collect(),
                cwd: raw.cwd.map(|c| PathBuf::from(expand_tilde(&c))),
            }
        }
        (None, None) => {
            return Err(ConfigError::invalid(format!(
                "server '{name}' needs either a command or a url"
            )))
        }
    };

    let rules = raw.tools.unwrap_or_default();
    Ok(Some(EndpointConfig {
        name,
        transport,
        include: raw.include_tools.or(rules.allowed),
        exclude: raw.exclude_tools.or(rules.excluded),
        call_timeout: raw
            .call_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CALL_TIMEOUT),
        auth_token_env: raw.auth_token_env,
    }))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. An empty variable takes the default.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var, default)) => std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_array_form() {
        let config = HubConfig::from_json(
            r#"{
                "name": "hub",
                "servers": [
                    {"name": "gh", "command": "npx -y @mcp/github", "args": ["--ro"],
                     "env": {"TOKEN": "${__SWITCHYARD_TEST_UNSET__:-none}"},
                     "include_tools": ["search"]},
                    {"name": "remote", "url": "https://mcp.example.com/mcp",
                     "auth_token_env": "REMOTE_TOKEN", "call_timeout_ms": 5000},
                    {"name": "off", "command": ["x"], "disabled": true}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.name, "hub");
        assert_eq!(config.endpoints.len(), 2);
        let gh = &config.endpoints[0];
        match &gh.transport {
            EndpointTransport::Process { command, args, env, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &["-y", "@mcp/github", "--ro"]);
                assert_eq!(env["TOKEN"], "none");
            }
            other => panic!("expected process transport, got {other:?}"),
        }
        assert_eq!(gh.include.as_deref(), Some(&["search".to_string()][..]));

        let remote = &config.endpoints[1];
        assert!(matches!(remote.transport, EndpointTransport::Http { .. }));
        assert_eq!(remote.call_timeout, Duration::from_secs(5));
        assert_eq!(remote.auth_token_env.as_deref(), Some("REMOTE_TOKEN"));
    }

    #[test]
    fn test_keyed_form_sorted_by_name() {
        let config = HubConfig::from_yaml(
            r#"
mcpServers:
  zeta:
    command: zeta-server
  alpha:
    command: [python, -m, alpha]
    tools:
      allowed: [read]
      excluded: [write]
  skipped:
    command: nope
    disabled: true
transport:
  mode: http-sse
  port: 9000
workflow:
  concurrency: 2
  breaker_threshold: 3
"#,
        )
        .unwrap();

        let names: Vec<_> = config.endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(config.endpoints[0].exclude.as_deref(), Some(&["write".to_string()][..]));
        assert_eq!(config.transport.mode, TransportMode::HttpSse);
        assert_eq!(config.transport.port, 9000);
        assert_eq!(config.transport.sse_path, "/events");
        assert_eq!(config.workflow.concurrency, 2);
        assert_eq!(config.workflow.breaker.threshold, 3);
        assert_eq!(config.workflow.breaker.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_entries() {
        let neither = HubConfig::from_json(r#"{"servers": [{"name": "x"}]}"#).unwrap_err();
        assert_eq!(neither.kind(), ErrorKind::Config);
        assert!(neither.to_string().contains("command or a url"));

        let dup = HubConfig::from_json(
            r#"{"servers": [{"name": "x", "command": "a"}], "mcpServers": {"x": {"command": "b"}}}"#,
        )
        .unwrap_err();
        assert!(dup.to_string().contains("duplicate"));

        assert!(matches!(
            HubConfig::from_json("{not json").unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HubConfig::from_json(r#"{"include_tools": ["a_b"]}"#).unwrap();
        let env: HashMap<&str, &str> = [
            ("SWITCHYARD_NAME", "edge"),
            ("SWITCHYARD_EXCLUDE_TOOLS", "gh_delete, gh_push"),
            ("SWITCHYARD_LOG", "switchyard=debug"),
            ("SWITCHYARD_INCLUDE_TOOLS", ""),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.name, "edge");
        assert_eq!(config.include_tools, Some(vec!["a_b".to_string()]));
        assert_eq!(
            config.exclude_tools,
            Some(vec!["gh_delete".to_string(), "gh_push".to_string()])
        );
        assert_eq!(config.log.level.as_deref(), Some("switchyard=debug"));
        assert_eq!(config.router_config().name, "edge");
    }

    #[test]
    fn test_load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.yml");
        std::fs::write(&path, "servers:\n  - name: a\n    command: run-a\n").unwrap();
        let config = HubConfig::load(&path).unwrap();
        assert_eq!(config.endpoints[0].name, "a");

        let missing = HubConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_interpolate_env_vars() {
        std::env::set_var("__SWITCHYARD_TEST_HOST__", "mcp.internal");
        assert_eq!(
            interpolate_env_vars("https://${__SWITCHYARD_TEST_HOST__}/mcp"),
            "https://mcp.internal/mcp"
        );
        std::env::remove_var("__SWITCHYARD_TEST_HOST__");
        assert_eq!(interpolate_env_vars("${__SWITCHYARD_TEST_HOST__}"), "");
        assert_eq!(interpolate_env_vars("plain"), "plain");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/state.db");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/state.db"));
    }
}
