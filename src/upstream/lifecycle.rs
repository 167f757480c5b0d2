//! Endpoint process lifecycle.
//!
//! Spawning child processes with stdio wired for framed JSON-RPC, draining
//! their stderr away from the RPC channel, the MCP initialize exchange, and
//! the reconnect backoff policy.

use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};

use super::errors::UpstreamError;
use super::session::Session;
use super::transport::{FramedTransport, OpenedTransport, StderrTail};
use super::types::{
    EndpointConfig, EndpointTransport, InitializeResult, UpstreamInfo, LATEST_PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize exchange.
///
/// Generous because some servers load large models or dependency trees at
/// startup before they answer anything.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Bounded exponential backoff with jitter for reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Attempts before the endpoint is closed permanently.
    pub max_attempts: u32,
    /// Relative jitter in `[0, 1)`; 0.1 spreads each delay by ±10%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before attempt `attempt` (1-based): base, 2·base, 4·base, … capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }

    /// Delay before attempt `attempt`, randomized by the configured jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = self.jitter.min(0.99);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(factor).min(self.max_delay)
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn an endpoint process with stdin/stdout reserved for frames.
///
/// Stderr is piped and drained into the log; it never touches the RPC
/// channel.
pub fn spawn_process(config: &EndpointConfig) -> Result<OpenedTransport, UpstreamError> {
    let EndpointTransport::Process {
        command,
        args,
        env,
        cwd,
    } = &config.transport
    else {
        return Err(UpstreamError::ConfigError {
            reason: format!("endpoint '{}' is not a process endpoint", config.name),
        });
    };

    let name = config.name.as_str();
    let mut cmd = Command::new(command);
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| UpstreamError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{command}: {e}"),
    })?;

    let stdin = child.stdin.take().ok_or(UpstreamError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(UpstreamError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        drain_stderr(name.to_string(), stderr, tail.clone());
    }

    tracing::info!(
        endpoint = name,
        command = %command,
        pid = child.id().unwrap_or_default(),
        "spawned endpoint process"
    );

    Ok(FramedTransport::with_child(
        name,
        stdout,
        Box::new(stdin),
        child,
        tail,
    ))
}

/// Forward a child's stderr into the log, line by line, keeping a short tail
/// for failure reports.
fn drain_stderr(endpoint: String, stderr: ChildStderr, tail: StderrTail) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(endpoint = %endpoint, line = %line, "endpoint stderr");
            tail.push(line);
        }
    });
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub(crate) fn format_stderr_suffix(stderr: Option<&str>) -> String {
    match stderr {
        Some(s) if !s.trim().is_empty() => {
            let trimmed = s.trim();
            let cut = trimmed
                .char_indices()
                .nth(2000)
                .map(|(i, _)| i)
                .unwrap_or(trimmed.len());
            let ellipsis = if cut < trimmed.len() { "...(truncated)" } else { "" };
            format!(" | stderr: {}{ellipsis}", &trimmed[..cut])
        }
        _ => String::new(),
    }
}

// ─── Initialize ──────────────────────────────────────────────────────────────

/// Perform the MCP initialize exchange on a fresh session.
pub async fn initialize(session: &Session, client_name: &str) -> Result<UpstreamInfo, UpstreamError> {
    let params = json!({
        "protocolVersion": LATEST_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": env!("CARGO_PKG_VERSION"),
        }
    });

    let result = session
        .request("initialize", Some(params), INIT_TIMEOUT, None)
        .await
        .map_err(|e| UpstreamError::InitFailed {
            name: session.endpoint().to_string(),
            reason: e.to_string(),
        })?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| UpstreamError::InitFailed {
            name: session.endpoint().to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    session.notify("notifications/initialized", None).await?;

    Ok(init.into())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 6,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.jittered_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            jitter: 0.2,
            ..BackoffPolicy::default()
        };
        for _ in 0..100 {
            let d = policy.jittered_delay(2);
            assert!(d >= Duration::from_millis(1600), "{d:?}");
            assert!(d <= Duration::from_millis(2400), "{d:?}");
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(200), policy.max_delay);
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(None), "");
        assert_eq!(format_stderr_suffix(Some("  ")), "");
        assert_eq!(
            format_stderr_suffix(Some("ImportError: no module\n")),
            " | stderr: ImportError: no module"
        );
        let long = "x".repeat(2500);
        assert!(format_stderr_suffix(Some(&long)).ends_with("...(truncated)"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = EndpointConfig::process("ghost", "/nonexistent/switchyard-endpoint", &[]);
        let err = spawn_process(&config).err().unwrap();
        assert!(matches!(err, UpstreamError::SpawnFailed { ref name, .. } if name == "ghost"));
    }

    #[tokio::test]
    async fn test_spawn_rejects_http_endpoint() {
        let config = EndpointConfig::http("remote", "http://127.0.0.1:1/mcp");
        let err = spawn_process(&config).err().unwrap();
        assert!(matches!(err, UpstreamError::ConfigError { .. }));
    }
}
