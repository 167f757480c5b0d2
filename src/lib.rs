pub mod catalog;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod router;
pub mod store;
pub mod upstream;
pub mod workflow;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use catalog::Aggregator;
use config::{HubConfig, LogConfig};
use router::Router;
use upstream::{ConnectionManager, Connector, UpstreamError};

/// Default `EnvFilter` directive when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_FILTER: &str = "switchyard=info";

/// Log files above this size are rotated at startup.
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Return the platform-standard data directory for switchyard.
///
/// - macOS: `~/Library/Application Support/switchyard/`
/// - Linux: `$XDG_DATA_HOME/switchyard/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.switchyard/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("switchyard");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchyard")
}

/// Wire a connection manager, aggregator and router for `config`.
///
/// Endpoints are registered but not connected; the first client handshake
/// connects them.
pub fn build_router(config: &HubConfig, connector: Arc<dyn Connector>) -> Result<Router, UpstreamError> {
    let manager = ConnectionManager::new(&config.name, connector, config.backoff.clone());
    for endpoint in &config.endpoints {
        manager.register(endpoint.clone())?;
    }
    let aggregator = Arc::new(Aggregator::new(
        Arc::new(manager.clone()),
        config.tool_filter(),
    ));
    Ok(Router::new(manager, aggregator, config.router_config()))
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr, or to `config.file` with a line-flushing writer;
/// stdout is never used because it carries frames in stdio mode. A log
/// file over 10 MB is rotated (`switchyard.log` → `.1` → `.2` → `.3`)
/// before it is reopened.
pub fn init_tracing(config: &LogConfig) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.level.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });

    let installed = match &config.file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let oversized = std::fs::metadata(path)
                .map(|m| m.len() > MAX_LOG_BYTES)
                .unwrap_or(false);
            if oversized {
                rotate_log_file(path, 3);
            }
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            let builder = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(FlushingWriter::new(log_file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false);
            if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None => {
            let builder = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true);
            if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };
    installed.map_err(|e| std::io::Error::other(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir().display(),
        log_file = ?config.file,
        pid = std::process::id(),
        "switchyard starting"
    );
    Ok(())
}

/// Rotate log files: `x.log` → `x.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines reach disk even if the process dies.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
