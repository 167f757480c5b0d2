//! Transport abstraction.
//!
//! A transport moves JSON-RPC messages to and from one endpoint. Outbound
//! messages go through [`Transport::send`]; inbound messages arrive on the
//! channel handed out in [`OpenedTransport`], which is read by exactly one
//! session dispatcher. Callers never see which transport is underneath.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};

use super::errors::UpstreamError;
use super::framing::{write_frame, FrameError, FrameReader};
use super::http::HttpTransport;
use super::lifecycle;
use super::types::{EndpointConfig, EndpointTransport, TransportKind};
use crate::credentials::CredentialProvider;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for a child process to exit after stdin closes, before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Something read from an endpoint's inbound channel.
#[derive(Debug)]
pub enum Inbound {
    /// One well-framed JSON message.
    Message(Value),
    /// The channel carried bytes that violate the framing rules.
    Malformed(String),
    /// The channel ended (process exit, stream end, connection error).
    Closed(Option<String>),
}

/// Outbound half of a connection to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send one JSON-RPC message.
    async fn send(&self, message: &Value) -> Result<(), UpstreamError>;

    /// Tear the connection down. Must be idempotent.
    async fn close(&self);

    /// Recent diagnostic output, if the transport captures any.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// A freshly opened transport plus its inbound message channel.
pub struct OpenedTransport {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens transports for endpoint configurations.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &EndpointConfig) -> Result<OpenedTransport, UpstreamError>;
}

// ─── Default Connector ───────────────────────────────────────────────────────

/// Opens child processes and HTTP sessions according to the endpoint config.
pub struct DefaultConnector {
    credentials: Arc<dyn CredentialProvider>,
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            credentials,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, config: &EndpointConfig) -> Result<OpenedTransport, UpstreamError> {
        match &config.transport {
            EndpointTransport::Process { .. } => lifecycle::spawn_process(config),
            EndpointTransport::Http { url, headers } => Ok(HttpTransport::open(
                config.clone(),
                url.clone(),
                headers.clone(),
                self.http.clone(),
                self.credentials.clone(),
            )),
        }
    }
}

// ─── Framed Transport ────────────────────────────────────────────────────────

/// Bounded buffer of the most recent stderr lines from a child process.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<StdMutex<VecDeque<String>>>,
}

impl StderrTail {
    const CAPACITY: usize = 20;

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == Self::CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Option<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.is_empty() {
            None
        } else {
            Some(lines.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

/// Length-framed JSON-RPC over a byte stream pair (child stdio, or any
/// in-memory duplex).
pub struct FramedTransport {
    endpoint: String,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    child: Mutex<Option<Child>>,
    stderr: Option<StderrTail>,
    closed: AtomicBool,
}

impl FramedTransport {
    /// Wrap a reader/writer pair and start the frame reader task.
    pub fn from_io<R, W>(endpoint: &str, reader: R, writer: W) -> OpenedTransport
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(endpoint, reader, Box::new(writer), None, None)
    }

    pub(crate) fn with_child<R>(
        endpoint: &str,
        reader: R,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        child: Child,
        stderr: StderrTail,
    ) -> OpenedTransport
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::build(endpoint, reader, writer, Some(child), Some(stderr))
    }

    fn build<R>(
        endpoint: &str,
        reader: R,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        child: Option<Child>,
        stderr: Option<StderrTail>,
    ) -> OpenedTransport
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_frame_reader(endpoint.to_string(), reader, tx);

        let transport = FramedTransport {
            endpoint: endpoint.to_string(),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            stderr,
            closed: AtomicBool::new(false),
        };

        OpenedTransport {
            transport: Arc::new(transport),
            inbound: rx,
        }
    }
}

#[async_trait]
impl Transport for FramedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn send(&self, message: &Value) -> Result<(), UpstreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UpstreamError::unavailable(&self.endpoint, "transport closed"));
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, message)
            .await
            .map_err(|e| match e {
                FrameError::Malformed { reason } => UpstreamError::MalformedFrame {
                    endpoint: self.endpoint.clone(),
                    reason,
                },
                FrameError::Io { reason } => UpstreamError::unavailable(
                    &self.endpoint,
                    format!("failed to write frame: {reason}"),
                ),
            })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Closing stdin is the polite shutdown signal for stdio servers.
        let _ = self.writer.lock().await.shutdown().await;

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(endpoint = %self.endpoint, %status, "endpoint process exited");
            }
            _ => {
                tracing::warn!(endpoint = %self.endpoint, "endpoint did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }

    fn diagnostics(&self) -> Option<String> {
        self.stderr.as_ref().and_then(StderrTail::snapshot)
    }
}

/// Read frames until the stream ends or breaks, forwarding each to `tx`.
fn spawn_frame_reader<R>(endpoint: String, reader: R, tx: mpsc::UnboundedSender<Inbound>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut frames = FrameReader::new(reader);
        loop {
            match frames.next_frame().await {
                Ok(Some(message)) => {
                    if tx.send(Inbound::Message(message)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(endpoint = %endpoint, "endpoint channel reached end of stream");
                    let _ = tx.send(Inbound::Closed(None));
                    break;
                }
                Err(FrameError::Malformed { reason }) => {
                    tracing::warn!(endpoint = %endpoint, reason = %reason, "malformed frame");
                    let _ = tx.send(Inbound::Malformed(reason));
                    break;
                }
                Err(FrameError::Io { reason }) => {
                    let _ = tx.send(Inbound::Closed(Some(reason)));
                    break;
                }
            }
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::framing::encode_frame;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_framed_transport_delivers_inbound_then_closed() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let mut opened = FramedTransport::from_io("mock", our_read, our_write);

        let (their_read, mut their_write) = tokio::io::split(theirs);
        their_write
            .write_all(&encode_frame(&json!({"jsonrpc": "2.0", "method": "hello"})).unwrap())
            .await
            .unwrap();
        drop(their_write);
        drop(their_read);

        match opened.inbound.recv().await {
            Some(Inbound::Message(v)) => assert_eq!(v["method"], "hello"),
            other => panic!("expected message, got {other:?}"),
        }
        assert!(matches!(opened.inbound.recv().await, Some(Inbound::Closed(None))));
    }

    #[tokio::test]
    async fn test_garbage_on_channel_reports_malformed() {
        let (ours, mut theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let mut opened = FramedTransport::from_io("mock", our_read, our_write);

        theirs.write_all(b"loading plugins...\n").await.unwrap();

        assert!(matches!(opened.inbound.recv().await, Some(Inbound::Malformed(_))));
    }

    #[tokio::test]
    async fn test_send_after_close_is_unavailable() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let opened = FramedTransport::from_io("mock", our_read, our_write);

        opened.transport.close().await;
        let err = opened.transport.send(&json!({})).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unavailable { .. }));
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::default();
        assert!(tail.snapshot().is_none());
        for i in 0..25 {
            tail.push(format!("line {i}"));
        }
        let snap = tail.snapshot().unwrap();
        assert!(!snap.contains("line 4\n"));
        assert!(snap.starts_with("line 5"));
        assert!(snap.ends_with("line 24"));
    }
}
