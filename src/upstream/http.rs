//! HTTP transport with streamed server events.
//!
//! Requests are POSTed to the endpoint URL. The reply is either one JSON
//! body or a `text/event-stream` whose `data:` payloads are JSON-RPC
//! messages. Once the session is initialized, a long-lived GET opens the
//! server's event stream for unsolicited notifications. Every inbound
//! message lands on the same channel the session dispatcher reads, so
//! correlation works exactly as for process endpoints.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::errors::UpstreamError;
use super::transport::{Inbound, OpenedTransport, Transport};
use super::types::{error_codes, error_response, EndpointConfig, JsonRpcError, TransportKind};
use crate::credentials::CredentialProvider;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Header carrying the server-assigned session id.
const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Timeout for the best-effort session DELETE on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Transport ───────────────────────────────────────────────────────────────

struct HttpInner {
    config: EndpointConfig,
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    session_id: StdMutex<Option<String>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    closed: CancellationToken,
    event_stream_started: AtomicBool,
}

/// JSON-RPC over HTTP POST plus a server event stream.
pub struct HttpTransport {
    inner: Arc<HttpInner>,
}

impl HttpTransport {
    /// Create the transport. No I/O happens until the first send.
    pub fn open(
        config: EndpointConfig,
        url: String,
        headers: BTreeMap<String, String>,
        client: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
    ) -> OpenedTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = HttpInner {
            config,
            url,
            headers,
            client,
            credentials,
            session_id: StdMutex::new(None),
            inbound: tx,
            closed: CancellationToken::new(),
            event_stream_started: AtomicBool::new(false),
        };
        OpenedTransport {
            transport: Arc::new(HttpTransport {
                inner: Arc::new(inner),
            }),
            inbound: rx,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, message: &Value) -> Result<(), UpstreamError> {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return Err(UpstreamError::unavailable(&inner.config.name, "transport closed"));
        }

        let request = inner
            .authorized(inner.client.post(&inner.url))
            .await?
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .json(message);

        let opens_stream = message.get("method").and_then(Value::as_str)
            == Some("notifications/initialized");
        let inner = self.inner.clone();
        let message = message.clone();
        tokio::spawn(async move {
            inner.exchange(request, &message).await;
            if opens_stream {
                inner.clone().start_event_stream();
            }
        });
        Ok(())
    }

    async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return;
        }
        inner.closed.cancel();

        let session_id = inner.current_session_id();
        if session_id.is_some() {
            if let Ok(request) = inner.authorized(inner.client.delete(&inner.url)).await {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, request.send()).await;
            }
        }
        let _ = inner.inbound.send(Inbound::Closed(Some("transport closed".into())));
    }
}

impl HttpInner {
    fn current_session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push(&self, item: Inbound) {
        let _ = self.inbound.send(item);
    }

    /// Attach configured headers, the session id, and a fresh bearer token.
    async fn authorized(
        &self,
        mut request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, UpstreamError> {
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(id) = self.current_session_id() {
            request = request.header(SESSION_HEADER, id);
        }
        if let Some(token) = self.credentials.token(&self.config).await? {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(request)
    }

    fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_deref() != Some(id) {
                tracing::debug!(endpoint = %self.config.name, session = id, "http session established");
                *slot = Some(id.to_string());
            }
        }
    }

    /// Perform one POST and push whatever it yields onto the inbound channel.
    async fn exchange(&self, request: reqwest::RequestBuilder, message: &Value) {
        let request_id = message.get("id").cloned();

        let response = tokio::select! {
            r = request.send() => r,
            _ = self.closed.cancelled() => return,
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(endpoint = %self.config.name, error = %e, "http request failed");
                self.push(Inbound::Closed(Some(format!("http request failed: {e}"))));
                return;
            }
        };

        self.capture_session_id(&response);
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                endpoint = %self.config.name,
                status = %status,
                body = %body.chars().take(500).collect::<String>(),
                "http endpoint returned an error status"
            );
            if let Some(id) = request_id {
                let mut error = JsonRpcError::new(error_codes::HTTP_ERROR, format!("HTTP {status}"));
                if !body.is_empty() {
                    error.data = Some(Value::String(body));
                }
                self.push(Inbound::Message(error_response(id, error)));
            }
            return;
        }

        if status == StatusCode::ACCEPTED {
            return;
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_event_stream {
            self.consume_events(response).await;
            return;
        }

        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                self.push(Inbound::Closed(Some(format!("http body read failed: {e}"))));
                return;
            }
        };
        if body.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Array(batch)) => {
                for item in batch {
                    self.push(Inbound::Message(item));
                }
            }
            Ok(value) => self.push(Inbound::Message(value)),
            Err(e) => self.push(Inbound::Malformed(format!("invalid JSON body: {e}"))),
        }
    }

    /// Drain an event-stream response, one JSON-RPC message per event.
    ///
    /// Returns false if the stream broke the rules (and the session was told).
    async fn consume_events(&self, response: reqwest::Response) -> bool {
        let mut events = Box::pin(parse_sse_events(Box::pin(response.bytes_stream())));
        loop {
            let next = tokio::select! {
                e = events.next() => e,
                _ = self.closed.cancelled() => return true,
            };
            match next {
                Some(Ok(event)) => match serde_json::from_str::<Value>(&event.data) {
                    Ok(value) => self.push(Inbound::Message(value)),
                    Err(e) => {
                        self.push(Inbound::Malformed(format!("invalid JSON in event: {e}")));
                        return false;
                    }
                },
                Some(Err(reason)) => {
                    tracing::warn!(endpoint = %self.config.name, reason = %reason, "event stream broke");
                    return false;
                }
                None => return true,
            }
        }
    }

    /// Open the long-lived GET event stream, once per transport.
    fn start_event_stream(self: Arc<Self>) {
        if self.event_stream_started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(async move {
            let request = match self.authorized(self.client.get(&self.url)).await {
                Ok(r) => r.header(ACCEPT, "text/event-stream"),
                Err(e) => {
                    tracing::warn!(endpoint = %self.config.name, error = %e, "cannot open event stream");
                    return;
                }
            };
            let response = tokio::select! {
                r = request.send() => r,
                _ = self.closed.cancelled() => return,
            };
            match response {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(endpoint = %self.config.name, "server event stream open");
                    if self.consume_events(resp).await {
                        tracing::debug!(endpoint = %self.config.name, "server event stream ended");
                    }
                }
                Ok(resp) => {
                    // 405 means the server offers no standalone stream.
                    tracing::debug!(
                        endpoint = %self.config.name,
                        status = %resp.status(),
                        "server event stream not offered"
                    );
                }
                Err(e) => {
                    tracing::warn!(endpoint = %self.config.name, error = %e, "event stream request failed");
                }
            }
        });
    }
}

// ─── SSE Parsing ─────────────────────────────────────────────────────────────

/// One server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Split a byte stream into server-sent events.
///
/// Events end at a blank line (`\n\n` or `\r\n\r\n`). Comment-only and
/// data-less events (keep-alives) are skipped. Bytes are buffered raw so a
/// multi-byte character split across chunks survives.
pub fn parse_sse_events<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, String>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, mut done)| async move {
            loop {
                if let Some((end, sep)) = find_event_boundary(&buffer) {
                    let raw = String::from_utf8_lossy(&buffer[..end]).into_owned();
                    buffer.drain(..end + sep);
                    match parse_event(&raw) {
                        Some(event) => return Some((Ok(event), (byte_stream, buffer, done))),
                        None => continue, // keep-alive or comment
                    }
                }

                if done {
                    // Stream ended; flush a final event with no trailing blank line.
                    if buffer.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let raw = String::from_utf8_lossy(&buffer).into_owned();
                    buffer.clear();
                    return parse_event(&raw).map(|event| (Ok(event), (byte_stream, buffer, done)));
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        done = true;
                        buffer.clear();
                        return Some((
                            Err(format!("stream read error: {e}")),
                            (byte_stream, buffer, done),
                        ));
                    }
                    None => done = true,
                }
            }
        },
    )
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse one raw event block. Returns `None` for events without data.
fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event = None;
    let mut id = None;

    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => event = Some(value.to_string()),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        id,
        data: data_lines.join("\n"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
