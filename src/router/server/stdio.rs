//! Stdio front end: framed JSON-RPC on our own stdin/stdout.
//!
//! Stdout belongs to a single writer task; responses and relayed
//! notifications are queued to it. Each request runs in its own task, and
//! a client `notifications/cancelled` aborts the matching request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::router::Router;
use crate::upstream::framing::{write_frame, FrameError, FrameReader};

type InFlight = Arc<StdMutex<HashMap<String, CancellationToken>>>;

/// Serve the hub on the process's stdin/stdout until stdin closes.
pub async fn serve_stdio(router: Router) -> Result<(), FrameError> {
    tracing::info!("serving on stdio");
    serve_io(router, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve the hub over any reader/writer pair.
pub async fn serve_io<R, W>(router: Router, reader: R, writer: W) -> Result<(), FrameError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                tracing::error!(error = %e, "failed to write to client");
                break;
            }
        }
    });

    let forward_task = {
        let tx = tx.clone();
        let mut notes = router.notifications();
        tokio::spawn(async move {
            loop {
                match notes.recv().await {
                    Ok(n) => {
                        if tx.send(n.to_message()).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "client notification relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let in_flight: InFlight = Arc::new(StdMutex::new(HashMap::new()));
    let mut frames = FrameReader::new(reader);

    let result = loop {
        let message = match frames.next_frame().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::info!("client closed stdin");
                break Ok(());
            }
            Err(e) => {
                tracing::error!(error = %e, "client channel broke");
                break Err(e);
            }
        };

        if message.get("method").and_then(Value::as_str) == Some("notifications/cancelled") {
            if let Some(id) = message.pointer("/params/requestId") {
                let token = in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&id.to_string())
                    .cloned();
                if let Some(token) = token {
                    tracing::debug!(request_id = %id, "client cancelled request");
                    token.cancel();
                }
            }
            continue;
        }

        let key = message
            .get("id")
            .filter(|_| message.get("method").is_some())
            .map(Value::to_string);
        let token = CancellationToken::new();
        if let Some(key) = &key {
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.clone(), token.clone());
        }

        let router = router.clone();
        let tx = tx.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let reply = router.handle_message_cancellable(message, Some(&token)).await;
            if let Some(key) = key {
                in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
            }
            if let Some(reply) = reply {
                let _ = tx.send(reply);
            }
        });
    };

    forward_task.abort();
    let _ = forward_task.await;
    drop(tx);
    // Drains replies from requests still in flight.
    let _ = writer_task.await;
    result
}
