//! HTTP front end.
//!
//! `POST /rpc` takes one JSON-RPC message and answers with the JSON-RPC
//! response (202 for notifications). The event path streams relayed
//! notifications as server-sent events.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::router::Router;
use crate::upstream::types::{error_codes, error_response, JsonRpcError};

#[derive(Clone)]
struct AppState {
    router: Router,
}

/// Build the axum application.
pub fn build_app(router: Router, sse_path: &str) -> axum::Router {
    axum::Router::new()
        .route("/rpc", post(rpc))
        .route(sse_path, get(events))
        .with_state(AppState { router })
}

/// Bind and serve until `shutdown` fires.
pub async fn serve_http(
    router: Router,
    host: &str,
    port: u16,
    sse_path: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(addr = %listener.local_addr()?, sse_path, "serving over http");
    axum::serve(listener, build_app(router, sse_path))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn rpc(State(state): State<AppState>, body: Bytes) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable request body");
            let error = JsonRpcError::new(error_codes::PARSE_ERROR, format!("Parse error: {e}"));
            return (StatusCode::BAD_REQUEST, Json(error_response(Value::Null, error))).into_response();
        }
    };
    match state.router.handle_message(message).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.router.notifications();

    let stream = stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(notification) => {
                let json = serde_json::to_string(&notification.to_message()).unwrap_or_default();
                Some((Ok(Event::default().event("message").data(json)), rx))
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                Some((Ok(Event::default().comment("lagged")), rx))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::hub::tests::mock_router;
    use crate::upstream::http::parse_sse_events;
    use crate::upstream::testing::MockServer;
    use futures::StreamExt;
    use serde_json::json;

    async fn spawn_app(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_app(router, "/events");
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_rpc_endpoint() {
        let (router, _c) = mock_router(vec![("gh", MockServer::new().with_tool("search", "Search"))]);
        let base = spawn_app(router).await;
        let client = reqwest::Client::new();

        let init: Value = client
            .post(format!("{base}/rpc"))
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(init["result"]["serverInfo"]["name"], "switchyard");

        let note = client
            .post(format!("{base}/rpc"))
            .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .send()
            .await
            .unwrap();
        assert_eq!(note.status(), StatusCode::ACCEPTED);

        let tools: Value = client
            .post(format!("{base}/rpc"))
            .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(tools["result"]["tools"][0]["name"], "gh_search");
    }

    #[tokio::test]
    async fn test_malformed_body_gets_parse_error_envelope() {
        let (router, _c) = mock_router(vec![("gh", MockServer::new())]);
        let base = spawn_app(router).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/rpc"))
            .header("content-type", "application/json")
            .body("{\"jsonrpc\": \"2.0\", \"id\": 1,")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let reply: Value = response.json().await.unwrap();
        assert_eq!(reply["jsonrpc"], "2.0");
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_event_stream_relays_notifications() {
        let (router, connector) = mock_router(vec![("ci", MockServer::new().with_tool("build", "b"))]);
        router.handshake(&json!({})).await;
        let base = spawn_app(router).await;

        let response = reqwest::Client::new()
            .get(format!("{base}/events"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let mut events = Box::pin(parse_sse_events(Box::pin(response.bytes_stream())));

        // Give the handler a moment to subscribe before pushing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        connector.push(
            "ci",
            json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}}),
        );

        let event = events.next().await.unwrap().unwrap();
        let message: Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(message["method"], "notifications/message");
        assert_eq!(message["params"]["_meta"]["endpoint"], "ci");
    }
}
