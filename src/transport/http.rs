use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, ReceiverStream};
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::mcp::protocol;
use crate::mcp::{ClientContext, Dispatcher};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

/// Build the HTTP application: `POST /mcp` (classic or chunked per
/// config), the `GET /events` + `/sse` event streams, and `/health`.
pub fn create_app(dispatcher: Arc<Dispatcher>) -> Router {
    let cors = cors_layer(dispatcher.config());
    Router::new()
        .route("/mcp", post(mcp_post))
        .route("/events", get(events))
        .route("/sse", get(events))
        .route("/health", get(health))
        .layer(cors)
        .with_state(AppState { dispatcher })
}

pub async fn serve(dispatcher: Arc<Dispatcher>, listen: &str) -> anyhow::Result<()> {
    let app = create_app(dispatcher);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen, "MCP gateway listening on http");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Exact-origin CORS from `allowed_origins`, permissive only when `*` is
/// listed.
fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    if config.allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .unwrap_or_else(|| "http".to_string())
}

async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            // Malformed JSON is the one case that earns an HTTP 400.
            let err = GatewayError::Parse(e.to_string());
            return (StatusCode::BAD_REQUEST, Json(protocol::error_response(None, &err)))
                .into_response();
        }
    };

    let key = client_key(&headers);

    if state.dispatcher.config().http.streamable {
        streamable_response(state, key, parsed)
    } else {
        classic_response(state, key, parsed).await
    }
}

/// Classic mode: one JSON-RPC request, one JSON-RPC response, HTTP 200
/// even for JSON-RPC level errors. Notifications answer 202 with an empty
/// body.
async fn classic_response(state: AppState, key: String, parsed: Value) -> Response {
    let client_id = state.dispatcher.bus().register_client();
    let client = ClientContext::new(client_id, key, None);

    let response = state.dispatcher.handle_message(parsed, &client).await;
    state.dispatcher.bus().drop_client(client_id);

    match response {
        Some(v) => (StatusCode::OK, Json(v)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Streamable mode: the response body is chunked newline-delimited JSON.
/// Batched requests produce one chunk per response, and notifications
/// published while the batch runs are interleaved as their own chunks.
fn streamable_response(state: AppState, key: String, parsed: Value) -> Response {
    let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Bytes, Infallible>>(32);
    let queue = state.dispatcher.config().sse_queue_maxsize.max(1);
    let (note_tx, mut note_rx) = mpsc::channel::<Value>(queue);

    let note_chunks = chunk_tx.clone();
    tokio::spawn(async move {
        while let Some(notification) = note_rx.recv().await {
            if note_chunks.send(Ok(to_chunk(&notification))).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let dispatcher = state.dispatcher;
        let client_id = dispatcher.bus().register_client();
        let client = ClientContext::new(client_id, key, Some(note_tx));

        let requests = match parsed {
            Value::Array(batch) => batch,
            single => vec![single],
        };

        for request in requests {
            if let Some(response) = dispatcher.handle_message(request, &client).await
                && chunk_tx.send(Ok(to_chunk(&response))).await.is_err()
            {
                break;
            }
        }

        dispatcher.bus().drop_client(client_id);
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(ReceiverStream::new(chunk_rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn to_chunk(value: &Value) -> Bytes {
    let mut line = value.to_string();
    line.push('\n');
    Bytes::from(line)
}

/// `notifications/*` fan-out as `text/event-stream`; the event name is
/// the notification method and `data:` carries the params.
async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let receiver = state.dispatcher.bus().broadcast_receiver();

    let keepalive = IntervalStream::new(tokio::time::interval(Duration::from_secs(15)))
        .map(|_| Ok::<Event, Infallible>(Event::default().comment("keepalive")));

    let stream = BroadcastStream::new(receiver).filter_map(|message| match message {
        Ok(v) => {
            let event_name = v
                .get("method")
                .and_then(|m| m.as_str())
                .unwrap_or("message")
                .to_string();
            let data = v.get("params").cloned().unwrap_or(Value::Null);
            Some(Ok::<Event, Infallible>(
                Event::default().event(event_name).data(data.to_string()),
            ))
        }
        Err(_) => None,
    });

    Sse::new(keepalive.merge(stream)).keep_alive(KeepAlive::default())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.dispatcher.healthy().await;
    let stats = state.dispatcher.pool_stats();
    let body = json!({
        "ok": healthy,
        "pool": {
            "size": stats.size,
            "idle": stats.idle,
            "in_use": stats.in_use,
        },
        "sessions": {
            "count": state.dispatcher.session_count(),
        }
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
