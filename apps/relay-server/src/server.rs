//! HTTP surface of the relay: WebSocket endpoint plus health and stats

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use chat_protocol::ClientRequest;

use crate::broker::Broker;

/// Build the axum application around a shared broker
pub fn app(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(broker)
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Stats endpoint
async fn stats_handler(State(broker): State<Arc<Broker>>) -> String {
    format!(
        r#"{{"clients": {}, "sessions": {}}}"#,
        broker.client_count(),
        broker.session_count()
    )
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(broker): State<Arc<Broker>>) -> Response {
    ws.on_upgrade(move |socket| handle_client(socket, broker))
}

/// Drive one client connection: drain broker events onto the socket, feed
/// incoming requests into the broker, and tear down on close
async fn handle_client(socket: WebSocket, broker: Arc<Broker>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_id, mut events) = broker.connect();
    info!("Client connected: {}", client_id);

    let forward_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };

            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let request = match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Invalid request from {}: {}", client_id, e);
                    continue;
                }
            },
            Ok(Message::Binary(_)) => {
                warn!("Ignoring binary frame from {}", client_id);
                continue;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!("WebSocket error for {}: {}", client_id, e);
                break;
            }
        };

        match request {
            ClientRequest::RequestConnection {
                target_id,
                public_key,
            } => broker.request_connection(client_id, target_id, public_key),
            ClientRequest::AcceptConnection {
                target_id,
                wrapped_secret,
            } => broker.accept_connection(client_id, target_id, wrapped_secret),
            ClientRequest::RejectConnection { target_id } => {
                broker.reject_connection(client_id, target_id)
            }
            ClientRequest::Send { session_id, body } => broker.send(client_id, session_id, body),
        }
    }

    info!("Client disconnected: {}", client_id);
    broker.disconnect(client_id);
    forward_task.abort();
}
