//! Relay transport
//!
//! Maintains the WebSocket connection to the relay and bridges it onto
//! channels: requests flow out, server events flow in.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{error, info, warn};

use chat_protocol::{ClientRequest, ServerEvent};

/// Default relay endpoint for local development
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws";

/// Relay transport error
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Connect to the relay and bridge the socket onto channels.
///
/// The returned sender carries requests to the relay; the receiver yields
/// server events, beginning with [`ServerEvent::Connected`]. Dropping the
/// sender ends the background I/O task and closes the socket.
pub async fn connect(
    relay_url: &str,
) -> TransportResult<(mpsc::Sender<ClientRequest>, mpsc::Receiver<ServerEvent>)> {
    info!("Connecting to relay: {}", relay_url);

    let (ws_stream, _) = connect_async(relay_url)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    info!("WebSocket connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Requests TO the relay
    let (send_tx, mut send_rx) = mpsc::channel::<ClientRequest>(100);

    // Events FROM the relay
    let (recv_tx, recv_rx) = mpsc::channel::<ServerEvent>(100);

    // Background task owning the socket halves
    tokio::spawn(async move {
        loop {
            tokio::select! {
                // Outgoing: Application -> Relay
                outgoing = send_rx.recv() => {
                    let Some(request) = outgoing else {
                        break;
                    };
                    let json = match serde_json::to_string(&request) {
                        Ok(j) => j,
                        Err(e) => {
                            error!("Failed to serialize outgoing request: {}", e);
                            continue;
                        }
                    };

                    if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                        error!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }

                // Incoming: Relay -> Application
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerEvent>(&text) {
                                Ok(event) => {
                                    if recv_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!("Failed to parse incoming event: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Relay closed connection");
                            break;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Binary(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            error!("WebSocket receive error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        info!("Relay transport loop ended");
    });

    Ok((send_tx, recv_rx))
}
