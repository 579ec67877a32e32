//! Websocket server implementation using axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::Gateway;
use crate::registry::ClientId;

/// Shared application state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
}

/// Create the axum router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler() -> String {
    fangate_telemetry::metrics::render()
}

/// WebSocket upgrade handler.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Handle one client connection: a bounded outbound queue drained by a
/// writer task, and a read loop dispatching client messages. The queue
/// bound is the backpressure contract; the hub disconnects clients
/// that let it overflow.
async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let client: ClientId = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.gateway.queue_capacity());

    state.gateway.on_client_connect(client, tx);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                debug!("Client write failed, closing");
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                state.gateway.handle_client_message(client, &text);
            }
            Ok(Message::Close(_)) => {
                debug!(%client, "Client sent close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(%client, error = %e, "Client receive error");
                break;
            }
        }
    }

    state.gateway.on_client_disconnect(client);
    writer.abort();
}

/// Run the gateway websocket server.
pub async fn run_server(gateway: Arc<Gateway>, port: u16) -> GatewayResult<()> {
    let state = AppState { gateway };
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting gateway server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Bind(e.to_string()))?;
    axum::serve(listener, app).await?;

    Ok(())
}
