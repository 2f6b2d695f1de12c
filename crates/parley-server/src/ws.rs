//! WebSocket transport and HTTP surface.
//!
//! One socket per client. Frames are bincode-encoded: the reader half
//! feeds [`Session::handle_frame`], the writer half drains the session's
//! outbound channel. After a `ForcedLogout` is written the socket is
//! closed from our side.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use parley_shared::protocol::{ClientFrame, ServerFrame};

use crate::session::Session;
use crate::state::RelayState;

pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<RelayState>) -> anyhow::Result<()> {
    let addr = state.config.http_addr;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Relay listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    instance: String,
    online: usize,
}

async fn health_check(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instance: state.config.instance_name.clone(),
        online: state.presence.all().len(),
    })
}

async fn ws_upgrade(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<RelayState>, socket: WebSocket) {
    let connection_id = state.next_connection_id();
    debug!(connection = connection_id, "socket opened");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut session = Session::new(state, connection_id, tx);

    // Writer half: serialize outbound frames onto the socket. Owns the
    // sink; ends when the channel closes or a forced logout is written.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let forced = matches!(frame, ServerFrame::ForcedLogout { .. });
            let bytes = match frame.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(connection = connection_id, error = %e, "frame encode failed");
                    continue;
                }
            };
            if sink.send(WsMessage::Binary(bytes)).await.is_err() {
                break;
            }
            if forced {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader half: decode inbound frames and hand them to the session.
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection = connection_id, error = %e, "socket read error");
                break;
            }
        };
        match msg {
            WsMessage::Binary(bytes) => match ClientFrame::from_bytes(&bytes) {
                Ok(frame) => session.handle_frame(frame).await,
                Err(e) => {
                    warn!(connection = connection_id, error = %e, "undecodable frame");
                }
            },
            WsMessage::Close(_) => break,
            // Pings are answered by axum itself.
            _ => {}
        }
    }

    session.close();
    drop(session);
    let _ = writer.await;
    debug!(connection = connection_id, "socket closed");
}
