use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use rescue_core::ConnectionId;
use rescue_telemetry::metrics::names;
use tracing::Instrument;

use crate::registry::Outgoing;
use crate::relay::InboundFrame;
use crate::server::AppState;

/// Run one admitted socket until it closes, errors, is evicted, or the server
/// shuts down.
pub async fn serve(socket: WebSocket, origin: String, state: AppState) {
    let (id, rx) = state.registry.register(origin.clone());
    let span = tracing::info_span!("ws_connection", connection_id = %id);

    async move {
        state.metrics.counter_inc(names::CONNECTIONS_ADMITTED, &[], 1);
        state
            .metrics
            .gauge_set(names::CONNECTIONS_ACTIVE, &[], state.registry.count() as i64);
        tracing::info!(origin = %origin, "websocket client connected");

        pump(socket, &id, rx, &state).await;

        let was_registered = state.registry.unregister(&id);
        state
            .metrics
            .gauge_set(names::CONNECTIONS_ACTIVE, &[], state.registry.count() as i64);
        tracing::info!(evicted = !was_registered, "websocket client disconnected");
    }
    .instrument(span)
    .await
}

async fn pump(
    socket: WebSocket,
    id: &ConnectionId,
    mut rx: tokio::sync::mpsc::Receiver<Outgoing>,
    state: &AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Ends when the registry drops the record (eviction) or the peer is gone.
    let writer = async {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Outgoing::Text(text) => WsMessage::Text(text.into()),
                Outgoing::Ping => WsMessage::Ping(Vec::new().into()),
            };
            if let Err(e) = ws_tx.send(msg).await {
                tracing::debug!(error = %e, "websocket send failed");
                break;
            }
        }
    };

    let reader = async {
        while let Some(msg) = ws_rx.next().await {
            let frame = match msg {
                Ok(WsMessage::Text(text)) => InboundFrame::Text(text.to_string()),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => InboundFrame::Text(text),
                    Err(_) => InboundFrame::Undecodable,
                },
                Ok(WsMessage::Pong(_)) => {
                    state.registry.mark_alive(id);
                    continue;
                }
                Ok(WsMessage::Ping(_)) => continue, // axum answers pings
                Ok(WsMessage::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "websocket error");
                    break;
                }
            };
            if state.inbox.send((id.clone(), frame)).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
        _ = state.shutdown.cancelled() => {},
    }
}
