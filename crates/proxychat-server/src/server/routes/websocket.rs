//! Chat stream over WebSocket.
//!
//! `GET /ws?user_id=N` upgrades to a socket carrying one chat message JSON
//! object per text frame, in both directions.

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use proxychat_delivery::{Outbound, SessionOutbound, UserId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

/// How long teardown waits for the writer to flush before aborting it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Create the WebSocket router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    user_id: Option<String>,
}

/// GET /ws
///
/// The user id is checked before the upgrade so a bad request never opens a
/// session.
async fn websocket_handler(
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let raw = params.user_id.as_deref().map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing user_id").into_response();
    }
    let user_id: UserId = match raw.parse() {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!(user_id = %raw, error = %e, "Rejecting connection");
            return (StatusCode::BAD_REQUEST, "Invalid user_id").into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(user_id = %user_id, error = %rejection, "WebSocket upgrade rejected");
            return rejection.into_response();
        }
    };

    info!(user_id = %user_id, "WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Run one session: register, write backlog and live traffic, read frames
/// until the socket closes, tear down.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: UserId) {
    let sessions = Arc::clone(&state.delivery.sessions);
    let (mut session, outbound) = match sessions.connect(user_id).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Failed to register session");
            return;
        }
    };

    let (sender, mut receiver) = socket.split();
    let (control_tx, control_rx) = mpsc::channel::<Message>(8);
    let mut writer = tokio::spawn(write_loop(sender, outbound, control_rx, user_id));

    let mut writer_done = false;
    session.start_reading();
    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!(user_id = %user_id, len = text.len(), "Received frame");
                    sessions.handle_frame(&mut session, &text).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(user_id = %user_id, "Received binary WebSocket message (not supported)");
                }
                Some(Ok(Message::Ping(data))) => {
                    if control_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    // Ignore pongs
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(user_id = %user_id, "WebSocket close requested");
                    break;
                }
                Some(Err(e)) => {
                    error!(user_id = %user_id, error = %e, "WebSocket error");
                    break;
                }
            },
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                debug!(user_id = %user_id, "Writer finished, ending session");
                break;
            }
            _ = state.shutdown.cancelled() => {
                let _ = control_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "server shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    sessions.disconnect(&mut session).await;
    drop(control_tx);
    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!(user_id = %user_id, "Writer did not finish, aborting");
        writer.abort();
    }

    info!(user_id = %user_id, "WebSocket connection closed");
}

/// Forward backlog, live messages and control frames to the socket.
async fn write_loop<S>(
    mut sender: S,
    mut outbound: SessionOutbound,
    mut control_rx: mpsc::Receiver<Message>,
    user_id: UserId,
) where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(control) = control_rx.recv() => {
                let closing = matches!(control, Message::Close(_));
                if let Err(e) = sender.send(control).await {
                    error!(user_id = %user_id, error = %e, "Failed to send control frame");
                    return;
                }
                if closing {
                    return;
                }
                continue;
            }
            item = outbound.recv() => item,
        };

        match frame {
            Some(Outbound::Message(message)) => {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(user_id = %user_id, error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(text)).await {
                    error!(user_id = %user_id, error = %e, "Failed to send WebSocket message");
                    return;
                }
            }
            Some(Outbound::Close { reason }) => {
                info!(user_id = %user_id, reason = %reason, "Closing WebSocket");
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    })))
                    .await;
                return;
            }
            None => return,
        }
    }
}
