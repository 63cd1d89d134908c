//! WebSocket upgrade endpoint: GET /ws/:user_id
//!
//! The bearer gate has already run when the handler is reached. The path
//! segment is the connection identity; it is not compared with the token's
//! username.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Extension, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use parley_core::{InboundFrame, MessageRouter, OutboundFrame, UserId};
use parley_shutdown::ConnectionGuard;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::auth::AuthenticatedUser;
use super::error_response;
use crate::server::AppState;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedUser(username)): Extension<AuthenticatedUser>,
    Path(raw_id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let user_id: UserId = match raw_id.parse() {
        Ok(id) => id,
        Err(_) => {
            debug!(%raw_id, "Rejected upgrade with malformed user id");
            return error_response(StatusCode::BAD_REQUEST, "invalid_user_id", "Invalid uuid")
                .into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(%user_id, %username, "WebSocket upgrade");
    let guard = state.shutdown.connection_guard();
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state, guard))
}

async fn handle_socket(
    socket: WebSocket,
    user_id: UserId,
    state: Arc<AppState>,
    _guard: ConnectionGuard,
) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(state.outbound_buffer);

    let router = MessageRouter::register(user_id, tx, state.router.clone());
    let writer = tokio::spawn(write_frames(sink, rx, user_id));

    let inbound = stream.map(|frame| frame.map(into_inbound));
    let reason = router.run(inbound, state.stop_token()).await;
    info!(%user_id, ?reason, "WebSocket connection closed");

    // The writer exits once every handle to the outbound channel is gone.
    if let Err(e) = writer.await {
        warn!(%user_id, error = %e, "Writer task failed");
    }
}

fn into_inbound(message: Message) -> InboundFrame {
    match message {
        Message::Text(text) => InboundFrame::Text(text),
        Message::Binary(data) => InboundFrame::Binary(data),
        Message::Ping(data) => InboundFrame::Ping(data),
        Message::Pong(_) => InboundFrame::Pong,
        Message::Close(_) => InboundFrame::Close,
    }
}

/// Forward queued frames to the socket until the channel closes or a close
/// frame has been sent.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    user_id: UserId,
) {
    while let Some(frame) = rx.recv().await {
        let (message, closing) = match frame {
            OutboundFrame::Text(text) => (Message::Text(text), false),
            OutboundFrame::Pong(data) => (Message::Pong(data), false),
            OutboundFrame::Close => (Message::Close(None), true),
        };

        if let Err(e) = sink.send(message).await {
            debug!(%user_id, error = %e, "Socket write failed");
            break;
        }
        if closing {
            break;
        }
    }

    let _ = sink.close().await;
}
