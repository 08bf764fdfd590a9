//! Actor-per-connection transport loop.
//!
//! Splits the WebSocket into reader and writer halves: the writer task owns
//! the sink and forwards frames from the connection's mpsc channel; the
//! reader loop decodes inbound frames and hands them to the event router.
//!
//! The reader applies the configured idle timeout to every frame wait. This
//! is connection-level liveness, independent of the application Ping that
//! drives message-level retries.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::crypto;
use crate::message::{looks_like_json, now_millis, EventKind, Message};
use crate::registry::Connection;
use crate::router;
use crate::state::AppState;
use crate::store::keys;

pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let conn = Connection::new(tx.clone());

    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));
    tracing::debug!(conn_id = conn.id, "Connection opened");

    loop {
        match timeout(state.idle_timeout, ws_receiver.next()).await {
            Err(_) => {
                tracing::info!(conn_id = conn.id, "Connection idle, closing");
                break;
            }
            Ok(None) => {
                tracing::debug!(conn_id = conn.id, "Connection stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(conn_id = conn.id, error = %e, "WebSocket receive error");
                break;
            }
            Ok(Some(Ok(frame))) => match frame {
                WsMessage::Text(text) => handle_text(&state, &conn, text.as_str()),
                WsMessage::Ping(data) => {
                    let _ = tx.send(WsMessage::Pong(data));
                }
                WsMessage::Pong(_) => {}
                WsMessage::Close(frame) => {
                    tracing::debug!(conn_id = conn.id, reason = ?frame, "Client initiated close");
                    break;
                }
                WsMessage::Binary(_) => {
                    tracing::debug!(conn_id = conn.id, "Ignoring binary frame");
                }
            },
        }
    }

    writer_handle.abort();
    cleanup(&state, &conn).await;
    tracing::debug!(conn_id = conn.id, "Connection closed");
}

/// Decode one inbound text frame and dispatch it. Malformed frames are
/// logged and dropped; the connection stays open.
fn handle_text(state: &AppState, conn: &Connection, text: &str) {
    let decoded = if looks_like_json(text) {
        text.to_string()
    } else {
        // Obfuscated frame: needs the sender's cipher, which requires a
        // bound user.
        match state.registry.user_by_conn(conn.id) {
            Some(uid) => match crypto::decrypt(&uid, text) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    tracing::warn!(conn_id = conn.id, user = %uid, error = %e, "Failed to decrypt frame");
                    return;
                }
            },
            None => {
                tracing::debug!(conn_id = conn.id, "Dropping undecryptable frame from unbound connection");
                return;
            }
        }
    };

    let mut msg: Message = match serde_json::from_str(&decoded) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::error!(conn_id = conn.id, error = %e, "Failed to parse message");
            return;
        }
    };

    if msg.event_id != EventKind::Ping.code() {
        tracing::debug!(
            conn_id = conn.id,
            event_id = %msg.event_id,
            from = %msg.from_uid,
            "Received message"
        );
    }
    msg.s_timest = now_millis().to_string();
    router::dispatch(state, conn, msg);
}

/// Tear down everything the connection claimed: the local registry mapping,
/// the durable session record, and the cluster index entry.
async fn cleanup(state: &AppState, conn: &Connection) {
    let Some(binding) = state.registry.unbind(conn) else {
        return; // never logged in
    };

    if let Err(e) = state
        .store
        .hash_del(&keys::session(&binding.user_id), &[binding.device_id.clone()])
        .await
    {
        tracing::error!(user = %binding.user_id, error = %e, "Failed to delete session record");
    }
    if let Err(e) = state
        .cluster
        .unregister_session(&binding.user_id, &binding.device_id)
        .await
    {
        tracing::error!(user = %binding.user_id, error = %e, "Failed to unregister cluster session");
    }
    tracing::info!(
        user = %binding.user_id,
        device = %binding.device_id,
        "Cleaned up session on disconnect"
    );
}

/// Writer task: owns the sink, forwards frames until the channel or the
/// socket closes.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
) {
    while let Some(frame) = rx.recv().await {
        let is_close = matches!(frame, WsMessage::Close(_));
        if ws_sender.send(frame).await.is_err() || is_close {
            break;
        }
    }
}
