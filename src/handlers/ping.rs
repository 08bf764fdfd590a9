//! Application-level heartbeat and the steady-state QoS-1 retry path.
//!
//! Every Ping gets an immediate Pong; the sender's ack cache is then scanned
//! off-path and any entry older than the retry window is retransmitted.

use crate::error::Result;
use crate::message::{now_millis, EventKind, Message};
use crate::registry::Connection;
use crate::state::AppState;
use crate::store::keys;

/// An unacked message is retransmitted once its age exceeds this window.
pub const RETRY_TIMEOUT_MS: u64 = 5000;

pub async fn handle(state: &AppState, conn: &Connection, msg: Message) -> Result<()> {
    state
        .delivery
        .send_response(conn, EventKind::Ping, None, "PONG")
        .await?;

    if !msg.from_uid.is_empty() {
        let state = state.clone();
        let conn = conn.clone();
        let uid = msg.from_uid;
        tokio::spawn(async move {
            if let Err(e) = resend_timed_out(&state, &conn, &uid).await {
                tracing::error!(user = %uid, error = %e, "Error checking unacked messages");
            }
        });
    }
    Ok(())
}

/// Retransmit ack-cache entries older than [`RETRY_TIMEOUT_MS`]. Entries with
/// unparsable timestamp fields are skipped.
pub async fn resend_timed_out(state: &AppState, conn: &Connection, uid: &str) -> Result<()> {
    let entries = state.store.hash_entries(&keys::ack(uid)).await?;
    if entries.is_empty() {
        return Ok(());
    }

    let now = now_millis();
    for (s_timest, serialized) in entries {
        let Ok(sent_at) = s_timest.parse::<u64>() else {
            continue;
        };
        if now.saturating_sub(sent_at) <= RETRY_TIMEOUT_MS {
            continue;
        }
        if !conn.is_open() {
            return Ok(());
        }
        let msg: Message = match serde_json::from_str(&serialized) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(user = %uid, error = %e, "Skipping malformed ack cache entry");
                continue;
            }
        };
        tracing::debug!(user = %uid, s_timest = %s_timest, "Resending timed-out message");
        state.delivery.send(conn, &msg).await?;
    }
    Ok(())
}
