//! Login: token validation, session establishment, and catch-up delivery.
//!
//! A successful login binds the connection locally, writes the durable
//! session record, and registers the cluster index entry, then asynchronously
//! (1) drains the offline queue in batches and (2) unconditionally resends
//! every still-unacknowledged message. A failed login answers Fail and
//! closes the connection.

use std::time::Duration;

use crate::error::Result;
use crate::message::{now_millis, EventKind, Message, SessionRecord};
use crate::registry::Connection;
use crate::state::AppState;
use crate::store::keys;

/// Offline messages re-delivered per batch, with a pause between full
/// batches to avoid saturating a fresh connection.
const OFFLINE_BATCH: usize = 200;
const OFFLINE_BATCH_PAUSE: Duration = Duration::from_millis(500);

pub async fn handle(state: &AppState, conn: &Connection, msg: Message) -> Result<()> {
    let uid = msg.from_uid.clone();
    let device_id = if msg.device_id.is_empty() {
        "default".to_string()
    } else {
        msg.device_id.clone()
    };

    let stored_token = state.store.get(&keys::token(&uid)).await?;
    let valid = !msg.token.is_empty() && stored_token.as_deref() == Some(msg.token.as_str());
    if !valid {
        tracing::warn!(user = %uid, "Login failed: invalid token");
        state
            .delivery
            .send_response(conn, EventKind::Login, Some(&uid), "Fail")
            .await?;
        conn.close();
        return Ok(());
    }

    state.registry.bind(&uid, &device_id, conn.clone());

    let record = SessionRecord {
        user_id: uid.clone(),
        conn_id: conn.id.to_string(),
        device_id: device_id.clone(),
        login_time: now_millis(),
        instance_id: state.cluster.instance_id().to_string(),
    };
    state
        .store
        .hash_put(
            &keys::session(&uid),
            &device_id,
            &serde_json::to_string(&record)?,
        )
        .await?;
    state.cluster.register_session(&uid, &device_id).await?;

    tracing::info!(user = %uid, device = %device_id, "User logged in");

    state
        .delivery
        .send_response(conn, EventKind::Login, Some(&uid), "Success")
        .await?;

    // Catch-up delivery runs off the login path: offline messages become
    // newly-pending acks, then everything still unacked goes out again.
    let state = state.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        if let Err(e) = push_offline_messages(&state, &conn, &uid).await {
            tracing::error!(user = %uid, error = %e, "Error pushing offline messages");
        }
        if let Err(e) = push_unacked_messages(&state, &conn, &uid).await {
            tracing::error!(user = %uid, error = %e, "Error pushing unacked messages");
        }
    });

    Ok(())
}

/// Drain the user's offline queue in FIFO order. Each batch is trimmed off
/// the list before delivery; if the connection dies mid-drain the remaining
/// popped messages are dropped, not re-queued.
pub async fn push_offline_messages(state: &AppState, conn: &Connection, uid: &str) -> Result<()> {
    let key = keys::offline(uid);
    let pending = state.store.list_len(&key).await?;
    if pending == 0 {
        return Ok(());
    }
    tracing::info!(user = %uid, pending, "Start pushing offline messages");

    let mut pushed = 0usize;
    loop {
        let batch = state
            .store
            .list_range(&key, 0, OFFLINE_BATCH as isize - 1)
            .await?;
        if batch.is_empty() {
            break;
        }
        state
            .store
            .list_trim(&key, batch.len() as isize, -1)
            .await?;

        let batch_len = batch.len();
        for serialized in batch {
            let msg: Message = match serde_json::from_str(&serialized) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(user = %uid, error = %e, "Dropping malformed offline message");
                    continue;
                }
            };
            if !conn.is_open() {
                tracing::warn!(user = %uid, "Connection closed during offline message push");
                return Ok(());
            }
            // Offline messages become pending acks now that they are sent.
            state.delivery.send_and_cache(conn, &msg).await?;
        }

        pushed += batch_len;
        if batch_len < OFFLINE_BATCH {
            break;
        }
        tokio::time::sleep(OFFLINE_BATCH_PAUSE).await;
    }
    tracing::info!(user = %uid, pushed, "Finished pushing offline messages");
    Ok(())
}

/// Unconditionally resend every not-yet-acked message (already cached, so a
/// plain send). Distinct from the Ping path, which only resends entries past
/// the retry window.
pub async fn push_unacked_messages(state: &AppState, conn: &Connection, uid: &str) -> Result<()> {
    let entries = state.store.hash_entries(&keys::ack(uid)).await?;
    if entries.is_empty() {
        return Ok(());
    }
    tracing::info!(user = %uid, count = entries.len(), "Resending unacked messages");

    for (_, serialized) in entries {
        let msg: Message = match serde_json::from_str(&serialized) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(user = %uid, error = %e, "Skipping malformed ack cache entry");
                continue;
            }
        };
        if !conn.is_open() {
            return Ok(());
        }
        state.delivery.send(conn, &msg).await?;
    }
    Ok(())
}
