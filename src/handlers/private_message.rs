//! Private message routing: local delivery, cross-instance forwarding, and
//! offline queuing.
//!
//! Local delivery and the cluster session lookup are not mutually exclusive:
//! a user connected here can also hold a (possibly stale) session record on
//! another instance, in which case the message is forwarded there too. The
//! contract is at-least-once, not exactly-once.

use std::collections::HashSet;

use crate::error::Result;
use crate::message::{Message, SessionRecord};
use crate::registry::Connection;
use crate::state::AppState;
use crate::store::keys;

pub async fn handle(state: &AppState, _conn: &Connection, msg: Message) -> Result<()> {
    route(state, msg).await
}

/// Route a message to its recipient wherever they are connected. Also the
/// delivery path for each member copy of a group fan-out.
pub async fn route(state: &AppState, msg: Message) -> Result<()> {
    let to_uid = msg.to_uid.clone();

    // Local devices first.
    let mut sent_locally = false;
    for conn in state.registry.get_connections(&to_uid) {
        if !conn.is_open() {
            continue;
        }
        match state.delivery.send_and_cache(&conn, &msg).await {
            Ok(()) => sent_locally = true,
            Err(e) => {
                tracing::warn!(to_uid = %to_uid, error = %e, "Local delivery failed");
            }
        }
    }

    // Always consult the cluster-wide session records: the recipient may have
    // further devices on other instances.
    match state.store.hash_entries(&keys::session(&to_uid)).await {
        Ok(sessions) if !sessions.is_empty() => {
            let mut forwarded: HashSet<String> = HashSet::new();
            for (_, serialized) in sessions {
                let record: SessionRecord = match serde_json::from_str(&serialized) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(to_uid = %to_uid, error = %e, "Skipping malformed session record");
                        continue;
                    }
                };
                if record.instance_id == state.cluster.instance_id() {
                    continue;
                }
                // One forward per target instance, even with several devices
                // there.
                if !forwarded.insert(record.instance_id.clone()) {
                    continue;
                }
                tracing::debug!(
                    to_uid = %to_uid,
                    target_instance = %record.instance_id,
                    "Recipient on another instance, forwarding"
                );
                if let Err(e) = state
                    .cluster
                    .forward_to_instance(&record.instance_id, &msg)
                    .await
                {
                    tracing::warn!(
                        target_instance = %record.instance_id,
                        error = %e,
                        "Failed to forward message"
                    );
                }
            }
        }
        Ok(_) => {
            if !sent_locally {
                queue_offline(state, &msg).await?;
            }
        }
        Err(e) => {
            tracing::error!(to_uid = %to_uid, error = %e, "Error checking remote sessions");
            if !sent_locally {
                queue_offline(state, &msg).await?;
            }
        }
    }

    Ok(())
}

/// Recipient is offline everywhere: reliable messages wait in the FIFO queue
/// for the next login, everything else is dropped.
async fn queue_offline(state: &AppState, msg: &Message) -> Result<()> {
    if !msg.is_reliable() {
        return Ok(());
    }
    state
        .store
        .list_push_back(&keys::offline(&msg.to_uid), &serde_json::to_string(msg)?)
        .await?;
    tracing::debug!(to_uid = %msg.to_uid, "Recipient offline, message queued");
    Ok(())
}
