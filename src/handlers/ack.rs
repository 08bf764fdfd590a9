//! Acknowledgement: the only way entries leave the ack cache outside of
//! cluster cleanup.

use crate::error::Result;
use crate::message::Message;
use crate::registry::Connection;
use crate::state::AppState;
use crate::store::keys;

/// `dataBody` carries a JSON array of server-timestamp strings; each one
/// names a delivered message to drop from the sender's ack cache.
pub async fn handle(state: &AppState, _conn: &Connection, msg: Message) -> Result<()> {
    if msg.data_body.is_empty() {
        return Ok(());
    }

    let acked: Vec<String> = serde_json::from_str(&msg.data_body)?;
    if acked.is_empty() {
        return Ok(());
    }

    state
        .store
        .hash_del(&keys::ack(&msg.from_uid), &acked)
        .await?;
    tracing::debug!(user = %msg.from_uid, count = acked.len(), "Acked messages removed from cache");
    Ok(())
}
