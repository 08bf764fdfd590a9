//! Delivery engine: writes messages to live connections.
//!
//! Two send classes: best-effort (`send`, used for pongs and system
//! responses) and reliable (`send_and_cache`, which records the message in
//! the recipient's ack cache before the connection write so a crash between
//! the two still leaves the message retransmittable).

use std::sync::Arc;

use crate::crypto;
use crate::error::Result;
use crate::message::{now_millis, EventKind, Message, SYSTEM_UID};
use crate::registry::{Connection, ConnectionRegistry};
use crate::store::{keys, SharedStore};

#[derive(Clone)]
pub struct MessageSender {
    store: Arc<dyn SharedStore>,
    registry: Arc<ConnectionRegistry>,
}

impl MessageSender {
    pub fn new(store: Arc<dyn SharedStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Send without caching. A dead connection is a silent no-op; reliability
    /// for the recipient comes from the ack cache written by the original
    /// reliable send, never from this path.
    pub async fn send(&self, conn: &Connection, msg: &Message) -> Result<()> {
        if !conn.is_open() {
            return Ok(());
        }
        let text = self.encode_for(conn, msg)?;
        conn.send_text(text);
        Ok(())
    }

    /// Send a reliable message: write the ack-cache entry keyed by the
    /// message's server timestamp, then write to the connection. The entry
    /// stays until the client acks that timestamp.
    pub async fn send_and_cache(&self, conn: &Connection, msg: &Message) -> Result<()> {
        if !conn.is_open() {
            return Ok(());
        }
        if !msg.to_uid.is_empty() && !msg.s_timest.is_empty() {
            self.store
                .hash_put(
                    &keys::ack(&msg.to_uid),
                    &msg.s_timest,
                    &serde_json::to_string(msg)?,
                )
                .await?;
        }
        let text = self.encode_for(conn, msg)?;
        conn.send_text(text);
        Ok(())
    }

    /// Send a minimal system-originated response (Success/Fail/PONG bodies).
    pub async fn send_response(
        &self,
        conn: &Connection,
        event: EventKind,
        to_uid: Option<&str>,
        body: &str,
    ) -> Result<()> {
        let resp = Message {
            event_id: event.code().to_string(),
            from_uid: SYSTEM_UID.to_string(),
            to_uid: to_uid.unwrap_or_default().to_string(),
            data_body: body.to_string(),
            s_timest: now_millis().to_string(),
            is_cache: "0".to_string(),
            ..Default::default()
        };
        self.send(conn, &resp).await
    }

    /// Serialize and, when the connection has a bound user, encrypt with that
    /// user's cipher. An unbound connection (first contact, pre-login) gets
    /// the payload in the clear.
    fn encode_for(&self, conn: &Connection, msg: &Message) -> Result<String> {
        let json = serde_json::to_string(msg)?;
        match self.registry.user_by_conn(conn.id) {
            Some(uid) => crypto::encrypt(&uid, &json),
            None => Ok(json),
        }
    }
}
