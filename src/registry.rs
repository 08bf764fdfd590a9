//! In-memory connection registry: (user, device) -> live connection.
//!
//! Per-instance only; the cluster-wide view lives in the shared store's
//! session records. A user may hold one connection per device. All operations
//! are safe under arbitrary concurrent callers; mutual exclusion is per-key
//! via the map shards, never a coarse lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message as WsMessage;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Sender half of a connection's outbound channel. The writer task on the
/// other end owns the WebSocket sink.
pub type ConnectionSender = mpsc::UnboundedSender<WsMessage>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live transport connection.
///
/// Cloning is cheap; all clones share the same outbound channel. The
/// connection counts as live while the writer task still holds the receiver.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: u64,
    tx: ConnectionSender,
}

impl Connection {
    pub fn new(tx: ConnectionSender) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a text frame. Returns false if the connection is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(WsMessage::Text(text.into())).is_ok()
    }

    pub fn send_raw(&self, msg: WsMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Queue a close frame; the writer task shuts the socket down.
    pub fn close(&self) {
        let _ = self.tx.send(WsMessage::Close(None));
    }
}

/// Identity attached to a connection at bind (login) time.
#[derive(Debug, Clone)]
pub struct Binding {
    pub user_id: String,
    pub device_id: String,
}

/// user -> (device -> connection), plus a reverse map from connection id to
/// its binding for encryption-key lookup and disconnect cleanup.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: DashMap<String, HashMap<String, Connection>>,
    bindings: DashMap<u64, Binding>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a (user, device) pair to a connection, replacing any existing
    /// mapping for that pair. The replaced connection is not closed here;
    /// its own actor cleans up when it notices the disconnect.
    pub fn bind(&self, uid: &str, device_id: &str, conn: Connection) {
        self.bindings.insert(
            conn.id,
            Binding {
                user_id: uid.to_string(),
                device_id: device_id.to_string(),
            },
        );
        self.users
            .entry(uid.to_string())
            .or_default()
            .insert(device_id.to_string(), conn);
    }

    /// Remove a connection's mapping. The device entry is only removed if it
    /// still points at this exact connection, so an unbind racing a newer
    /// bind after reconnect leaves the new mapping intact. Returns the
    /// binding that was attached at login, if any.
    pub fn unbind(&self, conn: &Connection) -> Option<Binding> {
        let (_, binding) = self.bindings.remove(&conn.id)?;

        let mut user_empty = false;
        if let Some(mut devices) = self.users.get_mut(&binding.user_id) {
            if devices.get(&binding.device_id).map(|c| c.id) == Some(conn.id) {
                devices.remove(&binding.device_id);
            }
            user_empty = devices.is_empty();
        }
        if user_empty {
            self.users
                .remove_if(&binding.user_id, |_, devices| devices.is_empty());
        }
        Some(binding)
    }

    /// All live device connections for a user, for fan-out.
    pub fn get_connections(&self, uid: &str) -> Vec<Connection> {
        self.users
            .get(uid)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_connection(&self, uid: &str, device_id: &str) -> Option<Connection> {
        self.users.get(uid)?.get(device_id).cloned()
    }

    /// Resolve the user bound to a connection id (encryption-key lookup).
    pub fn user_by_conn(&self, conn_id: u64) -> Option<String> {
        self.bindings.get(&conn_id).map(|b| b.user_id.clone())
    }
}
