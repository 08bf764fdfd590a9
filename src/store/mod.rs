//! Shared store client: the only coordination mechanism between instances.
//!
//! A thin capability wrapper over key/value, hash, set, list, stream, and
//! pub/sub operations. The store is trusted for atomicity of single-key
//! operations; nothing here spans keys transactionally.
//!
//! Production wires [`redis::RedisStore`]; tests run against
//! [`memory::MemoryStore`].

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One record read from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    // --- key/value ---
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Enumerate keys matching a glob pattern (`prefix:*`).
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;

    // --- hash ---
    async fn hash_put(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_del(&self, key: &str, fields: &[String]) -> Result<()>;
    async fn hash_entries(&self, key: &str) -> Result<Vec<(String, String)>>;
    async fn hash_keys(&self, key: &str) -> Result<Vec<String>>;

    // --- set ---
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    // --- list (FIFO via push-back / range / trim) ---
    async fn list_push_back(&self, key: &str, value: &str) -> Result<()>;
    async fn list_len(&self, key: &str) -> Result<usize>;
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    // --- stream ---
    /// Append a single-field record; returns the assigned record id.
    async fn stream_add(&self, key: &str, field: &str, value: &str) -> Result<String>;
    /// Blocking read of records after `after_id` (`"$"` = only records that
    /// arrive from now on). Returns empty on timeout.
    async fn stream_read(
        &self,
        key: &str,
        after_id: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;
    async fn stream_del(&self, key: &str, id: &str) -> Result<()>;

    // --- pub/sub (advisory broadcast only) ---
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>>;
}

/// Store key schema. Everything the cluster shares lives under these keys.
pub mod keys {
    /// Cluster-wide advisory broadcast channel.
    pub const BROADCAST_CHANNEL: &str = "im-cluster-topic";

    pub const HEARTBEAT_PREFIX: &str = "server_heartbeat:";
    pub const INSTANCE_SESSIONS_PREFIX: &str = "instance_sessions:";
    pub const STREAM_PREFIX: &str = "im:stream:instance:";

    /// `token_list:{uid}` -> current valid token.
    pub fn token(uid: &str) -> String {
        format!("token_list:{uid}")
    }

    /// `session:{uid}` hash: deviceId -> serialized session record.
    pub fn session(uid: &str) -> String {
        format!("session:{uid}")
    }

    /// `ack:msg:{uid}` hash: server timestamp -> serialized message.
    pub fn ack(uid: &str) -> String {
        format!("ack:msg:{uid}")
    }

    /// `offline:msg:{uid}` list: FIFO serialized messages.
    pub fn offline(uid: &str) -> String {
        format!("offline:msg:{uid}")
    }

    /// `group:info:{groupId}` hash: userId -> role.
    pub fn group_info(group_id: &str) -> String {
        format!("group:info:{group_id}")
    }

    /// `user:groups:{userId}` set: group ids.
    pub fn user_groups(uid: &str) -> String {
        format!("user:groups:{uid}")
    }

    /// `server_heartbeat:{instanceId}` TTL string.
    pub fn heartbeat(instance_id: &str) -> String {
        format!("{HEARTBEAT_PREFIX}{instance_id}")
    }

    /// `instance_sessions:{instanceId}` set: "uid:deviceId" pairs.
    pub fn instance_sessions(instance_id: &str) -> String {
        format!("{INSTANCE_SESSIONS_PREFIX}{instance_id}")
    }

    /// `im:stream:instance:{instanceId}` private delivery stream.
    pub fn instance_stream(instance_id: &str) -> String {
        format!("{STREAM_PREFIX}{instance_id}")
    }
}
