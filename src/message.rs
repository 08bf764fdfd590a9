//! Wire message model and event-kind catalog.
//!
//! Every frame exchanged with a client (and forwarded between instances) is
//! one JSON-encoded `Message`. Field names follow the wire schema exactly;
//! flags are string-typed ("0"/"1") on the wire.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sender id used for server-originated responses and notifications.
pub const SYSTEM_UID: &str = "SYSTEM";

/// Event kinds understood by the router, keyed by their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Login,
    PrivateMessage,
    Ack,
    Ping,
    CreateGroup,
    JoinGroup,
    DismissGroup,
    GroupMessage,
    LeaveGroup,
}

impl EventKind {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "1000000" => Some(Self::Login),
            "1000001" => Some(Self::PrivateMessage),
            "1000002" => Some(Self::Ack),
            "9000000" => Some(Self::Ping),
            "5000001" => Some(Self::CreateGroup),
            "5000002" => Some(Self::JoinGroup),
            "5000003" => Some(Self::DismissGroup),
            "5000004" => Some(Self::GroupMessage),
            "5000005" => Some(Self::LeaveGroup),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Login => "1000000",
            Self::PrivateMessage => "1000001",
            Self::Ack => "1000002",
            Self::Ping => "9000000",
            Self::CreateGroup => "5000001",
            Self::JoinGroup => "5000002",
            Self::DismissGroup => "5000003",
            Self::GroupMessage => "5000004",
            Self::LeaveGroup => "5000005",
        }
    }
}

/// One typed event between client and server, or between instances.
///
/// Immutable once sent; persisted only in serialized form inside store
/// structures (ack cache, offline queue, instance streams).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "fromUid")]
    pub from_uid: String,
    #[serde(rename = "toUid")]
    pub to_uid: String,
    pub token: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Client-side timestamp (millis, set by the sender).
    #[serde(rename = "cTimest")]
    pub c_timest: String,
    /// Server-side timestamp (millis, stamped at decode).
    #[serde(rename = "sTimest")]
    pub s_timest: String,
    /// Opaque payload, free-form string (usually JSON).
    #[serde(rename = "dataBody")]
    pub data_body: String,
    /// "1" for group messages, "0" for personal.
    #[serde(rename = "isGroup")]
    pub is_group: String,
    #[serde(rename = "groupId")]
    pub group_id: String,
    /// "1" if the message must be stored offline / retried until acked.
    #[serde(rename = "isCache")]
    pub is_cache: String,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            event_id: String::new(),
            from_uid: String::new(),
            to_uid: String::new(),
            token: String::new(),
            device_id: String::new(),
            kind: String::new(),
            c_timest: String::new(),
            s_timest: String::new(),
            data_body: String::new(),
            is_group: "0".to_string(),
            group_id: String::new(),
            is_cache: "1".to_string(),
        }
    }
}

impl Message {
    /// Whether this message participates in the ack/offline reliability path.
    pub fn is_reliable(&self) -> bool {
        self.is_cache == "1"
    }
}

/// Durable claim that a (user, device) is logically connected to an instance.
///
/// Stored as JSON in the `session:{uid}` hash, keyed by device id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "connId")]
    pub conn_id: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "loginTime")]
    pub login_time: u64,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
}

/// One entry of the member list carried by group create/join/leave requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    #[serde(rename = "userId")]
    pub user_id: String,
    /// "0": member, "1": admin/owner.
    #[serde(rename = "isAdmin")]
    pub is_admin: String,
}

/// Wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Cheap structural check used to decide whether an inbound frame needs
/// decryption before JSON parsing.
pub fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < 2 {
        return false;
    }
    let first = trimmed.as_bytes()[0];
    let last = trimmed.as_bytes()[trimmed.len() - 1];
    (first == b'{' && last == b'}') || (first == b'[' && last == b']')
}
