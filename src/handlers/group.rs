//! Group lifecycle and group-message fan-out.
//!
//! Structural state is two store mappings: `group:info:{groupId}` (member ->
//! role) and the reverse `user:groups:{userId}` set. Admin operations mutate
//! those synchronously, answer the requester, and then broadcast a
//! best-effort system notification through the same fan-out as ordinary
//! group messages.
//!
//! Fan-out re-wraps the group message as one private message per member, in
//! concurrent batches; each copy then takes the full private-message routing
//! path (local / forward / offline).

use serde_json::json;

use crate::error::Result;
use crate::handlers::private_message;
use crate::message::{now_millis, EventKind, GroupMember, Message, SYSTEM_UID};
use crate::registry::Connection;
use crate::state::AppState;
use crate::store::keys;

/// Members handled per fan-out task.
const FANOUT_BATCH: usize = 500;

/// Role value marking a group admin/owner.
const ROLE_ADMIN: &str = "1";

pub async fn handle_group_message(state: &AppState, _conn: &Connection, msg: Message) -> Result<()> {
    let group_id = msg.group_id.clone();
    if group_id.is_empty() {
        tracing::warn!(from = %msg.from_uid, "Group message missing groupId");
        return Ok(());
    }

    // Snapshot the membership before any batch runs; later structural
    // changes do not affect this fan-out.
    let member_ids = state.store.hash_keys(&keys::group_info(&group_id)).await?;
    if member_ids.is_empty() {
        tracing::warn!(group = %group_id, "Group message to unknown or empty group");
        return Ok(());
    }

    tracing::info!(
        group = %group_id,
        members = member_ids.len(),
        "Fanning out group message"
    );

    for chunk in member_ids.chunks(FANOUT_BATCH) {
        let state = state.clone();
        let original = msg.clone();
        let batch: Vec<String> = chunk.to_vec();
        tokio::spawn(async move {
            process_batch(&state, &original, batch).await;
        });
    }
    Ok(())
}

/// Deliver one member batch. A failure for one member is logged and the rest
/// of the batch continues.
async fn process_batch(state: &AppState, original: &Message, batch: Vec<String>) {
    for member_id in batch {
        let copy = Message {
            event_id: EventKind::PrivateMessage.code().to_string(),
            from_uid: original.from_uid.clone(),
            to_uid: member_id.clone(),
            token: original.token.clone(),
            data_body: original.data_body.clone(),
            s_timest: now_millis().to_string(),
            is_cache: original.is_cache.clone(),
            is_group: original.is_group.clone(),
            group_id: original.group_id.clone(),
            ..Default::default()
        };
        if let Err(e) = private_message::route(state, copy).await {
            tracing::error!(member = %member_id, error = %e, "Failed to send group message to member");
        }
    }
}

pub async fn handle_create(state: &AppState, conn: &Connection, msg: Message) -> Result<()> {
    let from_uid = msg.from_uid.clone();

    let members: Vec<GroupMember> = serde_json::from_str(&msg.data_body).unwrap_or_default();
    if members.is_empty() {
        tracing::warn!(user = %from_uid, "Create group failed: empty member list");
        return respond(state, conn, EventKind::CreateGroup, &from_uid, "Fail: Empty members").await;
    }

    let group_id = if msg.group_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        msg.group_id.clone()
    };

    let group_key = keys::group_info(&group_id);
    for member in &members {
        state
            .store
            .hash_put(&group_key, &member.user_id, &member.is_admin)
            .await?;
        state
            .store
            .set_add(&keys::user_groups(&member.user_id), &group_id)
            .await?;
    }

    tracing::info!(
        group = %group_id,
        creator = %from_uid,
        members = members.len(),
        "Group created"
    );

    let body = json!({ "groupId": group_id }).to_string();
    respond(state, conn, EventKind::CreateGroup, &from_uid, &body).await?;

    let notice = system_notification(
        &group_id,
        json!({
            "type": "GROUP_CREATED",
            "groupId": group_id,
            "creator": from_uid,
            "timestamp": now_millis(),
        })
        .to_string(),
    );
    handle_group_message(state, conn, notice).await
}

pub async fn handle_join(state: &AppState, conn: &Connection, msg: Message) -> Result<()> {
    let from_uid = msg.from_uid.clone();
    let group_id = msg.group_id.clone();

    if group_id.is_empty() {
        tracing::warn!(user = %from_uid, "Join group failed: missing groupId");
        return respond(state, conn, EventKind::JoinGroup, &from_uid, "Fail: Missing GroupId").await;
    }
    if !state.store.exists(&keys::group_info(&group_id)).await? {
        tracing::warn!(group = %group_id, "Join group failed: group not found");
        return respond(state, conn, EventKind::JoinGroup, &from_uid, "Fail: Group Not Found").await;
    }

    let new_members: Vec<GroupMember> = serde_json::from_str(&msg.data_body).unwrap_or_default();
    if new_members.is_empty() {
        tracing::warn!(user = %from_uid, "Join group failed: empty member list");
        return respond(state, conn, EventKind::JoinGroup, &from_uid, "Fail: Empty members").await;
    }

    let group_key = keys::group_info(&group_id);
    for member in &new_members {
        state
            .store
            .hash_put(&group_key, &member.user_id, &member.is_admin)
            .await?;
        state
            .store
            .set_add(&keys::user_groups(&member.user_id), &group_id)
            .await?;
    }
    tracing::info!(group = %group_id, joined = new_members.len(), "Users joined group");

    respond(state, conn, EventKind::JoinGroup, &from_uid, "Success").await?;

    let notice = system_notification(
        &group_id,
        json!({
            "type": "MEMBER_JOINED",
            "groupId": group_id,
            "inviter": from_uid,
            "newMembers": &new_members,
            "timestamp": now_millis(),
        })
        .to_string(),
    );
    handle_group_message(state, conn, notice).await
}

pub async fn handle_leave(state: &AppState, conn: &Connection, msg: Message) -> Result<()> {
    let from_uid = msg.from_uid.clone();
    let group_id = msg.group_id.clone();

    if group_id.is_empty() {
        tracing::warn!(user = %from_uid, "Leave group failed: missing groupId");
        return respond(state, conn, EventKind::LeaveGroup, &from_uid, "Fail: Missing GroupId").await;
    }
    let group_key = keys::group_info(&group_id);
    if !state.store.exists(&group_key).await? {
        tracing::warn!(group = %group_id, "Leave group failed: group not found");
        return respond(state, conn, EventKind::LeaveGroup, &from_uid, "Fail: Group Not Found").await;
    }

    let leaving: Vec<GroupMember> = serde_json::from_str(&msg.data_body).unwrap_or_default();
    if leaving.is_empty() {
        tracing::warn!(user = %from_uid, "Leave group failed: empty member list");
        return respond(state, conn, EventKind::LeaveGroup, &from_uid, "Fail: Empty members").await;
    }

    // Notify while the departing members are still in the membership
    // snapshot, then remove them.
    let notice = system_notification(
        &group_id,
        json!({
            "type": "MEMBER_LEFT",
            "groupId": group_id,
            "operator": from_uid,
            "leftMembers": &leaving,
            "timestamp": now_millis(),
        })
        .to_string(),
    );
    handle_group_message(state, conn, notice).await?;

    for member in &leaving {
        state
            .store
            .hash_del(&group_key, &[member.user_id.clone()])
            .await?;
        state
            .store
            .set_remove(&keys::user_groups(&member.user_id), &group_id)
            .await?;
    }
    tracing::info!(group = %group_id, left = leaving.len(), "Users left group");

    respond(state, conn, EventKind::LeaveGroup, &from_uid, "Success").await
}

pub async fn handle_dismiss(state: &AppState, conn: &Connection, msg: Message) -> Result<()> {
    let from_uid = msg.from_uid.clone();
    let group_id = msg.group_id.clone();

    if group_id.is_empty() {
        tracing::warn!(user = %from_uid, "Dismiss group failed: missing groupId");
        return respond(state, conn, EventKind::DismissGroup, &from_uid, "Fail: Missing GroupId")
            .await;
    }

    let group_key = keys::group_info(&group_id);
    match state.store.hash_get(&group_key, &from_uid).await? {
        None => {
            return respond(state, conn, EventKind::DismissGroup, &from_uid, "Fail: Not a member")
                .await;
        }
        Some(role) if role != ROLE_ADMIN => {
            return respond(
                state,
                conn,
                EventKind::DismissGroup,
                &from_uid,
                "Fail: Permission Denied",
            )
            .await;
        }
        Some(_) => {}
    }

    // The fan-out snapshots the member list before we delete anything
    // (delete-after-notify ordering).
    let notice = Message {
        event_id: EventKind::GroupMessage.code().to_string(),
        from_uid: from_uid.clone(),
        group_id: group_id.clone(),
        is_group: "1".to_string(),
        data_body: "Group has been dismissed by admin.".to_string(),
        s_timest: now_millis().to_string(),
        is_cache: "0".to_string(),
        ..Default::default()
    };
    handle_group_message(state, conn, notice).await?;

    let member_ids = state.store.hash_keys(&group_key).await?;
    for member_id in &member_ids {
        state
            .store
            .set_remove(&keys::user_groups(member_id), &group_id)
            .await?;
    }
    state.store.del(&group_key).await?;

    tracing::info!(group = %group_id, by = %from_uid, "Group dismissed");
    respond(state, conn, EventKind::DismissGroup, &from_uid, "Success").await
}

fn system_notification(group_id: &str, body: String) -> Message {
    Message {
        event_id: EventKind::GroupMessage.code().to_string(),
        from_uid: SYSTEM_UID.to_string(),
        group_id: group_id.to_string(),
        is_group: "1".to_string(),
        data_body: body,
        s_timest: now_millis().to_string(),
        is_cache: "0".to_string(),
        ..Default::default()
    }
}

async fn respond(
    state: &AppState,
    conn: &Connection,
    event: EventKind,
    to_uid: &str,
    body: &str,
) -> Result<()> {
    state
        .delivery
        .send_response(conn, event, Some(to_uid), body)
        .await
}
