//! Event router: inbound decoded messages -> handlers.
//!
//! Each dispatch runs on its own task so a slow store call in one handler
//! never blocks the connection's read loop or other messages. Unknown event
//! kinds are logged and dropped; handler errors are logged and affect
//! nothing else.

use crate::handlers;
use crate::message::{EventKind, Message};
use crate::registry::Connection;
use crate::state::AppState;

pub fn dispatch(state: &AppState, conn: &Connection, msg: Message) {
    let Some(kind) = EventKind::from_code(&msg.event_id) else {
        tracing::warn!(event_id = %msg.event_id, "Unknown event");
        return;
    };

    let state = state.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let result = match kind {
            EventKind::Login => handlers::login::handle(&state, &conn, msg).await,
            EventKind::PrivateMessage => handlers::private_message::handle(&state, &conn, msg).await,
            EventKind::Ack => handlers::ack::handle(&state, &conn, msg).await,
            EventKind::Ping => handlers::ping::handle(&state, &conn, msg).await,
            EventKind::CreateGroup => handlers::group::handle_create(&state, &conn, msg).await,
            EventKind::JoinGroup => handlers::group::handle_join(&state, &conn, msg).await,
            EventKind::DismissGroup => handlers::group::handle_dismiss(&state, &conn, msg).await,
            EventKind::GroupMessage => handlers::group::handle_group_message(&state, &conn, msg).await,
            EventKind::LeaveGroup => handlers::group::handle_leave(&state, &conn, msg).await,
        };
        if let Err(e) = result {
            tracing::error!(event = kind.code(), error = %e, "Error handling event");
        }
    });
}
