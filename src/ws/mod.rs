pub mod actor;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;

use crate::state::AppState;

/// WebSocket upgrade endpoint. Authentication happens in-band via the Login
/// event, not at upgrade time.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| actor::run_connection(socket, state))
}
