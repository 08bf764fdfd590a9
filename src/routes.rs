use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the axum router: the WebSocket endpoint is the whole surface.
pub fn build_router(state: AppState) -> Router {
    Router::new().route("/", get(ws::ws_handler)).with_state(state)
}
