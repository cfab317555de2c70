use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;

use crate::hub::{self, Hub};

/// Longest user id accepted in the connect path.
const MAX_USER_ID_LEN: usize = 128;

pub struct AppState {
    pub hub: Arc<Hub>,
    pub max_message_size: usize,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/ws/{user_id}", get(user_ws_upgrade))
        .with_state(state)
}

/// GET /healthz
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn valid_user_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_USER_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

/// GET /ws/{user_id}
async fn user_ws_upgrade(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !valid_user_id(&user_id) {
        return (StatusCode::BAD_REQUEST, "Invalid user id").into_response();
    }
    let hub = Arc::clone(&state.hub);
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| hub::handle_user_ws(socket, user_id, hub))
}
