use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database = if state.pool.get().is_ok() { "ok" } else { "unavailable" };
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "database": database,
            "websocket_connections": state.events.connection_count(),
        })),
    )
}
