//! /status handler — process health summary.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::ApiState;

#[derive(Serialize)]
pub struct StatusResponse {
    pub success: bool,
    pub store_ok: bool,
    pub queues: QueueDepths,
    pub rooms: usize,
}

#[derive(Serialize)]
pub struct QueueDepths {
    pub compile: u64,
    pub deploy: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let store_ok = state.store.get("health-probe").await.is_ok();
    let compile = state.queue.depth("compile").await.unwrap_or(0);
    let deploy = state.queue.depth("deploy").await.unwrap_or(0);

    Json(StatusResponse {
        success: true,
        store_ok,
        queues: QueueDepths { compile, deploy },
        rooms: state.hub.room_count(),
    })
}
