use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
    background_tasks: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Status {
        status: "Available".into(),
        background_tasks: state.orchestrator.pending_deliveries(),
    })
}
