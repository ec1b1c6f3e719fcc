use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
    routing::get,
    Json, Router,
};

use crate::error::VmError;
use crate::storage::CreateDiskParams;

use super::{created_response, parse_id, respond, vm_error_response, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/disks", get(list_disks).post(create_disk))
        .route("/disks/{id}", get(get_disk).delete(delete_disk))
}

async fn list_disks(State(state): State<Arc<AppState>>) -> Response {
    respond(state.disks.list().await)
}

async fn create_disk(
    State(state): State<Arc<AppState>>,
    Json(params): Json<CreateDiskParams>,
) -> Response {
    match state.disks.create(params).await {
        Ok(disk) => created_response(disk),
        Err(e) => vm_error_response(e),
    }
}

async fn get_disk(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::disk_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(state.disks.info(id).await)
}

async fn delete_disk(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::disk_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(
        state
            .disks
            .delete(id)
            .await
            .map(|()| serde_json::json!({ "deleted": id })),
    )
}
