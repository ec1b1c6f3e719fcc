use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;

use crate::error::VmError;
use crate::vm::{CreateParams, ResourceUpdate};

use super::{created_response, parse_id, respond, vm_error_response, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/vms", get(list_vms).post(create_vm))
        .route("/vms/{id}", get(get_vm).delete(delete_vm))
        .route("/vms/{id}/start", post(start_vm))
        .route("/vms/{id}/stop", post(stop_vm))
        .route("/vms/{id}/resources", patch(update_resources))
        .route("/vms/{id}/disks/attach", post(attach_disk))
        .route("/vms/{id}/disks/detach", post(detach_disk))
        .route("/vms/{id}/iso/mount", post(mount_iso))
        .route("/vms/{id}/iso/unmount", post(unmount_iso))
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateRequest {
    name: String,
    cpus: Option<u32>,
    memory: Option<u32>,
}

#[derive(Deserialize)]
struct ResourcesRequest {
    cpus: Option<u32>,
    memory: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskPathRequest {
    disk_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsoPathRequest {
    iso_path: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_vms(State(state): State<Arc<AppState>>) -> Response {
    respond(state.vm_manager.list().await)
}

async fn create_vm(State(state): State<Arc<AppState>>, Json(req): Json<CreateRequest>) -> Response {
    let params = CreateParams {
        name: req.name,
        cpus: req.cpus,
        memory_mb: req.memory,
    };
    match state.vm_manager.create(params).await {
        Ok(view) => created_response(view),
        Err(e) => vm_error_response(e),
    }
}

async fn get_vm(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(state.vm_manager.get(id).await)
}

async fn delete_vm(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(
        state
            .vm_manager
            .delete(id)
            .await
            .map(|()| serde_json::json!({ "deleted": id })),
    )
}

async fn start_vm(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(state.vm_manager.start(id).await)
}

async fn stop_vm(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(state.vm_manager.stop(id).await)
}

async fn update_resources(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ResourcesRequest>,
) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let update = ResourceUpdate {
        cpus: req.cpus,
        memory_mb: req.memory,
    };
    respond(state.vm_manager.update_resources(id, update).await)
}

async fn attach_disk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<DiskPathRequest>,
) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(
        state
            .attachments
            .attach(id, &req.disk_path)
            .await
            .map(|disks| serde_json::json!({ "id": id, "disks": disks })),
    )
}

async fn detach_disk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<DiskPathRequest>,
) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(
        state
            .attachments
            .detach(id, &req.disk_path)
            .await
            .map(|disks| serde_json::json!({ "id": id, "disks": disks })),
    )
}

async fn mount_iso(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<IsoPathRequest>,
) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(state.attachments.mount(id, &req.iso_path).await)
}

async fn unmount_iso(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::vm_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(state.attachments.unmount(id).await)
}
