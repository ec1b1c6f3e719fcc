use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
    routing::get,
    Router,
};

use crate::error::VmError;

use super::{parse_id, respond, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/isos", get(list_isos))
        .route("/isos/{id}", get(get_iso).delete(delete_iso))
}

async fn list_isos(State(state): State<Arc<AppState>>) -> Response {
    respond(state.isos.list().await)
}

async fn get_iso(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::iso_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(state.isos.get(id).await)
}

async fn delete_iso(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, VmError::iso_not_found) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    respond(
        state
            .isos
            .delete(id)
            .await
            .map(|()| serde_json::json!({ "deleted": id })),
    )
}
