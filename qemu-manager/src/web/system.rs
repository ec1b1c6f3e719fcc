use std::sync::Arc;

use axum::{extract::State, response::Response, routing::get, Router};

use super::{ok_response, vm_error_response, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let vms = match state.vm_manager.list().await {
        Ok(vms) => vms,
        Err(e) => return vm_error_response(e),
    };
    let running = vms.iter().filter(|v| v.vm.is_running()).count();

    ok_response(serde_json::json!({
        "status": "healthy",
        "vms": vms.len(),
        "running": running,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
