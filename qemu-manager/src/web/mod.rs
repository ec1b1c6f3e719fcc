pub mod console;
pub mod disks;
pub mod isos;
pub mod system;
pub mod vms;

use std::future::Future;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::VmError;
use crate::storage::{AttachmentTracker, DiskCatalog, IsoCatalog};
use crate::vm::VmManager;

/// Shared state for all handlers, passed via axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub vm_manager: Arc<VmManager>,
    pub attachments: Arc<AttachmentTracker>,
    pub disks: Arc<DiskCatalog>,
    pub isos: Arc<IsoCatalog>,
    pub config: Arc<Config>,
}

/// Response envelope for successful API responses.
#[derive(serde::Serialize)]
pub struct ApiResponse<T: serde::Serialize> {
    pub data: T,
    pub meta: ApiMeta,
}

/// Response envelope for error API responses.
#[derive(serde::Serialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
    pub meta: ApiMeta,
}

#[derive(serde::Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(serde::Serialize)]
pub struct ApiMeta {
    pub request_id: String,
}

impl ApiMeta {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            meta: ApiMeta::new(),
        }
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
            },
            meta: ApiMeta::new(),
        }
    }
}

/// Helper to convert an ApiError into an axum JSON response with appropriate status code.
pub fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ApiError::new(code, message);
    (status, axum::Json(body)).into_response()
}

/// Helper to convert a successful payload into an ApiResponse JSON.
pub fn ok_response<T: serde::Serialize>(data: T) -> Response {
    (StatusCode::OK, axum::Json(ApiResponse::new(data))).into_response()
}

pub fn created_response<T: serde::Serialize>(data: T) -> Response {
    (StatusCode::CREATED, axum::Json(ApiResponse::new(data))).into_response()
}

/// HTTP status for each error kind.
pub fn status_for(err: &VmError) -> StatusCode {
    match err {
        VmError::NotFound { .. } => StatusCode::NOT_FOUND,
        VmError::InvalidState(_) => StatusCode::CONFLICT,
        VmError::SpawnFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        VmError::UpstreamConnectFailure { .. } => StatusCode::BAD_GATEWAY,
        VmError::DuplicateName { .. } => StatusCode::CONFLICT,
        VmError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        VmError::NoFreeConsolePort { .. } => StatusCode::SERVICE_UNAVAILABLE,
        VmError::ImageToolFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        VmError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn vm_error_response(err: VmError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(code = err.code(), error = %err, "request failed");
    }
    error_response(status, err.code(), err.to_string())
}

/// Unwrap a result into an envelope response.
pub fn respond<T: serde::Serialize>(result: Result<T, VmError>) -> Response {
    match result {
        Ok(data) => ok_response(data),
        Err(e) => vm_error_response(e),
    }
}

/// Parse an id path segment. A malformed id cannot name anything, so it is
/// reported as not found.
pub fn parse_id(raw: &str, not_found: fn(String) -> VmError) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| vm_error_response(not_found(raw.to_string())))
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .server
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

/// Build the full axum Router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(vms::routes())
        .merge(disks::routes())
        .merge(isos::routes())
        .merge(console::routes())
        .merge(system::routes())
        .with_state(state.clone());

    Router::new()
        .nest("/api", api)
        .layer(cors_layer(&state.config))
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.bind_addr, state.config.server.port);
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("binding {}: {}", addr, e))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::registry::StateFileRegistry;
    use crate::storage::QemuImg;
    use crate::vm::tests::FakeSupervisor;
    use crate::vm::VmManagerConfig;

    pub(crate) struct TestApp {
        pub router: Router,
        pub state: Arc<AppState>,
        pub registry: Arc<StateFileRegistry>,
    }

    pub(crate) fn test_app(storage_dir: &Path) -> TestApp {
        let registry = Arc::new(StateFileRegistry::in_memory());
        let supervisor = Arc::new(FakeSupervisor::default());
        let vm_manager = Arc::new(VmManager::new(
            VmManagerConfig::default(),
            registry.clone(),
            supervisor,
        ));
        let attachments = Arc::new(AttachmentTracker::new(registry.clone(), vm_manager.locks()));
        let disks = Arc::new(DiskCatalog::new(
            registry.clone(),
            Arc::new(QemuImg::new("false")),
            storage_dir.join("disks"),
            20,
        ));
        let isos = Arc::new(IsoCatalog::new(registry.clone(), storage_dir.join("isos")));
        let state = Arc::new(AppState {
            vm_manager,
            attachments,
            disks,
            isos,
            config: Arc::new(Config::default()),
        });
        TestApp {
            router: build_router(state.clone()),
            state,
            registry,
        }
    }

    /// Send a request and return the status and parsed JSON body.
    pub(crate) async fn call(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[test]
    fn api_response_serialization() {
        let resp = ApiResponse::new(serde_json::json!({"count": 5}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"meta\""));
        assert!(json.contains("\"request_id\""));
    }

    #[test]
    fn api_error_serialization() {
        let err = ApiError::new("NOT_FOUND", "VM x not found");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"error\""));
        assert!(json.contains("NOT_FOUND"));
        assert!(json.contains("VM x not found"));
    }

    #[test]
    fn status_mapping_per_error_kind() {
        let cases = [
            (VmError::vm_not_found("x"), StatusCode::NOT_FOUND),
            (VmError::InvalidState("running".into()), StatusCode::CONFLICT),
            (VmError::SpawnFailure("enoent".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                VmError::UpstreamConnectFailure {
                    port: 5901,
                    reason: "refused".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (VmError::duplicate_name("a"), StatusCode::CONFLICT),
            (VmError::InvalidArgument("cpus".into()), StatusCode::BAD_REQUEST),
            (
                VmError::NoFreeConsolePort { min: 5900, max: 5999 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (VmError::ImageToolFailure("exit 1".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{}", err.code());
        }
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let (status, _) = call(&app.router, Method::GET, "/api/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
