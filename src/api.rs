//! HTTP API over the orchestrator.
//!
//! Mutating endpoints return as soon as the inventory has accepted the
//! request (`202 Accepted`); clients poll `GET /vms/{name}` for progress.
//! Every error body has the shape `{field, reason}`.

use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ProvError;
use crate::model::{ProvisionRequest, VmRecord};
use crate::orchestrator::{Accepted, Orchestrator, Submission};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub field: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, field: &str, reason: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                field: field.to_string(),
                reason: reason.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ProvError> for ApiError {
    fn from(e: ProvError) -> Self {
        match e {
            ProvError::Validation(v) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, &v.field, v.reason),
            ProvError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, "name", e.to_string()),
            ProvError::InvalidState { .. } => Self::new(StatusCode::CONFLICT, "state", e.to_string()),
            ProvError::Busy { .. } => Self::new(StatusCode::CONFLICT, "name", e.to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "server", other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "body", rejection.body_text())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StopParams {
    #[serde(default)]
    pub force: bool,
}

pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/vms", get(list_vms).post(create_vm))
        .route("/vms/{name}", get(get_vm).delete(delete_vm))
        .route("/vms/{name}/stop", post(stop_vm))
        .route("/vms/{name}/start", post(start_vm))
        .route("/vms/{name}/cancel", post(cancel_vm))
        .route("/vms/{name}/log", get(vm_log))
        .with_state(orchestrator)
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn serve(
    orchestrator: Orchestrator,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ProvError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ProvError::Io {
            context: format!("binding {addr}"),
            source,
        })?;
    tracing::info!(%addr, "API listening");

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|source| ProvError::Io {
            context: "serving the API".into(),
            source,
        })
}

// -- Handlers --

async fn health() -> &'static str {
    "ok"
}

async fn create_vm(
    State(orchestrator): State<Orchestrator>,
    payload: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let Json(request) = payload?;
    let submission = orchestrator.submit(request).await?;
    let status = match submission {
        Submission::Accepted(_) => StatusCode::ACCEPTED,
        Submission::Existing(_) => StatusCode::OK,
    };
    Ok((status, Json(Accepted::from(submission.record()))))
}

async fn list_vms(State(orchestrator): State<Orchestrator>) -> Json<Vec<VmRecord>> {
    Json(orchestrator.list())
}

async fn get_vm(
    State(orchestrator): State<Orchestrator>,
    Path(name): Path<String>,
) -> Result<Json<VmRecord>, ApiError> {
    orchestrator
        .get(&name)
        .map(Json)
        .ok_or_else(|| ProvError::NotFound { name }.into())
}

async fn stop_vm(
    State(orchestrator): State<Orchestrator>,
    Path(name): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let record = orchestrator.stop(&name, params.force)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn start_vm(
    State(orchestrator): State<Orchestrator>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let record = orchestrator.start(&name)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn cancel_vm(
    State(orchestrator): State<Orchestrator>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let record = orchestrator.cancel(&name)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn delete_vm(
    State(orchestrator): State<Orchestrator>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    let record = orchestrator.delete(&name)?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn vm_log(
    State(orchestrator): State<Orchestrator>,
    Path(name): Path<String>,
) -> Result<String, ApiError> {
    if orchestrator.get(&name).is_none() {
        return Err(ProvError::NotFound { name }.into());
    }
    let Some(path) = orchestrator.latest_log(&name) else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "log",
            format!("no logs recorded for '{name}' yet"),
        ));
    };
    tokio::fs::read_to_string(&path).await.map_err(|source| {
        ProvError::Io {
            context: format!("reading {}", path.display()),
            source,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::backend::memory::MemoryBackend;
    use crate::config::LimitsConfig;
    use crate::image::ImageProvisioner;
    use crate::inventory::InventoryStore;
    use crate::orchestrator::RetryPolicy;
    use crate::validate::RequestValidator;
    use crate::vm_state::VmState;

    use super::*;

    fn test_orchestrator(dir: &std::path::Path) -> Orchestrator {
        let store = InventoryStore::open(&dir.join("state").join("inventory")).unwrap();
        Orchestrator::new(
            Arc::new(store),
            Arc::new(MemoryBackend::new()),
            ImageProvisioner::new(dir.join("images")),
            RequestValidator::new(LimitsConfig::default()),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                call_timeout: Duration::from_secs(5),
            },
            dir.join("state"),
        )
    }

    fn vm1_body() -> String {
        r#"{"name":"vm1","memoryMiB":2048,"vcpuCount":2,"diskSizeGiB":20,"networkMode":"Bridged"}"#
            .to_string()
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn empty(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let resp = router(test_orchestrator(dir.path()))
            .oneshot(empty("GET", "/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_returns_accepted_then_runs() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let app = router(orchestrator.clone());

        let resp = app.clone().oneshot(post_json("/vms", vm1_body())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = json(resp).await;
        assert_eq!(body["name"], "vm1");
        assert_eq!(body["state"], "Pending");

        orchestrator
            .wait_settled("vm1", Duration::from_secs(5))
            .await
            .unwrap();
        let resp = app.oneshot(empty("GET", "/vms/vm1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let record: VmRecord = json(resp).await;
        assert_eq!(record.state, VmState::Running);
        assert_eq!(record.attempt, 1);
    }

    #[tokio::test]
    async fn duplicate_submit_is_ok_not_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_orchestrator(dir.path()));
        let first = app.clone().oneshot(post_json("/vms", vm1_body())).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let second = app.oneshot(post_json("/vms", vm1_body())).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_request_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_orchestrator(dir.path()));
        let body =
            r#"{"name":"vm1","memoryMiB":0,"vcpuCount":2,"diskSizeGiB":20,"networkMode":"NAT"}"#;
        let resp = app.oneshot(post_json("/vms", body.into())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let err: ErrorBody = json(resp).await;
        assert_eq!(err.field, "memoryMiB");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_orchestrator(dir.path()));
        let resp = app
            .oneshot(post_json("/vms", r#"{"name": 5}"#.into()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err: ErrorBody = json(resp).await;
        assert_eq!(err.field, "body");
    }

    #[tokio::test]
    async fn unknown_vm_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_orchestrator(dir.path()));
        for req in [
            empty("GET", "/vms/ghost"),
            empty("POST", "/vms/ghost/stop"),
            empty("DELETE", "/vms/ghost"),
            empty("GET", "/vms/ghost/log"),
        ] {
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn lifecycle_conflicts_are_409() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let app = router(orchestrator.clone());
        app.clone().oneshot(post_json("/vms", vm1_body())).await.unwrap();
        orchestrator
            .wait_settled("vm1", Duration::from_secs(5))
            .await
            .unwrap();

        // Running VMs cannot be started or cancelled.
        let resp = app.clone().oneshot(empty("POST", "/vms/vm1/start")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let err: ErrorBody = json(resp).await;
        assert_eq!(err.field, "state");

        let resp = app.oneshot(empty("POST", "/vms/vm1/cancel")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn stop_start_delete_round() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let app = router(orchestrator.clone());
        app.clone().oneshot(post_json("/vms", vm1_body())).await.unwrap();
        let settle = || orchestrator.wait_settled("vm1", Duration::from_secs(5));
        settle().await.unwrap();

        let resp = app
            .clone()
            .oneshot(empty("POST", "/vms/vm1/stop?force=true"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(settle().await.unwrap().unwrap().state, VmState::Stopped);

        let resp = app.clone().oneshot(empty("POST", "/vms/vm1/start")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(settle().await.unwrap().unwrap().state, VmState::Running);

        let resp = app.clone().oneshot(empty("GET", "/vms/vm1/log")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.clone().oneshot(empty("DELETE", "/vms/vm1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(settle().await.unwrap().is_none());

        let resp = app.oneshot(empty("GET", "/vms")).await.unwrap();
        let records: Vec<VmRecord> = json(resp).await;
        assert!(records.is_empty());
    }
}
