use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use loam_core::db::{Database, Schema};
use loam_core::models::{ChangeRecord, ChangesPull, EntitySnapshot, ReplicaId};
use loam_core::sync::protocol::ApplyNewChangesResponse;
use loam_core::SyncHub;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    hub: SyncHub,
}

impl AppState {
    pub async fn from_config(config: Arc<AppConfig>) -> loam_core::Result<Self> {
        let db = Database::open(&config.db_path, Schema::Server).await?;
        let hub = SyncHub::new(db)?.with_max_batch(config.max_batch);
        Ok(Self { config, hub })
    }

    #[cfg(test)]
    pub const fn with_hub(config: Arc<AppConfig>, hub: SyncHub) -> Self {
        Self { config, hub }
    }
}

pub fn app_router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/{tenant}/sync", get(sync_socket))
        .route("/{tenant}/changes", get(get_changes).post(apply_changes))
        .route("/{tenant}/snapshots/{table}/{id}", get(get_snapshot))
        .route("/{tenant}/compact", post(compact));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1/tenants", tenant_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn sync_socket(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_socket(state.hub, tenant, socket))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyChangesRequest {
    replica_id: ReplicaId,
    changes: Vec<ChangeRecord>,
    #[serde(default)]
    base_revision: Option<u64>,
}

async fn apply_changes(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(payload): Json<ApplyChangesRequest>,
) -> Result<Json<ApplyNewChangesResponse>, AppError> {
    let response = state
        .hub
        .apply_new_changes(
            &tenant,
            payload.replica_id,
            payload.changes,
            payload.base_revision,
        )
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    since: Option<u64>,
    replica: Option<ReplicaId>,
}

async fn get_changes(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesPull>, AppError> {
    let pull = state
        .hub
        .get_changes(&tenant, query.since, query.replica)
        .await?;
    Ok(Json(pull))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path((tenant, table, id)): Path<(String, String, String)>,
) -> Result<Json<EntitySnapshot>, AppError> {
    state
        .hub
        .snapshot(&tenant, &table, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("{table}/{id}")))
}

#[derive(Debug, Serialize)]
struct CompactResponse {
    entities: usize,
    changes: u64,
}

async fn compact(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<CompactResponse>, AppError> {
    let report = state.hub.compact(&tenant).await?;
    tracing::info!(
        tenant,
        entities = report.entities,
        changes = report.changes,
        "Compacted change log"
    );
    Ok(Json(CompactResponse {
        entities: report.entities,
        changes: report.changes,
    }))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use loam_core::models::document;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    async fn test_router() -> Router {
        let config = Arc::new(AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            db_path: PathBuf::from(":memory:"),
            max_batch: 2,
        });
        let hub = SyncHub::in_memory().await.unwrap().with_max_batch(2);
        app_router(AppState::with_hub(config, hub))
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn push_body(changes: Vec<ChangeRecord>, base_revision: Option<u64>) -> Value {
        json!({
            "replicaId": ReplicaId::new(),
            "changes": changes,
            "baseRevision": base_revision,
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_reports_ok() {
        let router = test_router().await;
        let (status, body) = send(&router, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pushed_changes_are_pulled_and_snapshotted() {
        let router = test_router().await;
        let create = ChangeRecord::create("notes", "n1", document(json!({"title": "A"})));

        let (status, body) = send(
            &router,
            Method::POST,
            "/v1/tenants/acme/changes",
            Some(push_body(vec![create], None)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "success", "newRevision": 1}));

        let (status, body) = send(&router, Method::GET, "/v1/tenants/acme/changes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["serverRevision"], 1);
        assert_eq!(body["changes"].as_array().unwrap().len(), 1);

        let (_, body) = send(&router, Method::GET, "/v1/tenants/acme/changes?since=1", None).await;
        assert_eq!(body["changes"], json!([]));

        let (status, body) = send(
            &router,
            Method::GET,
            "/v1/tenants/acme/snapshots/notes/n1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["doc"], json!({"title": "A"}));
        assert_eq!(body["isDeleted"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_push_is_reported() {
        let router = test_router().await;
        let first = ChangeRecord::create("notes", "n1", document(json!({"title": "A"})));
        send(
            &router,
            Method::POST,
            "/v1/tenants/acme/changes",
            Some(push_body(vec![first], None)),
        )
        .await;

        let second = ChangeRecord::create("notes", "n2", document(json!({"title": "B"})));
        let (status, body) = send(
            &router,
            Method::POST,
            "/v1/tenants/acme/changes",
            Some(push_body(vec![second], None)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "stale_changes"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_bad_input() {
        let router = test_router().await;

        let (status, _) = send(&router, Method::GET, "/v1/tenants/no%20spaces/changes", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let changes = ["a", "b", "c"]
            .into_iter()
            .map(|id| ChangeRecord::create("notes", id, document(json!({}))))
            .collect();
        let (status, body) = send(
            &router,
            Method::POST,
            "/v1/tenants/acme/changes",
            Some(push_body(changes, None)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "batch_too_large", "maxBatch": 2}));

        let (status, _) = send(
            &router,
            Method::GET,
            "/v1/tenants/acme/snapshots/notes/missing",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compaction_runs_per_tenant() {
        let router = test_router().await;
        let (status, body) = send(&router, Method::POST, "/v1/tenants/acme/compact", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"entities": 0, "changes": 0}));
    }
}
