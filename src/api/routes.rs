//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use crate::api::state::AppState;
use crate::detect::incident::{IncidentFilter, IncidentStatus};
use crate::detect::CheckOrigin;
use crate::diagnosis::FixAction;
use crate::error::SentinelError;
use crate::ingest::DecisionInput;
use crate::storage;
use crate::workflow::{WorkflowQuery, WorkflowStatus, WorkflowTrigger};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/decisions", post(ingest_decision))
        .route("/decisions/bulk", post(ingest_bulk))
        .route("/decisions/stream", get(decision_stream))
        .route("/check/{algorithm}", post(check_algorithm))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/resolve", post(resolve_incident))
        .route("/baseline/{algorithm}", get(get_baseline).post(recompute_baseline))
        .route("/metrics", get(metrics))
        .route("/workflows/history", get(workflow_history))
        .route("/workflows/stats", get(workflow_stats))
        .route("/algorithms", get(list_algorithms))
        .route("/algorithms/{name}", post(add_algorithm).delete(remove_algorithm))
}

// ---------------------------------------------------------------------------
// Envelope and errors
// ---------------------------------------------------------------------------

fn envelope(data: impl Serialize, meta: Value) -> Json<Value> {
    let mut meta = meta;
    if let Value::Object(map) = &mut meta {
        map.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        map.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
    }
    Json(json!({ "data": data, "meta": meta }))
}

/// [`SentinelError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(SentinelError);

impl From<SentinelError> for ApiError {
    fn from(err: SentinelError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            SentinelError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            SentinelError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            SentinelError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            SentinelError::DuplicateIncident { .. } => (StatusCode::CONFLICT, "duplicate_incident"),
            SentinelError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        let body = json!({
            "data": null,
            "meta": { "error": { "kind": kind, "message": self.0.to_string() } }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f).await.map_err(SentinelError::from)?;
    Ok(result?)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "monitored_algorithms": state.sentinel.registry().list().len(),
        }),
        json!({}),
    )
}

async fn ingest_decision(
    State(state): State<AppState>,
    Json(input): Json<DecisionInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let store = state.sentinel.decisions().clone();
    let decision = blocking(move || store.ingest(input)).await?;
    Ok((StatusCode::CREATED, envelope(decision, json!({}))))
}

async fn ingest_bulk(State(state): State<AppState>, Json(inputs): Json<Vec<DecisionInput>>) -> ApiResult {
    let store = state.sentinel.decisions().clone();
    let report = blocking(move || store.ingest_bulk(inputs)).await?;
    let meta = json!({ "indexed": report.indexed, "failed": report.failed });
    Ok(envelope(report, meta))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    algorithm: Option<String>,
    #[serde(default = "default_stream_minutes")]
    minutes: i64,
    #[serde(default = "default_stream_limit")]
    limit: usize,
}

fn default_stream_minutes() -> i64 {
    5
}

fn default_stream_limit() -> usize {
    100
}

async fn decision_stream(State(state): State<AppState>, Query(params): Query<StreamParams>) -> ApiResult {
    let store = state.sentinel.decisions().clone();
    let algorithm = params.algorithm.clone();
    let decisions = blocking(move || store.stream(algorithm.as_deref(), params.minutes, params.limit)).await?;
    let total = decisions.len();
    Ok(envelope(decisions, json!({ "total": total })))
}

async fn check_algorithm(State(state): State<AppState>, Path(algorithm): Path<String>) -> ApiResult {
    let result = state
        .sentinel
        .detector()
        .check_algorithm(&algorithm, CheckOrigin::OnDemand)
        .await?;
    let meta = json!({
        "drift_detected": result.drift_detected(),
        "incident_id": result.incident_id(),
    });
    Ok(envelope(result, meta))
}

#[derive(Debug, Deserialize)]
struct IncidentParams {
    #[serde(default = "default_hours")]
    hours: i64,
    status: Option<String>,
    algorithm: Option<String>,
    #[serde(default = "default_incident_limit")]
    limit: usize,
}

fn default_hours() -> i64 {
    24
}

fn default_incident_limit() -> usize {
    50
}

async fn list_incidents(State(state): State<AppState>, Query(params): Query<IncidentParams>) -> ApiResult {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<IncidentStatus>)
        .transpose()?;
    let filter = IncidentFilter {
        since: Some(storage::hours_before(Utc::now(), params.hours)?),
        status,
        algorithm: params.algorithm,
        limit: params.limit,
    };
    let store = state.sentinel.incidents().clone();
    let page = blocking(move || store.list(&filter)).await?;
    let meta = json!({ "total": page.incidents.len(), "skipped": page.skipped });
    Ok(envelope(page.incidents, meta))
}

async fn get_incident(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let store = state.sentinel.incidents().clone();
    let incident = blocking(move || store.get(&id)).await?;
    Ok(envelope(incident, json!({})))
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    action: String,
    confidence: f64,
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult {
    let action: FixAction = body.action.parse()?;
    let incident = state
        .sentinel
        .resolver()
        .resolve_manual(&id, action, body.confidence)
        .await?;
    Ok(envelope(incident, json!({})))
}

async fn get_baseline(State(state): State<AppState>, Path(algorithm): Path<String>) -> ApiResult {
    let store = state.sentinel.baselines().clone();
    let name = algorithm.clone();
    let baseline = blocking(move || store.get(&name))
        .await?
        .ok_or_else(|| SentinelError::not_found("baseline", algorithm))?;
    let age_hours = baseline.age(Utc::now()).num_minutes() as f64 / 60.0;
    Ok(envelope(baseline, json!({ "age_hours": age_hours })))
}

async fn recompute_baseline(State(state): State<AppState>, Path(algorithm): Path<String>) -> ApiResult {
    let store = state.sentinel.baselines().clone();
    let baseline = blocking(move || store.recompute(&algorithm)).await?;
    let meta = json!({ "stored": !baseline.is_empty() });
    Ok(envelope(baseline, meta))
}

#[derive(Debug, Deserialize)]
struct MetricsParams {
    #[serde(default = "default_hours")]
    hours: i64,
}

async fn metrics(State(state): State<AppState>, Query(params): Query<MetricsParams>) -> ApiResult {
    let store = state.sentinel.incidents().clone();
    let since = storage::hours_before(Utc::now(), params.hours)?;
    let metrics = blocking(move || store.metrics(since)).await?;
    Ok(envelope(metrics, json!({ "hours": params.hours })))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default)]
    limit: usize,
    status: Option<String>,
    trigger: Option<String>,
}

async fn workflow_history(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> ApiResult {
    let status = match params.status.as_deref() {
        None => None,
        Some(s) => Some(
            WorkflowStatus::parse(s)
                .ok_or_else(|| SentinelError::Validation(format!("unknown workflow status '{s}'")))?,
        ),
    };
    let trigger = match params.trigger.as_deref() {
        None => None,
        Some(t) => Some(
            WorkflowTrigger::parse(t)
                .ok_or_else(|| SentinelError::Validation(format!("unknown workflow trigger '{t}'")))?,
        ),
    };
    let query = WorkflowQuery {
        limit: params.limit,
        status,
        trigger,
    };
    let store = state.sentinel.workflows().clone();
    let history = blocking(move || store.history(&query)).await?;
    let total = history.len();
    Ok(envelope(history, json!({ "total": total })))
}

async fn workflow_stats(State(state): State<AppState>) -> ApiResult {
    let store = state.sentinel.workflows().clone();
    let stats = blocking(move || store.stats()).await?;
    Ok(envelope(stats, json!({})))
}

async fn list_algorithms(State(state): State<AppState>) -> Json<Value> {
    let names = state.sentinel.registry().list();
    let total = names.len();
    envelope(names, json!({ "total": total }))
}

async fn add_algorithm(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let registry = state.sentinel.registry().clone();
    let algorithm = name.clone();
    let added = blocking(move || registry.add(&algorithm)).await?;
    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, envelope(json!({ "algorithm": name.trim(), "added": added }), json!({}))))
}

async fn remove_algorithm(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let registry = state.sentinel.registry().clone();
    let algorithm = name.clone();
    let removed = blocking(move || registry.remove(&algorithm)).await?;
    if !removed {
        return Err(SentinelError::not_found("monitored algorithm", name).into());
    }
    Ok(envelope(json!({ "algorithm": name, "removed": true }), json!({})))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt; // for `oneshot`

    use crate::api::router;
    use crate::api::state::AppState;
    use crate::config::SentinelConfig;
    use crate::sentinel::Sentinel;
    use crate::storage::test_pool;

    fn app() -> (tempfile::TempDir, axum::Router) {
        let (dir, pool) = test_pool();
        let sentinel = Sentinel::with_pool(SentinelConfig::default(), pool).unwrap();
        (dir, router(AppState::new(Arc::new(sentinel))))
    }

    async fn call(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_000_000).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn decisions(category: &str, n: usize, minutes_ago: i64) -> Value {
        let ts = (chrono::Utc::now() - chrono::Duration::minutes(minutes_ago)).to_rfc3339();
        Value::Array(
            (0..n)
                .map(|_| serde_json::json!({ "algorithm": "pricing", "category": category, "timestamp": ts }))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_dir, app) = app();
        let (status, json) = call(&app, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "ok");
        assert!(json["meta"]["version"].is_string());
    }

    #[tokio::test]
    async fn test_ingest_validation_is_bad_request() {
        let (_dir, app) = app();
        let (status, json) = call(&app, "POST", "/api/v1/decisions", Some(serde_json::json!({ "category": "low" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["meta"]["error"]["kind"], "validation");

        let (status, json) = call(
            &app,
            "POST",
            "/api/v1/decisions",
            Some(serde_json::json!({ "algorithm": "pricing", "category": "low" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["algorithm"], "pricing");
    }

    #[tokio::test]
    async fn test_check_then_resolve_flow() {
        let (_dir, app) = app();
        let (status, json) = call(&app, "POST", "/api/v1/decisions/bulk", Some(decisions("low", 100, 60 * 48))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["meta"]["indexed"], 100);
        call(&app, "POST", "/api/v1/decisions/bulk", Some(decisions("medium", 100, 60 * 48))).await;
        let (status, _) = call(&app, "POST", "/api/v1/baseline/pricing", None).await;
        assert_eq!(status, StatusCode::OK);

        call(&app, "POST", "/api/v1/decisions/bulk", Some(decisions("high", 40, 2))).await;
        let (status, json) = call(&app, "POST", "/api/v1/check/pricing", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["meta"]["drift_detected"], true);
        let id = json["meta"]["incident_id"].as_str().unwrap().to_string();

        let (status, json) = call(&app, "GET", &format!("/api/v1/incidents/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["algorithm"], "pricing");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/v1/incidents/{id}/resolve"),
            Some(serde_json::json!({ "action": "teleport", "confidence": 0.9 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = call(
            &app,
            "POST",
            &format!("/api/v1/incidents/{id}/resolve"),
            Some(serde_json::json!({ "action": "rollback", "confidence": 0.9 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "resolved");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/v1/incidents/{id}/resolve"),
            Some(serde_json::json!({ "action": "rollback", "confidence": 0.9 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, json) = call(&app, "GET", "/api/v1/incidents?status=resolved", None).await;
        assert_eq!(json["meta"]["total"], 1);
        let (_, json) = call(&app, "GET", "/api/v1/metrics?hours=1", None).await;
        assert_eq!(json["data"]["total_incidents"], 1);
        let (_, json) = call(&app, "GET", "/api/v1/workflows/history?trigger=manual", None).await;
        assert_eq!(json["meta"]["total"], 1);
    }

    #[tokio::test]
    async fn test_not_found_and_bad_filters() {
        let (_dir, app) = app();
        let (status, _) = call(&app, "GET", "/api/v1/incidents/drift-none-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/v1/baseline/none", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/v1/incidents?status=open", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "GET", "/api/v1/workflows/history?status=maybe", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "GET", "/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oversized_windows_are_bad_request() {
        let (_dir, app) = app();
        for uri in [
            "/api/v1/metrics?hours=9000000000000",
            "/api/v1/incidents?hours=9000000000000",
            "/api/v1/incidents?hours=-3",
            "/api/v1/decisions/stream?minutes=9223372036854775807",
        ] {
            let (status, json) = call(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(json["meta"]["error"]["kind"], "validation", "{uri}");
        }

        let (status, _) = call(&app, "GET", "/api/v1/metrics?hours=0", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_algorithm_registry_routes() {
        let (_dir, app) = app();
        let (status, json) = call(&app, "POST", "/api/v1/algorithms/eta", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["added"], true);
        let (status, _) = call(&app, "POST", "/api/v1/algorithms/eta", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, json) = call(&app, "GET", "/api/v1/algorithms", None).await;
        assert_eq!(json["data"], serde_json::json!(["eta"]));

        let (status, _) = call(&app, "DELETE", "/api/v1/algorithms/eta", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "DELETE", "/api/v1/algorithms/eta", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, json) = call(&app, "GET", "/api/v1/workflows/stats", None).await;
        assert_eq!(json["data"]["total"], 0);
    }
}
