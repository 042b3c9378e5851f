/**
 * API REST DLT - Surface d'administration du kernel
 *
 * RÔLE :
 * CRUD des node groups et load tests, démarrage/arrêt des tests (fan-out
 * MQTT via le dispatcher), lecture des résultats consolidés.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, état partagé AppState (store, router, dispatcher...)
 * - Routes : /health, /system/health, /api/ngs, /api/loadtests
 * - Erreurs KernelError → 404 / 400 / 409 / 500 avec corps {"error": ...}
 *
 * SÉCURITÉ :
 * - Header x-api-key requis sur toutes routes sauf /health quand une clé
 *   est configurée ; sans clé l'API est ouverte (warning au démarrage)
 */

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::aggregator::ResultAggregator;
use crate::dispatcher::{CommandDispatcher, DispatchReport};
use crate::error::{KernelError, KernelResult, StoreError};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{
    LoadTest, LoadTestPatch, LoadTestSummary, NewLoadTest, NewNodeGroup, NodeGroup,
    NodeGroupCommand, NodeGroupPatch,
};
use crate::router::SharedRouter;
use crate::store::{bounded, SharedStore, StoreTimeouts};

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub timeouts: StoreTimeouts,
    pub router: SharedRouter,
    pub dispatcher: CommandDispatcher,
    pub aggregator: ResultAggregator,
    pub health_tracker: HealthTracker,
    pub api_key: Option<Arc<str>>,
}

pub struct ApiError(KernelError);

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        ApiError(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            KernelError::NotFound { .. } => StatusCode::NOT_FOUND,
            KernelError::InvalidRequest(_) | KernelError::Heartbeat(_) => StatusCode::BAD_REQUEST,
            KernelError::Store(StoreError::InvalidTransition { .. })
            | KernelError::Store(StoreError::SummaryExists(_)) => StatusCode::CONFLICT,
            KernelError::Store(_) | KernelError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        tracing::warn!(path = %req.uri().path(), "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/ngs", get(list_node_groups).put(create_node_group))
        .route(
            "/api/ngs/{id}",
            get(get_node_group).patch(patch_node_group).delete(delete_node_group),
        )
        .route("/api/loadtests", get(list_load_tests).put(create_load_test))
        .route("/api/loadtests/stop", put(stop_load_test))
        .route(
            "/api/loadtests/{id}",
            get(get_load_test).patch(patch_load_test).delete(delete_load_test),
        )
        .route("/api/loadtests/{id}/results", get(get_results))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn not_found(kind: &'static str, id: String) -> ApiError {
    ApiError(KernelError::NotFound { kind, id })
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> ApiResult<KernelHealth> {
    let node_groups = bounded("list_node_groups", app.timeouts.scan, app.store.list_node_groups()).await?;
    let health = app.health_tracker.get_health(
        app.router.stats(),
        node_groups.len(),
        app.router.in_flight().len(),
    );
    Ok(Json(health))
}

// GET /api/ngs
async fn list_node_groups(State(app): State<AppState>) -> ApiResult<Vec<NodeGroup>> {
    Ok(Json(
        bounded("list_node_groups", app.timeouts.scan, app.store.list_node_groups()).await?,
    ))
}

// GET /api/ngs/{id}
async fn get_node_group(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<NodeGroup> {
    let found = bounded("get_node_group", app.timeouts.point, app.store.get_node_group(&id)).await?;
    found.map(Json).ok_or_else(|| not_found("node group", id))
}

// PUT /api/ngs
async fn create_node_group(
    State(app): State<AppState>,
    Json(new): Json<NewNodeGroup>,
) -> Result<(StatusCode, Json<NodeGroup>), ApiError> {
    if new.topic.trim().is_empty() {
        return Err(KernelError::InvalidRequest("topic must not be empty".into()).into());
    }
    let created = bounded("create_node_group", app.timeouts.point, app.store.create_node_group(new)).await?;
    tracing::info!(ng_id = %created.id, topic = %created.topic, "node group created");
    Ok((StatusCode::CREATED, Json(created)))
}

// PATCH /api/ngs/{id}
async fn patch_node_group(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<NodeGroupPatch>,
) -> ApiResult<NodeGroup> {
    let found = bounded("update_node_group", app.timeouts.point, app.store.update_node_group(&id, patch)).await?;
    found.map(Json).ok_or_else(|| not_found("node group", id))
}

// DELETE /api/ngs/{id}
async fn delete_node_group(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    if !bounded("delete_node_group", app.timeouts.point, app.store.delete_node_group(&id)).await? {
        return Err(not_found("node group", id));
    }
    tracing::info!(ng_id = %id, "node group deleted");
    Ok(Json(json!({ "deleted": id })))
}

// GET /api/loadtests
async fn list_load_tests(State(app): State<AppState>) -> ApiResult<Vec<LoadTest>> {
    Ok(Json(
        bounded("list_load_tests", app.timeouts.scan, app.store.list_load_tests()).await?,
    ))
}

// GET /api/loadtests/{id}
async fn get_load_test(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<LoadTest> {
    let found = bounded("get_load_test", app.timeouts.point, app.store.get_load_test(&id)).await?;
    found.map(Json).ok_or_else(|| not_found("load test", id))
}

#[derive(Debug, Serialize)]
struct StartedLoadTest {
    load_test: LoadTest,
    dispatch: DispatchReport,
}

fn validate_new_load_test(new: &NewLoadTest) -> KernelResult<()> {
    if !new.tps.is_finite() || new.tps <= 0.0 {
        return Err(KernelError::InvalidRequest("tps must be a positive number".into()));
    }
    if new.duration == 0 {
        return Err(KernelError::InvalidRequest("duration must be at least 1 second".into()));
    }
    Ok(())
}

// PUT /api/loadtests : création + start_loadtest vers tous les node groups
async fn create_load_test(
    State(app): State<AppState>,
    Json(new): Json<NewLoadTest>,
) -> Result<(StatusCode, Json<StartedLoadTest>), ApiError> {
    validate_new_load_test(&new)?;
    let load_test = bounded("create_load_test", app.timeouts.point, app.store.create_load_test(new)).await?;
    tracing::info!(load_test_id = %load_test.id, tps = load_test.tps, duration = load_test.duration, "load test created");

    let dispatch = app.dispatcher.dispatch(&NodeGroupCommand::start(&load_test)).await?;
    Ok((StatusCode::CREATED, Json(StartedLoadTest { load_test, dispatch })))
}

// PATCH /api/loadtests/{id}
async fn patch_load_test(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<LoadTestPatch>,
) -> ApiResult<LoadTest> {
    let found = bounded("update_load_test", app.timeouts.point, app.store.update_load_test(&id, patch)).await?;
    found.map(Json).ok_or_else(|| not_found("load test", id))
}

// DELETE /api/loadtests/{id}
async fn delete_load_test(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    if !bounded("delete_load_test", app.timeouts.point, app.store.delete_load_test(&id)).await? {
        return Err(not_found("load test", id));
    }
    tracing::info!(load_test_id = %id, "load test deleted");
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Default, Deserialize)]
struct StopRequest {
    #[serde(default)]
    load_test_id: Option<String>,
}

// PUT /api/loadtests/stop : corps optionnel {"load_test_id": ...}
async fn stop_load_test(State(app): State<AppState>, body: Bytes) -> ApiResult<DispatchReport> {
    let request: StopRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StopRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| KernelError::InvalidRequest(format!("invalid stop request: {e}")))?
    };
    let load_test_id = request.load_test_id.filter(|id| !id.trim().is_empty());

    if let Some(id) = &load_test_id {
        let known = bounded("get_load_test", app.timeouts.point, app.store.get_load_test(id)).await?;
        if known.is_none() {
            return Err(not_found("load test", id.clone()));
        }
    }

    let report = app
        .dispatcher
        .dispatch(&NodeGroupCommand::StopLoadTest { load_test_id })
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
struct ResultsView {
    /// "final" : summary persisté ; "preview" : agrégation à la volée
    state: &'static str,
    summary: LoadTestSummary,
}

// GET /api/loadtests/{id}/results
async fn get_results(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<ResultsView> {
    if let Some(summary) = bounded("get_summary", app.timeouts.point, app.store.get_summary(&id)).await? {
        return Ok(Json(ResultsView { state: "final", summary }));
    }
    let found = bounded("get_load_test", app.timeouts.point, app.store.get_load_test(&id)).await?;
    let load_test = found.ok_or_else(|| not_found("load test", id))?;
    let summary = app.aggregator.preview(&load_test).await?;
    Ok(Json(ResultsView { state: "preview", summary }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::NodeGroupHealthTracker;
    use crate::lifecycle::LifecycleController;
    use crate::router::HeartbeatRouter;
    use crate::store::JsonStore;
    use axum::body::Body;
    use axum::http::Method;
    use dlt_devkit::{HeartbeatBuilder, MockMqttClient, NodeResultsBuilder};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app_state(api_key: Option<&str>) -> (AppState, MockMqttClient) {
        let store: SharedStore = Arc::new(JsonStore::in_memory());
        let timeouts = StoreTimeouts::default();
        let mock = MockMqttClient::new();
        let aggregator = ResultAggregator::new(store.clone(), timeouts);
        let router = Arc::new(HeartbeatRouter::new(
            NodeGroupHealthTracker::new(store.clone(), timeouts),
            LifecycleController::new(store.clone(), timeouts, aggregator.clone()),
        ));
        let dispatcher = CommandDispatcher::new(store.clone(), Arc::new(mock.clone()), timeouts);
        let state = AppState {
            store,
            timeouts,
            router,
            dispatcher,
            aggregator,
            health_tracker: HealthTracker::new(),
            api_key: api_key.map(Arc::from),
        };
        (state, mock)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_node_group_crud() {
        let (state, _mock) = app_state(None);
        let app = build_router(state);

        let (status, created) = call(&app, Method::PUT, "/api/ngs", Some(json!({"topic": "ng/a"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["_id"].as_str().unwrap().to_string();

        let (status, patched) = call(
            &app,
            Method::PATCH,
            &format!("/api/ngs/{id}"),
            Some(json!({"nodes": ["n1", "n2"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["nodes"], json!(["n1", "n2"]));
        assert_eq!(patched["topic"], "ng/a");

        let (status, list) = call(&app, Method::GET, "/api/ngs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, Method::DELETE, &format!("/api/ngs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::GET, &format!("/api/ngs/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("node group"));
    }

    #[tokio::test]
    async fn test_invalid_inputs_are_rejected() {
        let (state, _mock) = app_state(None);
        let app = build_router(state);
        let (status, _) = call(&app, Method::PUT, "/api/ngs", Some(json!({"topic": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/loadtests",
            Some(json!({"tps": 0, "duration": 30})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_load_test_fans_out_start() {
        let (state, mock) = app_state(None);
        let app = build_router(state);
        call(&app, Method::PUT, "/api/ngs", Some(json!({"topic": "ng/a"}))).await;
        call(&app, Method::PUT, "/api/ngs", Some(json!({"topic": "ng/b"}))).await;

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/loadtests",
            Some(json!({"description": "api", "tps": 10, "duration": 30, "logic": "GET /"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["load_test"]["status"], "created");
        assert_eq!(body["dispatch"]["published"].as_array().unwrap().len(), 2);

        let sent: Value = mock.get_last_json_message("ng/b").unwrap().unwrap();
        assert_eq!(sent["action"], "start_loadtest");
        assert_eq!(sent["load_test_id"], body["load_test"]["_id"]);
    }

    #[tokio::test]
    async fn test_stop_with_and_without_body() {
        let (state, mock) = app_state(None);
        let app = build_router(state);
        call(&app, Method::PUT, "/api/ngs", Some(json!({"topic": "ng/a"}))).await;

        let (status, report) = call(&app, Method::PUT, "/api/loadtests/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["action"], "stop_loadtest");
        let sent: Value = mock.get_last_json_message("ng/a").unwrap().unwrap();
        assert!(sent.get("load_test_id").is_none());

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/loadtests/stop",
            Some(json!({"load_test_id": "ghost"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_results_preview_then_final() {
        let (state, _mock) = app_state(None);
        let router = state.router.clone();
        let app = build_router(state);
        let (_, ng) = call(&app, Method::PUT, "/api/ngs", Some(json!({"topic": "ng/a"}))).await;
        let ng_id = ng["_id"].as_str().unwrap().to_string();
        let (_, started) = call(
            &app,
            Method::PUT,
            "/api/loadtests",
            Some(json!({"tps": 10, "duration": 30})),
        )
        .await;
        let lt = started["load_test"]["_id"].as_str().unwrap().to_string();

        let updates = NodeResultsBuilder::new().node("n1").success(40).failure(502, "bad gateway").build();
        router
            .handle_payload(&HeartbeatBuilder::new(&ng_id).active(&lt).node_updates(updates).to_bytes())
            .await;

        let (status, preview) = call(&app, Method::GET, &format!("/api/loadtests/{lt}/results"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["state"], "preview");
        assert_eq!(preview["summary"]["totalRequests"], 2);

        router.handle_payload(&HeartbeatBuilder::new(&ng_id).to_bytes()).await;
        let (_, done) = call(&app, Method::GET, &format!("/api/loadtests/{lt}/results"), None).await;
        assert_eq!(done["state"], "final");
        assert_eq!(done["summary"]["topFailures"]["502"], "bad gateway");

        let (_, lt_view) = call(&app, Method::GET, &format!("/api/loadtests/{lt}"), None).await;
        assert_eq!(lt_view["status"], "complete");

        let (status, _) = call(&app, Method::GET, "/api/loadtests/ghost/results", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let (state, _mock) = app_state(Some("secret"));
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(axum::http::Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, _) = call(&app, Method::GET, "/api/ngs", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                axum::http::Request::get("/system/health")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
