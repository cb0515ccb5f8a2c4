//! HTTP endpoints of the gateway.
//!
//! The public router serves authenticated sessions: deploy and execute
//! requests plus offset-based polling of the session's event stream. The
//! private router is operator-facing: key-manager lookups and health.
//!
//! Deploy and execute answer synchronously with the terminal event of the
//! request; the same event is retrievable later through `/poll`, so clients
//! may treat the API as async and rely on polling alone.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use serde_json::json;
use tracing::instrument;

use crate::auth::{Auth, AuthData, auth_middleware};
use crate::stats::StatsSource;
use crate::tx::Executor;
use crate::types::{
    DeployServiceRequest, ExecuteServiceRequest, GetPublicKeyRequest, PollServiceRequest,
};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    pub auth: Arc<dyn Auth>,
    pub stats_sources: Arc<Vec<Arc<dyn StatsSource>>>,
}

/// Routes served on the public bind, guarded by the auth middleware.
pub fn public_routes(state: AppState) -> Router {
    let auth = Arc::clone(&state.auth);
    Router::new()
        .route("/v0/api/service/deploy", post(post_deploy))
        .route("/v0/api/service/execute", post(post_execute))
        .route("/v0/api/service/poll", post(post_poll))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .with_state(state)
}

/// Routes served on the private bind. No session auth: the bind itself is
/// expected to be reachable only by operators.
pub fn private_routes(state: AppState) -> Router {
    Router::new()
        .route("/v0/api/service/getPublicKey", post(post_get_public_key))
        .route("/v0/api/stats", get(get_stats))
        .route("/health", get(get_health))
        .with_state(state)
}

/// `POST /v0/api/service/deploy`: deploys a service with one of the
/// gateway's wallets and returns the terminal event.
#[instrument(skip_all, fields(session = %auth.session_key))]
async fn post_deploy(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthData>,
    Json(body): Json<DeployServiceRequest>,
) -> impl IntoResponse {
    if let Err(err) = state.auth.verify(&body.data, &auth.expected_aad) {
        return err.into_response();
    }

    let event = state
        .executor
        .deploy_service(&auth.session_key, body)
        .await;
    (StatusCode::OK, Json(event)).into_response()
}

/// `POST /v0/api/service/execute`: invokes a deployed service and returns
/// the terminal event.
#[instrument(skip_all, fields(session = %auth.session_key))]
async fn post_execute(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthData>,
    Json(body): Json<ExecuteServiceRequest>,
) -> impl IntoResponse {
    if let Err(err) = state.auth.verify(&body.data, &auth.expected_aad) {
        return err.into_response();
    }

    let event = state
        .executor
        .execute_service(&auth.session_key, body)
        .await;
    (StatusCode::OK, Json(event)).into_response()
}

/// `POST /v0/api/service/poll`: retrieves events from the session's stream
/// by offset, optionally discarding everything before it.
#[instrument(skip_all, fields(session = %auth.session_key, offset = body.offset))]
async fn post_poll(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthData>,
    Json(body): Json<PollServiceRequest>,
) -> impl IntoResponse {
    match state.executor.poll_service(&auth.session_key, body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `POST /v0/api/service/getPublicKey`: fetches the public key bound to a
/// deployed service from the backend key manager.
#[instrument(skip_all, fields(address = %body.address))]
async fn post_get_public_key(
    State(state): State<AppState>,
    Json(body): Json<GetPublicKeyRequest>,
) -> impl IntoResponse {
    match state.executor.get_public_key_service(body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `GET /v0/api/stats`: per-method call statistics of the components that
/// track them.
#[instrument(skip_all)]
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let mut report = serde_json::Map::new();
    for source in state.stats_sources.iter() {
        report.insert(source.name().to_string(), json!(source.stats()));
    }
    Json(serde_json::Value::Object(report))
}

#[instrument(skip_all)]
async fn get_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
