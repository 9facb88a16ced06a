use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;

use crate::{app_state::AppState, version};

/// Unauthenticated routes.
pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route("/healthz", get(healthz))
}

pub fn metrics_router() -> Router<AppState> {
    Router::<AppState>::new().route("/metrics", get(metrics))
}

/// Build metadata and migration state.
#[derive(Serialize, utoipa::ToSchema)]
pub(crate) struct HealthResponse {
    status: &'static str,
    version: &'static str,
    git_sha: &'static str,
    dirty: bool,
    built_at: &'static str,
    schema_version: Option<i64>,
    target_schema_version: Option<i64>,
    pending_migrations: usize,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Health check", body = HealthResponse)),
    tag = "system"
)]
pub(crate) async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: version::VERSION,
        git_sha: version::GIT_SHA,
        dirty: version::GIT_DIRTY,
        built_at: version::BUILD_TIMESTAMP,
        schema_version: state.schema.latest_applied,
        target_schema_version: state.schema.latest_available,
        pending_migrations: state.schema.pending.len(),
    })
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}
