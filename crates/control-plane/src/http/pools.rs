use axum::{
    Extension, Form, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
};
use common::api::PoolView;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use super::{deserialize_flag, json_or_no_content};
use crate::{
    app_state::AppState,
    auth::Principal,
    error::ApiResult,
    services::pools::{self, CreatePoolRequest},
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/pools", get(list_pools).post(create_pool))
        .route("/pools/{name}", delete(delete_pool))
        .route("/pools/{name}/team", post(add_team).delete(remove_team))
}

#[utoipa::path(
    get,
    path = "/pools",
    responses(
        (status = 200, description = "Pools visible to the caller", body = [PoolView]),
        (status = 204, description = "No pools")
    ),
    security(("bearer" = [])),
    tag = "pools"
)]
pub(crate) async fn list_pools(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    Ok(json_or_no_content(pools::list_visible(&state, &principal).await?))
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct CreatePoolForm {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub default: bool,
    /// Replace the current default pool.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub force: bool,
    #[serde(default)]
    pub provisioner: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub public: bool,
}

/// Teams are added afterwards through `/pools/{name}/team`.
#[utoipa::path(
    post,
    path = "/pools",
    request_body(content = CreatePoolForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 201, description = "Pool created", body = PoolView),
        (status = 400, description = "Invalid pool"),
        (status = 409, description = "Pool or default pool already exists")
    ),
    security(("bearer" = [])),
    tag = "pools"
)]
pub(crate) async fn create_pool(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Form(form): Form<CreatePoolForm>,
) -> ApiResult<(StatusCode, Json<PoolView>)> {
    let pool = pools::create_pool(
        &state,
        &principal,
        CreatePoolRequest {
            name: form.name,
            default: form.default,
            force: form.force,
            provisioner: form.provisioner,
            public: form.public,
            teams: Vec::new(),
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(pools::to_view(pool))))
}

#[utoipa::path(
    delete,
    path = "/pools/{name}",
    params(("name" = String, Path, description = "Pool name")),
    responses(
        (status = 200, description = "Pool removed"),
        (status = 403, description = "Pool still has apps"),
        (status = 404, description = "Pool not found")
    ),
    security(("bearer" = [])),
    tag = "pools"
)]
pub(crate) async fn delete_pool(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    pools::delete_pool(&state, &principal, &name).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct TeamForm {
    pub team: String,
}

#[utoipa::path(
    post,
    path = "/pools/{name}/team",
    params(("name" = String, Path, description = "Pool name")),
    request_body(content = TeamForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Team added"),
        (status = 404, description = "Pool or team not found")
    ),
    security(("bearer" = [])),
    tag = "pools"
)]
pub(crate) async fn add_team(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    Form(form): Form<TeamForm>,
) -> ApiResult<StatusCode> {
    pools::add_team(&state, &principal, &name, &form.team).await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    delete,
    path = "/pools/{name}/team",
    params(("name" = String, Path, description = "Pool name"), TeamForm),
    responses(
        (status = 200, description = "Team removed"),
        (status = 404, description = "Pool not found")
    ),
    security(("bearer" = [])),
    tag = "pools"
)]
pub(crate) async fn remove_team(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    Query(query): Query<TeamForm>,
) -> ApiResult<StatusCode> {
    pools::remove_team(&state, &principal, &name, &query.team).await?;
    Ok(StatusCode::OK)
}
