use std::collections::BTreeMap;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get},
};
use common::api::{MachineView, TemplateView};
use serde::Deserialize;
use utoipa::ToSchema;

use super::json_or_no_content;
use crate::{app_state::AppState, auth::Principal, error::ApiResult, services::machines};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/iaas/machines", get(list_machines))
        .route("/iaas/machines/{id}", delete(delete_machine))
        .route("/iaas/templates", get(list_templates).post(save_template))
        .route("/iaas/templates/{name}", delete(delete_template))
}

#[utoipa::path(
    get,
    path = "/iaas/machines",
    responses(
        (status = 200, description = "Machines visible to the caller", body = [MachineView]),
        (status = 204, description = "No machines")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn list_machines(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    Ok(json_or_no_content(
        machines::list_machines(&state, &principal).await?,
    ))
}

#[utoipa::path(
    delete,
    path = "/iaas/machines/{id}",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 200, description = "Machine destroyed"),
        (status = 404, description = "Machine not found")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn delete_machine(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    machines::delete_machine(&state, &principal, &id).await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/iaas/templates",
    responses(
        (status = 200, description = "Machine templates", body = [TemplateView]),
        (status = 204, description = "No templates")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn list_templates(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    Ok(json_or_no_content(
        machines::list_templates(&state, &principal).await?,
    ))
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct TemplateRequest {
    pub name: String,
    /// IaaS backend; the configured default when empty.
    #[serde(default)]
    pub iaas: String,
    /// Parameters passed to machine creation.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Creates the template, or replaces the one with the same name.
#[utoipa::path(
    post,
    path = "/iaas/templates",
    request_body = TemplateRequest,
    responses(
        (status = 201, description = "Template saved", body = TemplateView),
        (status = 400, description = "Invalid template or unknown IaaS")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn save_template(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<TemplateRequest>,
) -> ApiResult<(StatusCode, Json<TemplateView>)> {
    let template =
        machines::save_template(&state, &principal, &req.name, &req.iaas, req.params).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

#[utoipa::path(
    delete,
    path = "/iaas/templates/{name}",
    params(("name" = String, Path, description = "Template name")),
    responses(
        (status = 200, description = "Template removed"),
        (status = 404, description = "Template not found")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn delete_template(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    machines::delete_template(&state, &principal, &name).await?;
    Ok(StatusCode::OK)
}
