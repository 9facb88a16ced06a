use axum::{
    Extension, Form, Json, Router,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::Response,
    routing::{get, post},
};
use bytes::Bytes;
use common::api::DeployData;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::{FormFields, json_or_no_content, spawn_stream};
use crate::{
    app_state::AppState,
    auth::Principal,
    error::{ApiResult, AppError},
    lock::PreventUnlock,
    services::deploys::{self, DEPLOY_NOT_FOUND, DeployRequest, RollbackRequest},
    streaming::Filler,
};

pub fn router(state: &AppState) -> Router<AppState> {
    let upload_limit = usize::try_from(state.deploy.upload_body_bytes).unwrap_or(usize::MAX);
    Router::<AppState>::new()
        .route("/apps/{app}/deploy", post(deploy))
        .route("/apps/{app}/repository/clone", post(clone_repository))
        .route("/apps/{app}/deploy/rollback", post(rollback))
        .route("/apps/{app}/diff", post(save_diff))
        .route("/deploys", get(list_deploys))
        .route("/deploys/{id}", get(get_deploy))
        .layer(DefaultBodyLimit::max(upload_limit))
}

fn multipart_error(status: StatusCode, text: String) -> AppError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::payload_too_large(text)
    } else {
        AppError::bad_request(text)
    }
}

/// Deploy input from a urlencoded form, or a multipart form carrying `file`.
async fn read_deploy_request(req: Request, state: &AppState) -> ApiResult<DeployRequest> {
    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));

    let (fields, file) = if is_multipart {
        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|err| multipart_error(err.status(), err.body_text()))?;
        let mut pairs = Vec::new();
        let mut file: Option<Bytes> = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| multipart_error(err.status(), err.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                file = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|err| multipart_error(err.status(), err.body_text()))?,
                );
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|err| multipart_error(err.status(), err.body_text()))?;
                pairs.push((name, value));
            }
        }
        (FormFields(pairs), file)
    } else {
        (FormFields::from_request(req, state).await?, None)
    };

    Ok(DeployRequest {
        archive_url: fields.optional("archive-url"),
        commit: fields.optional("commit"),
        image: fields.optional("image"),
        file,
        build: fields.flag("build"),
        origin: fields.optional("origin"),
        user: fields.optional("user"),
    })
}

async fn start_deploy(
    state: AppState,
    principal: Principal,
    prevent: PreventUnlock,
    app: String,
    req: Request,
) -> ApiResult<Response> {
    let request = read_deploy_request(req, &state).await?;
    let prepared = deploys::prepare_deploy(&state, &principal, &app, request).await?;
    let task_state = state.clone();
    Ok(spawn_stream(&state, Filler::Text, None, move |out| {
        deploys::run_deploy(task_state, prepared, out, prevent)
    }))
}

/// Streams plain-text build output terminated by `OK`.
#[utoipa::path(
    post,
    path = "/apps/{app}/deploy",
    params(("app" = String, Path, description = "App name")),
    responses(
        (status = 200, description = "Deploy output", content_type = "text"),
        (status = 400, description = "Invalid origin or input"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found"),
        (status = 409, description = "App locked")
    ),
    security(("bearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn deploy(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    prevent: Option<Extension<PreventUnlock>>,
    Path(app): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    let prevent = prevent.map(|Extension(flag)| flag).unwrap_or_default();
    start_deploy(state, principal, prevent, app, req).await
}

/// Older clients deploy through this path; it behaves like `/deploy`.
#[utoipa::path(
    post,
    path = "/apps/{app}/repository/clone",
    params(("app" = String, Path, description = "App name")),
    responses(
        (status = 200, description = "Deploy output", content_type = "text"),
        (status = 404, description = "App not found")
    ),
    security(("bearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn clone_repository(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    prevent: Option<Extension<PreventUnlock>>,
    Path(app): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    let prevent = prevent.map(|Extension(flag)| flag).unwrap_or_default();
    start_deploy(state, principal, prevent, app, req).await
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct RollbackForm {
    /// Full image reference or a `vN` tag.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub origin: Option<String>,
}

#[utoipa::path(
    post,
    path = "/apps/{app}/deploy/rollback",
    params(("app" = String, Path, description = "App name")),
    request_body(content = RollbackForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "JSON stream of rollback progress", content_type = "application/x-json-stream"),
        (status = 400, description = "Missing image"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found")
    ),
    security(("bearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn rollback(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    prevent: Option<Extension<PreventUnlock>>,
    Path(app): Path<String>,
    Form(form): Form<RollbackForm>,
) -> ApiResult<Response> {
    let prevent = prevent.map(|Extension(flag)| flag).unwrap_or_default();
    let prepared = deploys::prepare_rollback(
        &state,
        &principal,
        &app,
        RollbackRequest {
            image: form.image,
            origin: form.origin,
        },
    )
    .await?;
    let task_state = state.clone();
    Ok(spawn_stream(&state, Filler::Json, None, move |out| {
        deploys::run_rollback(task_state, prepared, out, prevent)
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct DiffForm {
    #[serde(default, alias = "diff")]
    pub customdata: String,
}

/// Attaches a textual diff to the newest deploy of the app.
#[utoipa::path(
    post,
    path = "/apps/{app}/diff",
    params(("app" = String, Path, description = "App name")),
    request_body(content = DiffForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Diff saved"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App or deploy not found")
    ),
    security(("bearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn save_diff(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app): Path<String>,
    Form(form): Form<DiffForm>,
) -> ApiResult<StatusCode> {
    deploys::save_diff(&state, &principal, &app, &form.customdata).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct DeployListQuery {
    /// Only deploys of this app.
    pub app: Option<String>,
    #[serde(default)]
    pub skip: u32,
    pub limit: Option<u32>,
}

#[utoipa::path(
    get,
    path = "/deploys",
    params(DeployListQuery),
    responses(
        (status = 200, description = "Deploys, newest first", body = [DeployData]),
        (status = 204, description = "No deploys")
    ),
    security(("bearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn list_deploys(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<DeployListQuery>,
) -> ApiResult<Response> {
    let app = query.app.filter(|app| !app.is_empty());
    let items = deploys::list_deploys(&state, &principal, app, query.skip, query.limit).await?;
    Ok(json_or_no_content(items))
}

#[utoipa::path(
    get,
    path = "/deploys/{id}",
    params(("id" = String, Path, description = "Deploy id")),
    responses(
        (status = 200, description = "Deploy", body = DeployData),
        (status = 401, description = "Missing or invalid token"),
        (status = 404, description = "Deploy not found")
    ),
    security(("bearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn get_deploy(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeployData>> {
    let id = Uuid::parse_str(&id).map_err(|_| AppError::not_found(DEPLOY_NOT_FOUND))?;
    Ok(Json(deploys::get_deploy(&state, &principal, id).await?))
}
