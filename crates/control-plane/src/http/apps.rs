use axum::{
    Extension, Form, Json, Router,
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::Response,
    routing::{get, put},
};
use common::api::{AppInfo, EnvVar};
use serde::Deserialize;
use tower_http::request_id::RequestId;
use tracing::warn;
use utoipa::ToSchema;

use super::{FormFields, json_or_no_content, spawn_stream, take_app_lock};
use crate::{
    app_state::AppState,
    auth::Principal,
    error::ApiResult,
    lock::LockHandoff,
    services::{
        app_env::{self, SetEnvRequest},
        app_units::{self, UnitChange},
        apps::{self, CreateAppRequest},
    },
    streaming::Filler,
    telemetry,
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/apps", get(list_apps).post(create_app))
        .route("/apps/{app}", get(get_app).delete(delete_app))
        .route(
            "/apps/{app}/env",
            get(get_env).post(set_env).delete(unset_env),
        )
        .route("/apps/{app}/units", put(add_units).delete(remove_units))
}

/// Values of a repeated query key, e.g. `?env=A&env=B`.
fn query_values(query: Option<&str>, key: &str) -> Vec<String> {
    query
        .map(|raw| {
            url::form_urlencoded::parse(raw.as_bytes())
                .filter(|(name, value)| name == key && !value.is_empty())
                .map(|(_, value)| value.into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct CreateAppForm {
    pub name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default, rename = "teamOwner")]
    pub team_owner: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[utoipa::path(
    post,
    path = "/apps",
    request_body(content = CreateAppForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 201, description = "App created", body = AppInfo),
        (status = 400, description = "Invalid name or missing team"),
        (status = 403, description = "Permission denied"),
        (status = 409, description = "App already exists")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn create_app(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Form(form): Form<CreateAppForm>,
) -> ApiResult<(StatusCode, Json<AppInfo>)> {
    let app = apps::create_app(
        &state,
        &principal,
        CreateAppRequest {
            name: form.name,
            platform: form.platform,
            plan: form.plan,
            pool: form.pool.filter(|p| !p.is_empty()),
            team_owner: form.team_owner.filter(|t| !t.is_empty()),
            description: form.description,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(apps::to_info(&app))))
}

#[utoipa::path(
    get,
    path = "/apps",
    responses(
        (status = 200, description = "Apps visible to the caller", body = [AppInfo]),
        (status = 204, description = "No visible apps")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn list_apps(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    Ok(json_or_no_content(apps::list_visible(&state, &principal).await?))
}

#[utoipa::path(
    get,
    path = "/apps/{app}",
    params(("app" = String, Path, description = "App name")),
    responses(
        (status = 200, description = "App", body = AppInfo),
        (status = 404, description = "App not found")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn get_app(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app): Path<String>,
) -> ApiResult<Json<AppInfo>> {
    Ok(Json(apps::get_visible(&state, &principal, &app).await?))
}

/// Removes bindings, units, tokens and the app itself, streaming progress.
#[utoipa::path(
    delete,
    path = "/apps/{app}",
    params(("app" = String, Path, description = "App name")),
    responses(
        (status = 200, description = "JSON stream of removal progress", content_type = "application/x-json-stream"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn delete_app(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    handoff: Option<Extension<LockHandoff>>,
    Path(app): Path<String>,
) -> ApiResult<Response> {
    let request_id = telemetry::request_id_from_extension(request_id);
    let record = apps::prepare_delete(&state, &principal, &app).await?;
    let task_state = state.clone();
    let lock = take_app_lock(handoff);
    Ok(spawn_stream(&state, Filler::Json, lock, move |out| async move {
        if let Err(err) =
            apps::delete_app(&task_state, &principal, record, &out, request_id).await
        {
            warn!(app = %app, error = %err, "app removal failed");
            out.error(err.message).await;
        }
    }))
}

#[utoipa::path(
    get,
    path = "/apps/{app}/env",
    params(
        ("app" = String, Path, description = "App name"),
        ("env" = Option<Vec<String>>, Query, description = "Variable names to return; all when absent")
    ),
    responses(
        (status = 200, description = "Variables, private values masked", body = [EnvVar]),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn get_env(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<Json<Vec<EnvVar>>> {
    let names = query_values(query.as_deref(), "env");
    Ok(Json(app_env::list(&state, &principal, &app, &names).await?))
}

/// Form fields: repeated `env` as `NAME=value` and `private`.
#[utoipa::path(
    post,
    path = "/apps/{app}/env",
    params(("app" = String, Path, description = "App name")),
    responses(
        (status = 200, description = "Variables set"),
        (status = 400, description = "Missing or invalid variables"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found"),
        (status = 409, description = "App locked")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn set_env(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app): Path<String>,
    form: FormFields,
) -> ApiResult<StatusCode> {
    app_env::set(
        &state,
        &principal,
        &app,
        SetEnvRequest {
            envs: form.all("env"),
            private: form.flag("private"),
        },
    )
    .await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    delete,
    path = "/apps/{app}/env",
    params(
        ("app" = String, Path, description = "App name"),
        ("env" = Vec<String>, Query, description = "Variable names to unset")
    ),
    responses(
        (status = 200, description = "Variables unset"),
        (status = 400, description = "No variables given or variable owned by a service bind"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found"),
        (status = 409, description = "App locked")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn unset_env(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<StatusCode> {
    let names = query_values(query.as_deref(), "env");
    app_env::unset(&state, &principal, &app, &names).await?;
    Ok(StatusCode::OK)
}

/// Form field: `units`.
#[utoipa::path(
    put,
    path = "/apps/{app}/units",
    params(("app" = String, Path, description = "App name")),
    responses(
        (status = 200, description = "JSON stream of unit progress", content_type = "application/x-json-stream"),
        (status = 400, description = "Invalid number of units"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found"),
        (status = 409, description = "App locked")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn add_units(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    handoff: Option<Extension<LockHandoff>>,
    Path(app): Path<String>,
    form: FormFields,
) -> ApiResult<Response> {
    let count = app_units::parse_units(form.get("units"))?;
    change_units(state, principal, request_id, handoff, app, UnitChange::Add, count).await
}

#[utoipa::path(
    delete,
    path = "/apps/{app}/units",
    params(
        ("app" = String, Path, description = "App name"),
        ("units" = u32, Query, description = "Number of units to remove")
    ),
    responses(
        (status = 200, description = "JSON stream of unit progress", content_type = "application/x-json-stream"),
        (status = 400, description = "Invalid number of units"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found"),
        (status = 409, description = "App locked")
    ),
    security(("bearer" = [])),
    tag = "apps"
)]
pub(crate) async fn remove_units(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    handoff: Option<Extension<LockHandoff>>,
    Path(app): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<Response> {
    let units = query_values(query.as_deref(), "units");
    let count = app_units::parse_units(units.first().map(String::as_str))?;
    change_units(state, principal, request_id, handoff, app, UnitChange::Remove, count).await
}

async fn change_units(
    state: AppState,
    principal: Principal,
    request_id: Option<Extension<RequestId>>,
    handoff: Option<Extension<LockHandoff>>,
    app: String,
    change: UnitChange,
    count: u32,
) -> ApiResult<Response> {
    let request_id = telemetry::request_id_from_extension(request_id);
    let op = app_units::prepare(&state, &principal, &app, change, count).await?;
    let task_state = state.clone();
    let lock = take_app_lock(handoff);
    Ok(spawn_stream(&state, Filler::Json, lock, move |out| async move {
        if let Err(err) = app_units::run(task_state, op, out, request_id).await {
            warn!(app = %app, ?change, error = %err, "unit change failed");
        }
    }))
}
