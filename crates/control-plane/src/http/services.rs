//! Service catalog and service instances.

use axum::{
    Extension, Form, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get, post, put},
};
use common::api::{ServiceInstanceInfo, ServicePlan, ServiceView};
use serde::Deserialize;
use tower_http::request_id::RequestId;
use tracing::warn;
use utoipa::{IntoParams, ToSchema};

use super::{FormFields, deserialize_flag, json_or_no_content, spawn_stream, take_app_lock};
use crate::{
    app_state::AppState,
    auth::Principal,
    error::ApiResult,
    lock::LockHandoff,
    persistence::InstanceFilter,
    services::{
        catalog::{self, CreateServiceRequest},
        service_instances::{self as instances, CreateInstanceRequest, UpdateInstanceRequest},
    },
    streaming::Filler,
    telemetry,
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/services", get(list_services).post(create_service))
        .route("/services/instances", get(list_instances))
        .route("/services/{service}", delete(delete_service))
        .route("/services/{service}/plans", get(list_plans))
        .route("/services/{service}/instances", post(create_instance))
        .route(
            "/services/{service}/instances/{instance}",
            get(instance_info)
                .put(update_instance)
                .delete(delete_instance),
        )
        .route(
            "/services/{service}/instances/{instance}/status",
            get(instance_status),
        )
        .route(
            "/services/{service}/instances/{instance}/{app}",
            put(bind_instance).delete(unbind_instance),
        )
        .route(
            "/services/{service}/instances/permission/{instance}/{team}",
            put(grant_team).delete(revoke_team),
        )
}

#[utoipa::path(
    get,
    path = "/services",
    responses(
        (status = 200, description = "Services visible to the caller", body = [ServiceView]),
        (status = 204, description = "No services")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn list_services(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    Ok(json_or_no_content(catalog::list_visible(&state, &principal).await?))
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct CreateServiceForm {
    pub name: String,
    /// Production broker endpoint.
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub restricted: bool,
    #[serde(default)]
    pub doc: String,
}

#[utoipa::path(
    post,
    path = "/services",
    request_body(content = CreateServiceForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 201, description = "Service registered", body = ServiceView),
        (status = 400, description = "Invalid name, endpoint or team"),
        (status = 409, description = "Service already exists")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn create_service(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Form(form): Form<CreateServiceForm>,
) -> ApiResult<(StatusCode, Json<ServiceView>)> {
    let service = catalog::create_service(
        &state,
        &principal,
        CreateServiceRequest {
            name: form.name,
            endpoint: form.endpoint,
            username: form.username,
            password: form.password,
            team: form.team,
            restricted: form.restricted,
            doc: form.doc,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(catalog::to_view(service))))
}

#[utoipa::path(
    delete,
    path = "/services/{service}",
    params(("service" = String, Path, description = "Service name")),
    responses(
        (status = 200, description = "Service removed"),
        (status = 403, description = "Service still has instances"),
        (status = 404, description = "Service not found")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn delete_service(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(service): Path<String>,
) -> ApiResult<StatusCode> {
    catalog::delete_service(&state, &principal, &service).await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/services/{service}/plans",
    params(("service" = String, Path, description = "Service name")),
    responses(
        (status = 200, description = "Plans reported by the broker", body = [ServicePlan]),
        (status = 404, description = "Service not found"),
        (status = 502, description = "Broker error")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn list_plans(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    Path(service): Path<String>,
) -> ApiResult<Json<Vec<ServicePlan>>> {
    let request_id = telemetry::request_id_from_extension(request_id);
    Ok(Json(
        catalog::plans(&state, &principal, &service, request_id).await?,
    ))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct InstanceListQuery {
    /// Only instances bound to this app.
    pub app: Option<String>,
    /// Only instances of this service.
    pub service: Option<String>,
}

#[utoipa::path(
    get,
    path = "/services/instances",
    params(InstanceListQuery),
    responses(
        (status = 200, description = "Instances visible to the caller", body = [ServiceInstanceInfo]),
        (status = 204, description = "No instances")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn list_instances(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<InstanceListQuery>,
) -> ApiResult<Response> {
    let filter = InstanceFilter {
        service: query.service.filter(|s| !s.is_empty()),
        app: query.app.filter(|a| !a.is_empty()),
    };
    Ok(json_or_no_content(
        instances::list_visible(&state, &principal, &filter).await?,
    ))
}

/// Form fields: `name`, `plan`, `owner`, `description` and repeated `tag`.
#[utoipa::path(
    post,
    path = "/services/{service}/instances",
    params(("service" = String, Path, description = "Service name")),
    responses(
        (status = 201, description = "Instance created", body = ServiceInstanceInfo),
        (status = 400, description = "Invalid name or ambiguous team"),
        (status = 403, description = "Permission denied or restricted service"),
        (status = 409, description = "Instance already exists")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn create_instance(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    Path(service): Path<String>,
    form: FormFields,
) -> ApiResult<(StatusCode, Json<ServiceInstanceInfo>)> {
    let request_id = telemetry::request_id_from_extension(request_id);
    let instance = instances::create(
        &state,
        &principal,
        &service,
        CreateInstanceRequest {
            name: form.string("name"),
            plan: form.string("plan"),
            team_owner: form.optional("owner"),
            description: form.string("description"),
            tags: form.all("tag"),
        },
        request_id,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(instances::to_info(instance))))
}

/// Form fields: `description`, `teamowner`, `plan` and repeated `tag`.
#[utoipa::path(
    put,
    path = "/services/{service}/instances/{instance}",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name")
    ),
    responses(
        (status = 200, description = "Instance updated"),
        (status = 400, description = "Invalid update"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "Instance not found")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn update_instance(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((service, instance)): Path<(String, String)>,
    form: FormFields,
) -> ApiResult<StatusCode> {
    let tags = form.all("tag");
    instances::update(
        &state,
        &principal,
        &service,
        &instance,
        UpdateInstanceRequest {
            description: form.get("description").map(str::to_string),
            team_owner: form.optional("teamowner"),
            tags: (!tags.is_empty()).then_some(tags),
            plan: form.optional("plan"),
        },
    )
    .await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/services/{service}/instances/{instance}",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name")
    ),
    responses(
        (status = 200, description = "Instance with broker-reported details", body = ServiceInstanceInfo),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "Instance not found")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn instance_info(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    Path((service, instance)): Path<(String, String)>,
) -> ApiResult<Json<ServiceInstanceInfo>> {
    let request_id = telemetry::request_id_from_extension(request_id);
    Ok(Json(
        instances::info(&state, &principal, &service, &instance, request_id).await?,
    ))
}

#[utoipa::path(
    get,
    path = "/services/{service}/instances/{instance}/status",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name")
    ),
    responses(
        (status = 200, description = "Status sentence", body = String, content_type = "text/plain"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "Instance not found")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn instance_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    Path((service, instance)): Path<(String, String)>,
) -> ApiResult<String> {
    let request_id = telemetry::request_id_from_extension(request_id);
    let status = instances::status(&state, &principal, &service, &instance, request_id).await?;
    Ok(format!("{status}\n"))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct DeleteInstanceQuery {
    /// Unbind every app before removing the instance.
    #[serde(default, deserialize_with = "deserialize_flag")]
    #[param(value_type = Option<bool>)]
    pub unbindall: bool,
}

/// With bound apps and no `unbindall` the answer is a single error frame.
#[utoipa::path(
    delete,
    path = "/services/{service}/instances/{instance}",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name"),
        DeleteInstanceQuery
    ),
    responses(
        (status = 200, description = "JSON stream of removal progress", content_type = "application/x-json-stream"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "Instance not found")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn delete_instance(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    Path((service, instance)): Path<(String, String)>,
    Query(query): Query<DeleteInstanceQuery>,
) -> ApiResult<Response> {
    let request_id = telemetry::request_id_from_extension(request_id);
    let op = instances::prepare_delete(&state, &principal, &service, &instance, query.unbindall)
        .await?;
    let task_state = state.clone();
    Ok(spawn_stream(&state, Filler::Json, None, move |out| async move {
        if let Err(err) = instances::run_delete(task_state, op, out, request_id).await {
            warn!(%service, %instance, error = %err, "service instance removal failed");
        }
    }))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct BindQuery {
    /// Do not restart the app after changing its environment.
    #[serde(default, rename = "noRestart", deserialize_with = "deserialize_flag")]
    #[param(value_type = Option<bool>)]
    pub no_restart: bool,
}

#[utoipa::path(
    put,
    path = "/services/{service}/instances/{instance}/{app}",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name"),
        ("app" = String, Path, description = "App name"),
        BindQuery
    ),
    responses(
        (status = 200, description = "JSON stream of bind progress", content_type = "application/x-json-stream"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "Instance or app not found"),
        (status = 409, description = "Already bound or app locked")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn bind_instance(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    handoff: Option<Extension<LockHandoff>>,
    Path((service, instance, app)): Path<(String, String, String)>,
    Query(query): Query<BindQuery>,
) -> ApiResult<Response> {
    let request_id = telemetry::request_id_from_extension(request_id);
    let bind =
        instances::prepare_bind(&state, &principal, &service, &instance, &app, query.no_restart)
            .await?;
    let task_state = state.clone();
    let lock = take_app_lock(handoff);
    Ok(spawn_stream(&state, Filler::Json, lock, move |out| async move {
        if let Err(err) = instances::run_bind(task_state, bind, out, request_id).await {
            warn!(%service, %instance, %app, error = %err, "bind failed");
        }
    }))
}

#[utoipa::path(
    delete,
    path = "/services/{service}/instances/{instance}/{app}",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name"),
        ("app" = String, Path, description = "App name")
    ),
    responses(
        (status = 200, description = "JSON stream of unbind progress", content_type = "application/x-json-stream"),
        (status = 400, description = "App is not bound"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "Instance or app not found")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn unbind_instance(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    handoff: Option<Extension<LockHandoff>>,
    Path((service, instance, app)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let request_id = telemetry::request_id_from_extension(request_id);
    let unbind = instances::prepare_unbind(&state, &principal, &service, &instance, &app).await?;
    let task_state = state.clone();
    let lock = take_app_lock(handoff);
    Ok(spawn_stream(&state, Filler::Json, lock, move |out| async move {
        if let Err(err) = instances::run_unbind(task_state, unbind, out, request_id).await {
            warn!(%service, %instance, %app, error = %err, "unbind failed");
        }
    }))
}

#[utoipa::path(
    put,
    path = "/services/{service}/instances/permission/{instance}/{team}",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name"),
        ("team" = String, Path, description = "Team name")
    ),
    responses(
        (status = 200, description = "Team granted"),
        (status = 404, description = "Instance or team not found"),
        (status = 409, description = "Team already has access")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn grant_team(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((service, instance, team)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    instances::grant_team(&state, &principal, &service, &instance, &team).await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    delete,
    path = "/services/{service}/instances/permission/{instance}/{team}",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name"),
        ("team" = String, Path, description = "Team name")
    ),
    responses(
        (status = 200, description = "Team revoked"),
        (status = 403, description = "The owner team cannot be revoked"),
        (status = 404, description = "Instance not found or team without access")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn revoke_team(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((service, instance, team)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    instances::revoke_team(&state, &principal, &service, &instance, &team).await?;
    Ok(StatusCode::OK)
}
