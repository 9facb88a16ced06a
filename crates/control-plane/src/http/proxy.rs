use axum::{
    Extension, Router,
    body::Body,
    extract::{Path, Query, Request, State},
    response::Response,
    routing::any,
};
use serde::Deserialize;
use tower_http::request_id::RequestId;
use utoipa::IntoParams;

use crate::{
    app_state::AppState,
    auth::Principal,
    broker::is_stripped_header,
    error::{ApiResult, AppError},
    services::service_instances,
    telemetry,
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new().route(
        "/services/{service}/proxy/{instance}",
        any(proxy_instance),
    )
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct ProxyQuery {
    /// Broker path, relative to `/resources/<instance>` unless it already
    /// starts there.
    #[serde(default)]
    pub callback: String,
}

/// Forwards the request to the instance's broker and streams the answer back
/// with its status, whatever it is.
#[utoipa::path(
    get,
    path = "/services/{service}/proxy/{instance}",
    params(
        ("service" = String, Path, description = "Service name"),
        ("instance" = String, Path, description = "Instance name"),
        ProxyQuery
    ),
    responses(
        (status = 200, description = "Broker response, passed through"),
        (status = 400, description = "Missing or invalid callback"),
        (status = 403, description = "Permission denied or bind endpoint"),
        (status = 404, description = "Service or instance not found"),
        (status = 502, description = "Broker unreachable")
    ),
    security(("bearer" = [])),
    tag = "services"
)]
pub(crate) async fn proxy_instance(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    request_id: Option<Extension<RequestId>>,
    Path((service, instance)): Path<(String, String)>,
    Query(query): Query<ProxyQuery>,
    req: Request,
) -> ApiResult<Response> {
    let request_id = telemetry::request_id_from_extension(request_id);
    let (parts, body) = req.into_parts();
    let body = reqwest::Body::wrap_stream(body.into_data_stream());

    let upstream = service_instances::proxy(
        &state,
        &principal,
        &service,
        &instance,
        parts.method,
        &query.callback,
        &parts.headers,
        body,
        request_id,
    )
    .await?;

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_stripped_header(name) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|err| AppError::internal(&format!("building proxy response: {err}")))
}
