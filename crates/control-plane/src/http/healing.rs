use std::collections::BTreeMap;

use axum::{
    Extension, Form, Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::Response,
    routing::get,
};
use common::api::{HealerConfigView, HealingEventView};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use super::{json_or_no_content, parse_flag};
use crate::{
    app_state::AppState,
    auth::Principal,
    error::{ApiResult, AppError},
    persistence::HealerConfigUpdate,
    services::healer,
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route(
            "/healing/node",
            get(get_config).post(update_config).delete(delete_config),
        )
        .route("/healing", get(list_history))
}

#[utoipa::path(
    get,
    path = "/healing/node",
    responses(
        (status = 200, description = "Healer config by pool; the empty key is the base entry", body = BTreeMap<String, HealerConfigView>),
        (status = 401, description = "Missing or invalid token")
    ),
    security(("bearer" = [])),
    tag = "healing"
)]
pub(crate) async fn get_config(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<BTreeMap<String, HealerConfigView>>> {
    Ok(Json(healer::get_config(&state, &principal).await?))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub(crate) struct HealerConfigForm {
    /// Pool to configure; the base entry when empty.
    #[serde(default)]
    pub pool: String,
    #[serde(default, rename = "Enabled", alias = "enabled")]
    pub enabled: Option<String>,
    /// Seconds.
    #[serde(default, rename = "MaxUnresponsiveTime", alias = "max_unresponsive_secs")]
    pub max_unresponsive: Option<String>,
    /// Seconds.
    #[serde(default, rename = "MaxTimeSinceSuccess", alias = "max_since_success_secs")]
    pub max_since_success: Option<String>,
}

fn parse_seconds(field: &str, value: Option<String>) -> ApiResult<Option<i64>> {
    match value.filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("invalid value for {field}: {value:?}"))),
    }
}

/// Only the fields present in the form change.
#[utoipa::path(
    post,
    path = "/healing/node",
    request_body(content = HealerConfigForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Config updated"),
        (status = 400, description = "Invalid value"),
        (status = 401, description = "Missing or invalid token")
    ),
    security(("bearer" = [])),
    tag = "healing"
)]
pub(crate) async fn update_config(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Form(form): Form<HealerConfigForm>,
) -> ApiResult<StatusCode> {
    let update = HealerConfigUpdate {
        enabled: form.enabled.as_deref().map(parse_flag),
        max_unresponsive_secs: parse_seconds("MaxUnresponsiveTime", form.max_unresponsive)?,
        max_since_success_secs: parse_seconds("MaxTimeSinceSuccess", form.max_since_success)?,
    };
    healer::update_config(&state, &principal, &form.pool, update).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct DeleteConfigQuery {
    /// Pool entry to change; the base entry when empty.
    #[serde(default)]
    pub pool: String,
    /// Single field to clear; the whole entry when absent.
    pub name: Option<String>,
}

#[utoipa::path(
    delete,
    path = "/healing/node",
    params(DeleteConfigQuery),
    responses(
        (status = 200, description = "Config cleared"),
        (status = 400, description = "Unknown field")
    ),
    security(("bearer" = [])),
    tag = "healing"
)]
pub(crate) async fn delete_config(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<DeleteConfigQuery>,
) -> ApiResult<StatusCode> {
    healer::delete_config(&state, &principal, &query.pool, query.name.as_deref()).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct HistoryQuery {
    /// `node` or `container`.
    pub filter: Option<String>,
}

#[utoipa::path(
    get,
    path = "/healing",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Healing history, newest first", body = [HealingEventView]),
        (status = 204, description = "No healing events"),
        (status = 400, description = "Unknown filter")
    ),
    security(("bearer" = [])),
    tag = "healing"
)]
pub(crate) async fn list_history(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let events = healer::list_history(&state, &principal, query.filter.as_deref()).await?;
    Ok(json_or_no_content(events))
}
