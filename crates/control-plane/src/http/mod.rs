//! HTTP surface of the control plane.
//!
//! Every area module exposes `router()`; [`build_router`] merges them behind
//! the auth and app-lock route layers and wraps the result with request ids,
//! tracing, version headers and request metrics.

use std::future::Future;

use axum::{
    Extension, Form, Router,
    extract::{FromRequest, Request},
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Deserializer};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::{
    app_state::AppState,
    auth::require_auth,
    error::AppError,
    lock::{AppLockGuard, LockHandoff},
    metrics::HttpMetricsLayer,
    streaming::{self, Filler, StreamWriter},
};
use common::api;

mod apps;
mod deploys;
mod error_mapper;
pub(crate) use error_mapper::map_service_error;
mod events;
mod healing;
mod iaas;
pub mod middleware;
mod nodes;
mod pools;
mod proxy;
mod services;
mod system;
mod tokens;

pub fn build_router(state: AppState) -> Router<AppState> {
    let request_id_header = state.broker.request_id_header().clone();
    let authenticated = Router::<AppState>::new()
        .merge(apps::router())
        .merge(deploys::router(&state))
        .merge(nodes::router())
        .merge(pools::router())
        .merge(iaas::router())
        .merge(healing::router())
        .merge(services::router())
        .merge(proxy::router())
        .merge(events::router())
        .merge(tokens::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::app_lock,
        ))
        .route_layer(axum_middleware::from_fn_with_state(state, require_auth));

    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            request_id_header.clone(),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header))
        .layer(TraceLayer::new_for_http())
        .layer(axum_middleware::from_fn(middleware::version_headers))
        .layer(HttpMetricsLayer::new());

    Router::<AppState>::new()
        .merge(system::router())
        .merge(authenticated)
        .layer(middleware_stack)
}

pub fn build_metrics_router() -> Router<AppState> {
    system::metrics_router()
}

/// Form body kept as ordered pairs, for forms with repeated or free-form keys.
#[derive(Debug, Clone, Default)]
pub(crate) struct FormFields(pub Vec<(String, String)>);

impl FormFields {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// Non-empty value of `key`.
    pub fn optional(&self, key: &str) -> Option<String> {
        self.get(key)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn all(&self, key: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(name, value)| name == key && !value.is_empty())
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(parse_flag)
    }
}

impl<S> FromRequest<S> for FormFields
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Form(pairs) = Form::<Vec<(String, String)>>::from_request(req, state)
            .await
            .map_err(|err| AppError::bad_request(err.body_text()))?;
        Ok(Self(pairs))
    }
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

/// Lenient boolean for form and query fields: `true`, `1` and `yes` are set.
pub(crate) fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.as_deref().is_some_and(parse_flag))
}

/// 204 for empty listings, JSON otherwise.
pub(crate) fn json_or_no_content<T: serde::Serialize>(items: Vec<T>) -> Response {
    if items.is_empty() {
        StatusCode::NO_CONTENT.into_response()
    } else {
        axum::Json(items).into_response()
    }
}

/// Take the app lock the lock middleware holds for this request.
pub(crate) fn take_app_lock(handoff: Option<Extension<LockHandoff>>) -> Option<AppLockGuard> {
    handoff.and_then(|Extension(handoff)| handoff.take())
}

/// Run `work` in the background and stream what it writes.
///
/// `lock` is released when `work` ends, whether or not the client is still
/// reading.
pub(crate) fn spawn_stream<F, Fut>(
    state: &AppState,
    filler: Filler,
    lock: Option<AppLockGuard>,
    work: F,
) -> Response
where
    F: FnOnce(StreamWriter) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (writer, rx) = streaming::channel();
    let task = work(writer);
    tokio::spawn(async move {
        task.await;
        if let Some(lock) = lock {
            lock.release().await;
        }
    });
    streaming::stream_response(rx, state.keepalive_interval(), filler)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        system::healthz,
        apps::create_app,
        apps::list_apps,
        apps::get_app,
        apps::delete_app,
        apps::get_env,
        apps::set_env,
        apps::unset_env,
        apps::add_units,
        apps::remove_units,
        deploys::deploy,
        deploys::clone_repository,
        deploys::rollback,
        deploys::save_diff,
        deploys::list_deploys,
        deploys::get_deploy,
        nodes::list_nodes,
        nodes::add_node,
        nodes::update_node,
        nodes::remove_node,
        nodes::node_info,
        pools::list_pools,
        pools::create_pool,
        pools::delete_pool,
        pools::add_team,
        pools::remove_team,
        iaas::list_machines,
        iaas::delete_machine,
        iaas::list_templates,
        iaas::save_template,
        iaas::delete_template,
        healing::get_config,
        healing::update_config,
        healing::delete_config,
        healing::list_history,
        services::list_services,
        services::create_service,
        services::delete_service,
        services::list_plans,
        services::list_instances,
        services::create_instance,
        services::update_instance,
        services::instance_info,
        services::instance_status,
        services::delete_instance,
        services::bind_instance,
        services::unbind_instance,
        services::grant_team,
        services::revoke_team,
        proxy::proxy_instance,
        events::list_events,
        events::get_event,
        tokens::issue_api_key,
        tokens::issue_session_token,
        tokens::issue_app_token,
        tokens::revoke_token,
    ),
    components(schemas(
        api::StreamFrame,
        api::DeployKind,
        api::DeployData,
        api::AppLock,
        api::EnvVar,
        api::AppInfo,
        api::NodeStatus,
        api::NodeView,
        api::MachineView,
        api::TemplateView,
        api::NodeListResponse,
        api::NodeInfoResponse,
        api::UnitView,
        api::PoolView,
        api::HealerConfigView,
        api::HealingEventView,
        api::ServiceView,
        api::ServicePlan,
        api::ServiceInstanceInfo,
        api::EventTarget,
        api::EventView,
        system::HealthResponse,
        apps::CreateAppForm,
        deploys::RollbackForm,
        deploys::DiffForm,
        pools::CreatePoolForm,
        pools::TeamForm,
        iaas::TemplateRequest,
        healing::HealerConfigForm,
        services::CreateServiceForm,
        tokens::TokenResponse,
        tokens::ApiKeyResponse,
    )),
    tags(
        (name = "system", description = "Health and metrics"),
        (name = "apps", description = "Application lifecycle"),
        (name = "deploys", description = "Deploy pipeline and history"),
        (name = "nodes", description = "Nodes, machines and templates"),
        (name = "pools", description = "Pools"),
        (name = "healing", description = "Node healer configuration and history"),
        (name = "services", description = "Service catalog, instances and bindings"),
        (name = "events", description = "Event log"),
        (name = "tokens", description = "Session, app and API tokens"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.info.title = "PaaS Control Plane API".to_string();
        openapi.info.version = crate::version::FULL_VERSION.to_string();

        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_schemes_from_iter([(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("opaque")
                    .description(Some(
                        "User session token, user API key or app token (Authorization header).",
                    ))
                    .build(),
            ),
        )]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_fields_helpers() {
        let fields = FormFields(vec![
            ("tag".into(), "a".into()),
            ("name".into(), "db".into()),
            ("tag".into(), "".into()),
            ("tag".into(), "b".into()),
            ("unbind".into(), "1".into()),
            ("plan".into(), "".into()),
        ]);
        assert_eq!(fields.string("name"), "db");
        assert_eq!(fields.all("tag"), vec!["a".to_string(), "b".to_string()]);
        assert!(fields.flag("unbind"));
        assert!(!fields.flag("missing"));
        assert_eq!(fields.optional("plan"), None);
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("true"));
        assert!(parse_flag("True"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn openapi_lists_core_paths() {
        let doc = ApiDoc::openapi();
        for path in [
            "/apps/{app}/deploy",
            "/deploys/{id}",
            "/{provisioner}/node",
            "/services/{service}/instances/{instance}",
            "/healing/node",
            "/events",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
        assert_eq!(doc.info.title, "PaaS Control Plane API");
    }
}
