//! Node management. Every route exists with and without a leading
//! `/{provisioner}` segment; the segment is accepted for client compatibility
//! and the provisioner is always taken from the node's pool.

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use common::api::{NodeInfoResponse, NodeListResponse, NodeView};
use serde::Deserialize;
use utoipa::IntoParams;

use super::{FormFields, deserialize_flag};
use crate::{
    app_state::AppState,
    auth::Principal,
    error::ApiResult,
    services::nodes::{self, parse_node_form},
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/node", get(list_nodes).post(add_node).put(update_node))
        .route(
            "/{provisioner}/node",
            get(list_nodes_for).post(add_node_for).put(update_node_for),
        )
        .route("/node/{address}", delete(remove_node).get(node_info))
        .route(
            "/{provisioner}/node/{address}",
            delete(remove_node_for).get(node_info_for),
        )
}

#[utoipa::path(
    get,
    path = "/{provisioner}/node",
    params(("provisioner" = String, Path, description = "Accepted for compatibility")),
    responses(
        (status = 200, description = "Nodes and machines", body = NodeListResponse),
        (status = 204, description = "No nodes and no machines")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn list_nodes(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    let listing = nodes::list_nodes(&state, &principal).await?;
    if listing.nodes.is_empty() && listing.machines.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(listing).into_response())
}

async fn list_nodes_for(
    state: State<AppState>,
    principal: Extension<Principal>,
    Path(_provisioner): Path<String>,
) -> ApiResult<Response> {
    list_nodes(state, principal).await
}

/// Form fields: `register`, `metadata.<key>`, `cacert`, `clientcert`. The
/// address of a registered node is `metadata.address` or `address`.
/// Without `register=true` a machine is created through the IaaS named by
/// `metadata.iaas`.
#[utoipa::path(
    post,
    path = "/{provisioner}/node",
    params(("provisioner" = String, Path, description = "Accepted for compatibility")),
    responses(
        (status = 201, description = "Node added", body = NodeView),
        (status = 400, description = "Invalid address or metadata"),
        (status = 401, description = "Missing or invalid token"),
        (status = 404, description = "Pool not found")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn add_node(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    form: FormFields,
) -> ApiResult<(StatusCode, Json<NodeView>)> {
    let node = nodes::add_node(&state, &principal, parse_node_form(form.0)).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn add_node_for(
    state: State<AppState>,
    principal: Extension<Principal>,
    Path(_provisioner): Path<String>,
    form: FormFields,
) -> ApiResult<(StatusCode, Json<NodeView>)> {
    add_node(state, principal, form).await
}

/// Form fields: `address`, `enable`, `disable`, `metadata.<key>`.
#[utoipa::path(
    put,
    path = "/{provisioner}/node",
    params(("provisioner" = String, Path, description = "Accepted for compatibility")),
    responses(
        (status = 200, description = "Node updated"),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Missing or invalid token"),
        (status = 404, description = "Node or pool not found")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn update_node(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    form: FormFields,
) -> ApiResult<StatusCode> {
    nodes::update_node(&state, &principal, parse_node_form(form.0)).await?;
    Ok(StatusCode::OK)
}

async fn update_node_for(
    state: State<AppState>,
    principal: Extension<Principal>,
    Path(_provisioner): Path<String>,
    form: FormFields,
) -> ApiResult<StatusCode> {
    update_node(state, principal, form).await
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct RemoveNodeQuery {
    /// Also destroy the backing machine.
    #[serde(default, rename = "remove-iaas", deserialize_with = "deserialize_flag")]
    #[param(value_type = Option<bool>)]
    pub remove_iaas: bool,
    /// Skip moving units off the node.
    #[serde(default, rename = "no-rebalance", deserialize_with = "deserialize_flag")]
    #[param(value_type = Option<bool>)]
    pub no_rebalance: bool,
}

#[utoipa::path(
    delete,
    path = "/{provisioner}/node/{address}",
    params(
        ("provisioner" = String, Path, description = "Accepted for compatibility"),
        ("address" = String, Path, description = "Percent-encoded node address"),
        RemoveNodeQuery
    ),
    responses(
        (status = 200, description = "Node removed"),
        (status = 401, description = "Missing or invalid token"),
        (status = 404, description = "Node not found")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn remove_node(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(address): Path<String>,
    Query(query): Query<RemoveNodeQuery>,
) -> ApiResult<StatusCode> {
    nodes::remove_node(
        &state,
        &principal,
        &address,
        query.remove_iaas,
        !query.no_rebalance,
    )
    .await?;
    Ok(StatusCode::OK)
}

async fn remove_node_for(
    state: State<AppState>,
    principal: Extension<Principal>,
    Path((_provisioner, address)): Path<(String, String)>,
    query: Query<RemoveNodeQuery>,
) -> ApiResult<StatusCode> {
    remove_node(state, principal, Path(address), query).await
}

#[utoipa::path(
    get,
    path = "/{provisioner}/node/{address}",
    params(
        ("provisioner" = String, Path, description = "Accepted for compatibility"),
        ("address" = String, Path, description = "Percent-encoded node address")
    ),
    responses(
        (status = 200, description = "Node, backing machine and units", body = NodeInfoResponse),
        (status = 404, description = "Node not found")
    ),
    security(("bearer" = [])),
    tag = "nodes"
)]
pub(crate) async fn node_info(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(address): Path<String>,
) -> ApiResult<Json<NodeInfoResponse>> {
    Ok(Json(nodes::node_info(&state, &principal, &address).await?))
}

async fn node_info_for(
    state: State<AppState>,
    principal: Extension<Principal>,
    Path((_provisioner, address)): Path<(String, String)>,
) -> ApiResult<Json<NodeInfoResponse>> {
    node_info(state, principal, Path(address)).await
}
