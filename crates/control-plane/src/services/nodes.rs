use std::collections::{BTreeMap, HashSet};

use common::api::{NodeInfoResponse, NodeListResponse, NodeView, UnitView};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError};
use crate::events::{self, Allowed, EventOpts, targets};
use crate::iaas::{self, machine_view};
use crate::permission::{ContextType, PermissionContext, schemes};
use crate::persistence::{MachineRecord, machines, nodes as node_store, pools};
use crate::provision::{
    AddNodeOptions, Node, RemoveNodeOptions, UpdateNodeOptions, metadata_keys, node_capability,
};

pub const NODE_NOT_FOUND: &str = "Node not found.";

/// Node form as posted by clients: `Metadata.<key>` entries plus flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeForm {
    pub address: String,
    pub register: bool,
    pub enable: bool,
    pub disable: bool,
    pub metadata: BTreeMap<String, String>,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

pub fn parse_node_form(pairs: impl IntoIterator<Item = (String, String)>) -> NodeForm {
    let mut form = NodeForm::default();
    for (key, value) in pairs {
        let lower = key.to_ascii_lowercase();
        if lower.starts_with("metadata.") {
            form.metadata.insert(key["metadata.".len()..].to_string(), value);
            continue;
        }
        match lower.as_str() {
            "address" => form.address = value,
            "register" => form.register = parse_flag(&value),
            "enable" => form.enable = parse_flag(&value),
            "disable" => form.disable = parse_flag(&value),
            "cacert" => form.ca_cert = Some(value).filter(|v| !v.is_empty()),
            "clientcert" => form.client_cert = Some(value).filter(|v| !v.is_empty()),
            _ => {}
        }
    }
    form
}

pub fn validate_address(address: &str) -> ApiResult<()> {
    if address.is_empty() {
        return Err(AppError::bad_request("address=url parameter is required"));
    }
    let url = Url::parse(address)
        .map_err(|err| AppError::bad_request(format!("Invalid address url: {err}")))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::bad_request(
            "Invalid address url: host cannot be empty",
        ));
    }
    if !url.scheme().starts_with("http") {
        return Err(AppError::bad_request(
            "Invalid address url: scheme must be http[s]",
        ));
    }
    Ok(())
}

fn host_of(address: &str) -> String {
    Url::parse(address)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| address.to_string())
}

fn pool_context(pool: &str) -> PermissionContext {
    PermissionContext::pool(pool)
}

async fn find_node(state: &AppState, address: &str) -> ApiResult<(String, Node)> {
    match state.provisioners.find_node(address).await? {
        Some((provisioner, node)) => Ok((provisioner.name().to_string(), node)),
        None => Err(AppError::not_found(NODE_NOT_FOUND)),
    }
}

async fn backing_machine(state: &AppState, node: &Node) -> ApiResult<Option<MachineRecord>> {
    if let Some(id) = node.iaas_id() {
        return Ok(machines::get_machine(&state.db, id).await?);
    }
    Ok(machines::find_by_address(&state.db, &host_of(&node.address)).await?)
}

/// Register an existing host, or create one through an IaaS backend first.
pub async fn add_node(state: &AppState, principal: &Principal, form: NodeForm) -> ApiResult<NodeView> {
    let mut metadata = iaas::expand_template(&state.db, form.metadata).await?;
    let pool_name = metadata
        .remove(metadata_keys::POOL)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::bad_request("pool is required"))?;
    principal.require(schemes::NODE_CREATE, &[pool_context(&pool_name)])?;
    let iaas_name = metadata.get(metadata_keys::IAAS).cloned();
    if !form.register {
        let backend = state.iaas.get(iaas_name.as_deref())?;
        principal.require(
            schemes::MACHINE_CREATE,
            &[PermissionContext::iaas(backend.name())],
        )?;
    }

    let pool = pools::get_pool(&state.db, &pool_name)
        .await?
        .ok_or_else(|| AppError::not_found("Pool not found."))?;
    let provisioner = state.provisioners.for_pool_provisioner(&pool.provisioner)?;
    let node_provisioner = node_capability(provisioner.as_ref())?;

    let (address, machine, ca_cert, client_cert) = if form.register {
        let address = metadata
            .remove(metadata_keys::ADDRESS)
            .filter(|a| !a.is_empty())
            .unwrap_or(form.address);
        (address, None, form.ca_cert, form.client_cert)
    } else {
        let mut params = metadata.clone();
        params.insert(metadata_keys::POOL.to_string(), pool_name.clone());
        let machine = iaas::create_machine(&state.db, &state.iaas, params)
            .await
            .map_err(|err| annotate(state, iaas_name.as_deref(), err))?;
        metadata.insert(metadata_keys::IAAS_ID.to_string(), machine.id.clone());
        metadata.insert(metadata_keys::IAAS.to_string(), machine.iaas.clone());
        let address = format!(
            "{}://{}:{}",
            state.iaas_config.node_protocol, machine.address, state.iaas_config.node_port
        );
        let (ca, client) = (machine.ca_cert.clone(), machine.client_cert.clone());
        (address, Some(machine), ca, client)
    };

    let result: ApiResult<Node> = async {
        validate_address(&address)?;
        if let Some((existing, _)) = state.provisioners.find_node(&address).await? {
            return Err(AppError::conflict(format!(
                "node with address {address:?} already exists in provisioner {:?}",
                existing.name()
            )));
        }

        let event = events::open(
            &state.db,
            &state.lock,
            EventOpts::new(
                targets::NODE,
                address.clone(),
                schemes::NODE_CREATE,
                principal,
                Allowed::new(schemes::NODE_READ_EVENTS, vec![pool_context(&pool_name)]),
            )
            .with_data(json!({
                "pool": pool_name,
                "register": form.register,
                "metadata": metadata,
            })),
        )
        .await?;
        let added = node_provisioner
            .add_node(AddNodeOptions {
                address: address.clone(),
                pool: pool_name.clone(),
                metadata: metadata.clone(),
                ca_cert,
                client_cert,
            })
            .await
            .map_err(|err| annotate(state, iaas_name.as_deref(), AppError::bad_request(err.to_string())));
        event
            .done(added.as_ref().err().map(|err| err.message.as_str()))
            .await;
        added?;

        node_provisioner
            .get_node(&address)
            .await?
            .ok_or_else(|| AppError::internal("node vanished after registration"))
    }
    .await;

    match result {
        Ok(node) => {
            info!(address = %node.address, pool = %node.pool, provisioner = provisioner.name(), "node added");
            Ok(node.to_view(provisioner.name()))
        }
        Err(err) => {
            if let Some(machine) = machine
                && let Err(cleanup) = iaas::destroy_machine(&state.db, &state.iaas, &machine).await
            {
                warn!(?cleanup, machine_id = %machine.id, "failed to destroy machine of rejected node");
            }
            Err(err)
        }
    }
}

/// Append the backend's usage notes so operators can fix their params.
fn annotate(state: &AppState, iaas_name: Option<&str>, mut err: AppError) -> AppError {
    let description = state.iaas.describe(iaas_name);
    if !description.is_empty() {
        err.message = format!("{}\n\nInstructions:\n{description}", err.message);
    }
    err
}

pub async fn remove_node(
    state: &AppState,
    principal: &Principal,
    address: &str,
    remove_iaas: bool,
    rebalance: bool,
) -> ApiResult<()> {
    if address.is_empty() {
        return Err(AppError::bad_request("Node address is required."));
    }
    let (provisioner_name, node) = find_node(state, address).await?;
    principal.require(schemes::NODE_DELETE, &[pool_context(&node.pool)])?;
    let machine = if remove_iaas {
        let machine = backing_machine(state, &node).await?;
        if let Some(machine) = &machine {
            principal.require(
                schemes::MACHINE_DELETE,
                &[PermissionContext::iaas(machine.iaas.clone())],
            )?;
        }
        machine
    } else {
        None
    };

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::NODE,
            node.address.clone(),
            schemes::NODE_DELETE,
            principal,
            Allowed::new(schemes::NODE_READ_EVENTS, vec![pool_context(&node.pool)]),
        )
        .with_data(json!({ "remove-iaas": remove_iaas, "rebalance": rebalance })),
    )
    .await?;

    let result = async {
        let provisioner = state.provisioners.get(&provisioner_name)?;
        node_capability(provisioner.as_ref())?
            .remove_node(RemoveNodeOptions {
                address: node.address.clone(),
                rebalance,
            })
            .await?;
        if let Some(machine) = &machine {
            iaas::destroy_machine(&state.db, &state.iaas, machine).await?;
        }
        Ok::<_, AppError>(())
    }
    .await;
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result?;
    info!(address = %node.address, remove_iaas, rebalance, "node removed");
    Ok(())
}

/// Move a node between pools, toggle it, or edit its metadata.
///
/// A `pool` metadata entry moves the node; empty metadata values delete keys.
pub async fn update_node(state: &AppState, principal: &Principal, form: NodeForm) -> ApiResult<()> {
    if form.enable && form.disable {
        return Err(AppError::bad_request(
            "A node can't be enabled and disabled simultaneously.",
        ));
    }
    if form.address.is_empty() {
        return Err(AppError::bad_request("address is required"));
    }
    let (provisioner_name, node) = find_node(state, &form.address).await?;
    principal.require(schemes::NODE_UPDATE, &[pool_context(&node.pool)])?;

    let mut metadata = form.metadata;
    let new_pool = metadata.remove(metadata_keys::POOL).filter(|p| !p.is_empty());
    let mut allowed = vec![pool_context(&node.pool)];
    if let Some(pool) = &new_pool {
        principal.require(schemes::NODE_UPDATE, &[pool_context(pool)])?;
        if pools::get_pool(&state.db, pool).await?.is_none() {
            return Err(AppError::not_found("Pool not found."));
        }
        allowed.push(pool_context(pool));
    }

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::NODE,
            node.address.clone(),
            schemes::NODE_UPDATE,
            principal,
            Allowed::new(schemes::NODE_READ_EVENTS, allowed),
        )
        .with_data(json!({
            "pool": new_pool,
            "metadata": metadata,
            "enable": form.enable,
            "disable": form.disable,
        })),
    )
    .await?;
    let result = async {
        let provisioner = state.provisioners.get(&provisioner_name)?;
        node_capability(provisioner.as_ref())?
            .update_node(UpdateNodeOptions {
                address: node.address.clone(),
                pool: new_pool,
                metadata,
                enable: form.enable,
                disable: form.disable,
            })
            .await?;
        Ok::<_, AppError>(())
    }
    .await;
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result
}

/// Nodes of every node provisioner the caller may read, plus orphan machines.
///
/// A provisioner that fails to list shows up as a pseudo-node whose status
/// starts with `ERROR:`.
pub async fn list_nodes(state: &AppState, principal: &Principal) -> ApiResult<NodeListResponse> {
    let readable_pools = principal.values_for(schemes::NODE_READ, ContextType::Pool);
    let mut views = Vec::new();
    let mut node_hosts = HashSet::new();
    let mut machine_ids = HashSet::new();

    for provisioner in state.provisioners.node_provisioners() {
        let Some(capability) = provisioner.as_node_provisioner() else {
            continue;
        };
        match capability.list_nodes().await {
            Ok(nodes) => {
                for node in nodes {
                    if let Some(id) = node.iaas_id() {
                        machine_ids.insert(id.to_string());
                    }
                    node_hosts.insert(host_of(&node.address));
                    if readable_pools
                        .as_ref()
                        .is_none_or(|pools| pools.contains(&node.pool))
                    {
                        views.push(node.to_view(provisioner.name()));
                    }
                }
            }
            Err(err) => {
                warn!(?err, provisioner = provisioner.name(), "listing nodes failed");
                if readable_pools.is_none() {
                    views.push(NodeView {
                        address: format!("{} nodes", provisioner.name()),
                        pool: String::new(),
                        provisioner: provisioner.name().to_string(),
                        status: format!("ERROR: {err}"),
                        metadata: BTreeMap::new(),
                    });
                }
            }
        }
    }

    let readable_iaas = principal.values_for(schemes::MACHINE_READ, ContextType::Iaas);
    let machines = machines::list_machines(&state.db)
        .await?
        .iter()
        .filter(|machine| !machine_ids.contains(&machine.id) && !node_hosts.contains(&machine.address))
        .filter(|machine| {
            readable_iaas
                .as_ref()
                .is_none_or(|names| names.contains(&machine.iaas))
        })
        .map(machine_view)
        .collect();

    Ok(NodeListResponse {
        nodes: views,
        machines,
    })
}

pub async fn node_info(
    state: &AppState,
    principal: &Principal,
    address: &str,
) -> ApiResult<NodeInfoResponse> {
    let (provisioner_name, node) = find_node(state, address).await?;
    principal.require(schemes::NODE_READ, &[pool_context(&node.pool)])?;
    let machine = backing_machine(state, &node).await?;
    let units = node_store::list_units_on_node(&state.db, &node.address)
        .await?
        .into_iter()
        .map(|unit| UnitView {
            id: unit.id,
            app: unit.app,
            node: unit.node_address,
            ip: unit.ip,
            status: unit.status,
        })
        .collect();
    Ok(NodeInfoResponse {
        node: node.to_view(&provisioner_name),
        machine: machine.as_ref().map(machine_view),
        units,
    })
}
