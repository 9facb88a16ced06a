//! Service instances and their bindings to apps.
//!
//! Operations that stream progress are split like deploys: `prepare_*` does
//! lookups, permission checks and opens the instance event, `run_*` talks to
//! the broker from inside the streaming task.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use axum::http::{HeaderMap, Method};
use common::api::ServiceInstanceInfo;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::broker::{BrokerError, CreateParams, Endpoint};
use crate::error::{ApiResult, AppError, is_unique_violation};
use crate::events::{self, Allowed, Event, EventOpts, targets};
use crate::permission::{ContextType, PermissionContext, schemes};
use crate::persistence::{
    AppRecord, EnvEntry, InstanceChanges, InstanceFilter, InstanceRecord, NewInstance,
    ServiceRecord, apps as app_store, services, users,
};
use crate::provision::Unit;
use crate::services::apps::{self, app_contexts};
use crate::services::catalog;
use crate::streaming::StreamWriter;

static INSTANCE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][-a-zA-Z0-9_]+$").expect("instance name pattern"));

pub const INSTANCE_NOT_FOUND: &str = "Service instance not found.";
pub const BOUND_APPS_MESSAGE: &str =
    "This service instance has binded apps. Unbind them before removing it";
pub const REMOVED_MESSAGE: &str = "service instance successfuly removed";

#[derive(Debug, Clone, Default)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub plan: String,
    pub team_owner: Option<String>,
    pub description: String,
    pub tags: Vec<String>,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct UpdateInstanceRequest {
    pub description: Option<String>,
    pub team_owner: Option<String>,
    pub tags: Option<Vec<String>>,
    pub plan: Option<String>,
}

/// Instance operation holding its open event.
#[derive(Debug)]
pub struct InstanceOp {
    pub service: ServiceRecord,
    pub instance: InstanceRecord,
    pub event: Event,
}

#[derive(Debug)]
pub struct BindOp {
    pub op: InstanceOp,
    pub app: AppRecord,
    pub no_restart: bool,
}

fn instance_key(instance: &InstanceRecord) -> String {
    format!("{}/{}", instance.service_name, instance.name)
}

/// Contexts an instance-scoped permission is checked against.
pub fn instance_contexts(instance: &InstanceRecord) -> Vec<PermissionContext> {
    let mut contexts = vec![PermissionContext::service_instance(
        &instance.service_name,
        &instance.name,
    )];
    let teams: BTreeSet<&String> = instance
        .teams
        .0
        .iter()
        .chain(std::iter::once(&instance.team_owner))
        .collect();
    contexts.extend(teams.into_iter().cloned().map(PermissionContext::team));
    contexts
}

pub fn to_info(instance: InstanceRecord) -> ServiceInstanceInfo {
    ServiceInstanceInfo {
        service_name: instance.service_name,
        name: instance.name,
        plan_name: instance.plan_name,
        description: instance.description,
        team_owner: instance.team_owner,
        teams: instance.teams.0,
        apps: instance.apps.0,
        tags: instance.tags.0,
        custom_info: Default::default(),
    }
}

pub async fn get_instance(state: &AppState, service: &str, name: &str) -> ApiResult<InstanceRecord> {
    services::get_instance(&state.db, service, name)
        .await?
        .ok_or_else(|| AppError::not_found(INSTANCE_NOT_FOUND))
}

async fn open_event(
    state: &AppState,
    principal: &Principal,
    instance: &InstanceRecord,
    kind: &str,
    custom_data: serde_json::Value,
) -> ApiResult<Event> {
    events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::SERVICE_INSTANCE,
            instance_key(instance),
            kind,
            principal,
            Allowed::new(schemes::SERVICE_INSTANCE_READ_EVENTS, instance_contexts(instance)),
        )
        .with_data(custom_data),
    )
    .await
}

pub async fn list_visible(
    state: &AppState,
    principal: &Principal,
    filter: &InstanceFilter,
) -> ApiResult<Vec<ServiceInstanceInfo>> {
    Ok(services::list_instances(&state.db, filter)
        .await?
        .into_iter()
        .filter(|instance| {
            principal.allows(schemes::SERVICE_INSTANCE_READ, &instance_contexts(instance))
        })
        .map(to_info)
        .collect())
}

async fn resolve_team_owner(
    state: &AppState,
    principal: &Principal,
    requested: Option<String>,
) -> ApiResult<String> {
    if let Some(team) = requested.filter(|t| !t.is_empty()) {
        return Ok(team);
    }
    let teams = match principal.values_for(schemes::SERVICE_INSTANCE_CREATE, ContextType::Team) {
        Some(teams) => teams,
        None => users::list_teams(&state.db).await?,
    };
    match teams.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(AppError::permission_denied()),
        _ => Err(AppError::bad_request(
            "You must provide a team to execute this action.",
        )),
    }
}

pub async fn create(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    req: CreateInstanceRequest,
    request_id: Option<String>,
) -> ApiResult<InstanceRecord> {
    let service = catalog::get_service(state, service_name).await?;
    if !INSTANCE_NAME.is_match(&req.name) {
        return Err(AppError::bad_request(
            "Invalid service instance name, it should start with a letter and contain only letters, numbers, dashes or underscores.",
        ));
    }
    let team = resolve_team_owner(state, principal, req.team_owner.clone()).await?;
    if !users::team_exists(&state.db, &team).await? {
        return Err(AppError::not_found("Team not found."));
    }
    principal.require(
        schemes::SERVICE_INSTANCE_CREATE,
        &[
            PermissionContext::team(team.clone()),
            PermissionContext::service(service.name.clone()),
        ],
    )?;
    if service.is_restricted
        && !service.teams.0.contains(&team)
        && !service.owner_teams.0.contains(&team)
    {
        return Err(AppError::forbidden(format!(
            "service {:?} is restricted and team {team:?} has no access to it",
            service.name
        )));
    }
    if services::get_instance(&state.db, &service.name, &req.name)
        .await?
        .is_some()
    {
        return Err(AppError::conflict("service instance already exists."));
    }

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::SERVICE_INSTANCE,
            format!("{}/{}", service.name, req.name),
            schemes::SERVICE_INSTANCE_CREATE,
            principal,
            Allowed::new(
                schemes::SERVICE_INSTANCE_READ_EVENTS,
                vec![
                    PermissionContext::service_instance(&service.name, &req.name),
                    PermissionContext::team(team.clone()),
                ],
            ),
        )
        .with_data(json!({
            "name": req.name,
            "plan": req.plan,
            "team": team,
            "description": req.description,
            "tags": req.tags,
        })),
    )
    .await?;

    let result = create_inner(state, principal, &service, &team, req, request_id).await;
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result
}

async fn create_inner(
    state: &AppState,
    principal: &Principal,
    service: &ServiceRecord,
    team: &str,
    req: CreateInstanceRequest,
    request_id: Option<String>,
) -> ApiResult<InstanceRecord> {
    let endpoint = state.broker.endpoint(service, request_id)?;
    endpoint
        .create(&CreateParams {
            name: req.name.clone(),
            plan: req.plan.clone(),
            team: team.to_string(),
            user: principal.name().to_string(),
            description: req.description.clone(),
            tags: req.tags.clone(),
        })
        .await?;

    let inserted = services::insert_instance(
        &state.db,
        NewInstance {
            service_name: service.name.clone(),
            name: req.name.clone(),
            plan_name: req.plan,
            description: req.description,
            team_owner: team.to_string(),
            tags: req.tags,
        },
    )
    .await;
    match inserted {
        Ok(instance) => {
            info!(service = %service.name, instance = %instance.name, team, "service instance created");
            Ok(instance)
        }
        Err(err) => {
            if let Err(cleanup) = endpoint.destroy(&req.name).await {
                warn!(?cleanup, service = %service.name, instance = %req.name, "failed to roll back broker instance");
            }
            if is_unique_violation(&err) {
                Err(AppError::conflict("service instance already exists."))
            } else {
                Err(err.into())
            }
        }
    }
}

pub async fn update(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    req: UpdateInstanceRequest,
) -> ApiResult<()> {
    let instance = get_instance(state, service_name, name).await?;
    principal.require(
        schemes::SERVICE_INSTANCE_UPDATE_DESCRIPTION,
        &instance_contexts(&instance),
    )?;
    let mut teams = instance.teams.0.clone();
    let team_owner = match req.team_owner.filter(|t| !t.is_empty()) {
        Some(team) if team != instance.team_owner => {
            if !users::team_exists(&state.db, &team).await? {
                return Err(AppError::bad_request(format!("team {team:?} not found")));
            }
            if !teams.contains(&team) {
                teams.push(team.clone());
            }
            team
        }
        _ => instance.team_owner.clone(),
    };

    let changes = InstanceChanges {
        description: req.description.unwrap_or_else(|| instance.description.clone()),
        team_owner,
        tags: req.tags.unwrap_or_else(|| instance.tags.0.clone()),
        plan_name: req
            .plan
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| instance.plan_name.clone()),
        teams,
    };
    let event = open_event(
        state,
        principal,
        &instance,
        schemes::SERVICE_INSTANCE_UPDATE_DESCRIPTION,
        json!({
            "description": changes.description,
            "teamOwner": changes.team_owner,
            "tags": changes.tags,
            "plan": changes.plan_name,
        }),
    )
    .await?;
    let result = services::update_instance(&state.db, service_name, name, &changes).await;
    event
        .done(result.as_ref().err().map(|err| err.to_string()).as_deref())
        .await;
    result?;
    Ok(())
}

/// Checks run before a delete stream starts. Bound apps without
/// `unbind_all` fail with `bound` before the broker is contacted.
pub async fn prepare_delete(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    unbind_all: bool,
) -> ApiResult<InstanceOp> {
    let service = catalog::get_service(state, service_name).await?;
    let instance = get_instance(state, service_name, name).await?;
    principal.require(schemes::SERVICE_INSTANCE_DELETE, &instance_contexts(&instance))?;
    if !instance.apps.0.is_empty() && !unbind_all {
        return Err(AppError::bound(BOUND_APPS_MESSAGE));
    }
    let event = open_event(
        state,
        principal,
        &instance,
        schemes::SERVICE_INSTANCE_DELETE,
        json!({ "unbindall": unbind_all }),
    )
    .await?;
    Ok(InstanceOp {
        service,
        instance,
        event,
    })
}

pub async fn run_delete(
    state: AppState,
    op: InstanceOp,
    out: StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let InstanceOp {
        service,
        instance,
        event,
    } = op;
    let result = delete_inner(&state, &service, &instance, &out, request_id).await;
    match &result {
        Ok(()) => {
            out.message(REMOVED_MESSAGE).await;
            event.done(None).await;
        }
        Err(err) => {
            out.error(err.message.clone()).await;
            event.done(Some(&err.message)).await;
        }
    }
    result
}

async fn delete_inner(
    state: &AppState,
    service: &ServiceRecord,
    instance: &InstanceRecord,
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let endpoint = state.broker.endpoint(service, request_id)?;
    for app_name in &instance.apps.0 {
        let app = app_store::get_app(&state.db, app_name).await?;
        unbind_one(state, &endpoint, instance, app_name, app.as_ref(), out).await?;
    }

    match endpoint.destroy(&instance.name).await {
        Ok(()) => {}
        Err(BrokerError::InstanceNotFound) => {
            warn!(service = %service.name, instance = %instance.name, "instance already gone at broker");
        }
        Err(err) => return Err(err.into()),
    }
    services::delete_instance(&state.db, &service.name, &instance.name).await?;
    info!(service = %service.name, instance = %instance.name, "service instance removed");
    Ok(())
}

/// Remove broker binds of `app_name`, then the local bookkeeping.
async fn unbind_one(
    state: &AppState,
    endpoint: &Endpoint,
    instance: &InstanceRecord,
    app_name: &str,
    app: Option<&AppRecord>,
    out: &StreamWriter,
) -> ApiResult<()> {
    out.message(format!(
        "Unbinding app {app_name:?} from service instance {:?}",
        instance.name
    ))
    .await;

    let mut removed_units = Vec::new();
    if let Some(app) = app {
        let provisioner = apps::app_provisioner(state, app).await?;
        let units = provisioner
            .units(app)
            .await
            .map_err(|err| AppError::upstream(format!("failed to list units: {err}")))?;
        for unit in units.iter().filter(|unit| instance.units.0.contains(&unit.id)) {
            match endpoint.unbind_unit(&instance.name, app_name, &unit.ip).await {
                Ok(()) | Err(BrokerError::InstanceNotFound) => {}
                Err(err) => return Err(err.into()),
            }
            out.message(format!(" ---> Removed bind for unit {}", unit.id)).await;
            removed_units.push(unit.id.clone());
        }
    }
    endpoint.unbind_app(&instance.name, app_name).await?;

    if let Some(current) =
        services::get_instance(&state.db, &instance.service_name, &instance.name).await?
    {
        let apps: Vec<String> = current
            .apps
            .0
            .into_iter()
            .filter(|bound| bound != app_name)
            .collect();
        let units: Vec<String> = current
            .units
            .0
            .into_iter()
            .filter(|unit| !removed_units.contains(unit))
            .collect();
        services::set_bindings(
            &state.db,
            &instance.service_name,
            &instance.name,
            &apps,
            &units,
        )
        .await?;
    }

    if let Some(mut fresh) = app_store::get_app(&state.db, app_name).await? {
        let key = instance_key(instance);
        let before = fresh.env.0.len();
        fresh
            .env
            .0
            .retain(|_, entry| entry.instance.as_deref() != Some(key.as_str()));
        if fresh.env.0.len() != before {
            app_store::set_env(&state.db, app_name, &fresh.env.0).await?;
        }
    }

    out.message(format!(
        "Instance {:?} is not bound to the app {app_name:?} anymore.",
        instance.name
    ))
    .await;
    info!(instance = %instance_key(instance), app = app_name, "app unbound");
    Ok(())
}

/// Unbind `app` from every instance it is bound to. Used when the app goes away.
pub async fn detach_app(
    state: &AppState,
    app: &AppRecord,
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let filter = InstanceFilter {
        service: None,
        app: Some(app.name.clone()),
    };
    for instance in services::list_instances(&state.db, &filter).await? {
        let service = catalog::get_service(state, &instance.service_name).await?;
        let endpoint = state.broker.endpoint(&service, request_id.clone())?;
        unbind_one(state, &endpoint, &instance, &app.name, Some(app), out).await?;
    }
    Ok(())
}

/// Bind freshly started units of `app` on every instance the app is bound to.
///
/// Broker refusals are reported on the stream and leave the unit unbound.
pub async fn bind_units(
    state: &AppState,
    app: &AppRecord,
    units: &[Unit],
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    if units.is_empty() {
        return Ok(());
    }
    let filter = InstanceFilter {
        service: None,
        app: Some(app.name.clone()),
    };
    for instance in services::list_instances(&state.db, &filter).await? {
        let service = catalog::get_service(state, &instance.service_name).await?;
        let endpoint = state.broker.endpoint(&service, request_id.clone())?;
        let mut unit_ids = instance.units.0.clone();
        for unit in units {
            match endpoint.bind_unit(&instance.name, &app.name, &unit.ip).await {
                Ok(()) => {
                    if !unit_ids.contains(&unit.id) {
                        unit_ids.push(unit.id.clone());
                    }
                    out.message(format!(
                        " ---> Bound unit {} to {}",
                        unit.id,
                        instance_key(&instance)
                    ))
                    .await;
                }
                Err(err) => {
                    warn!(%err, unit = %unit.id, instance = %instance_key(&instance), "failed to bind unit");
                    out.message(format!(
                        " ---> Unit {} not bound to {}: {err}",
                        unit.id,
                        instance_key(&instance)
                    ))
                    .await;
                }
            }
        }
        services::set_bindings(
            &state.db,
            &instance.service_name,
            &instance.name,
            &instance.apps.0,
            &unit_ids,
        )
        .await?;
    }
    Ok(())
}

/// Drop removed units of `app` from every instance it is bound to.
pub async fn unbind_units(
    state: &AppState,
    app: &AppRecord,
    units: &[Unit],
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    if units.is_empty() {
        return Ok(());
    }
    let filter = InstanceFilter {
        service: None,
        app: Some(app.name.clone()),
    };
    for instance in services::list_instances(&state.db, &filter).await? {
        let service = catalog::get_service(state, &instance.service_name).await?;
        let endpoint = state.broker.endpoint(&service, request_id.clone())?;
        for unit in units.iter().filter(|unit| instance.units.0.contains(&unit.id)) {
            if let Err(err) = endpoint.unbind_unit(&instance.name, &app.name, &unit.ip).await {
                warn!(%err, unit = %unit.id, instance = %instance_key(&instance), "failed to unbind unit");
            }
        }
        let unit_ids: Vec<String> = instance
            .units
            .0
            .iter()
            .filter(|id| !units.iter().any(|unit| &unit.id == *id))
            .cloned()
            .collect();
        services::set_bindings(
            &state.db,
            &instance.service_name,
            &instance.name,
            &instance.apps.0,
            &unit_ids,
        )
        .await?;
        out.message(format!(" ---> Units unbound from {}", instance_key(&instance)))
            .await;
    }
    Ok(())
}

async fn prepare_binding(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    app_name: &str,
    bind: bool,
) -> ApiResult<(ServiceRecord, InstanceRecord, AppRecord)> {
    let service = catalog::get_service(state, service_name).await?;
    let instance = get_instance(state, service_name, name).await?;
    let app = apps::get_app(state, app_name).await?;
    let (instance_scheme, app_scheme) = if bind {
        (schemes::SERVICE_INSTANCE_UPDATE_BIND, schemes::APP_UPDATE_BIND)
    } else {
        (schemes::SERVICE_INSTANCE_UPDATE_UNBIND, schemes::APP_UPDATE_UNBIND)
    };
    principal.require(instance_scheme, &instance_contexts(&instance))?;
    principal.require(app_scheme, &app_contexts(&app))?;

    let bound = instance.apps.0.iter().any(|bound| bound == &app.name);
    if bind && bound {
        return Err(AppError::conflict(
            "This app is already bound to this service instance.",
        ));
    }
    if !bind && !bound {
        return Err(AppError::bad_request(
            "This app is not bound to this service instance.",
        ));
    }
    Ok((service, instance, app))
}

pub async fn prepare_bind(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    app_name: &str,
    no_restart: bool,
) -> ApiResult<BindOp> {
    let (service, instance, app) =
        prepare_binding(state, principal, service_name, name, app_name, true).await?;
    let event = open_event(
        state,
        principal,
        &instance,
        schemes::SERVICE_INSTANCE_UPDATE_BIND,
        json!({ "app": app.name, "noRestart": no_restart }),
    )
    .await?;
    Ok(BindOp {
        op: InstanceOp {
            service,
            instance,
            event,
        },
        app,
        no_restart,
    })
}

pub async fn run_bind(
    state: AppState,
    bind: BindOp,
    out: StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let BindOp {
        op: InstanceOp {
            service,
            instance,
            event,
        },
        app,
        no_restart,
    } = bind;
    let result = bind_inner(&state, &service, &instance, &app, no_restart, &out, request_id).await;
    if let Err(err) = &result {
        out.error(err.message.clone()).await;
    }
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result
}

async fn bind_inner(
    state: &AppState,
    service: &ServiceRecord,
    instance: &InstanceRecord,
    app: &AppRecord,
    no_restart: bool,
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let endpoint = state.broker.endpoint(service, request_id)?;
    let provisioner = apps::app_provisioner(state, app).await?;
    let units = provisioner
        .units(app)
        .await
        .map_err(|err| AppError::upstream(format!("failed to list units: {err}")))?;

    let env = endpoint.bind_app(&instance.name, &app.name, &[]).await?;
    let mut bound_units = Vec::new();
    for unit in &units {
        if let Err(err) = endpoint.bind_unit(&instance.name, &app.name, &unit.ip).await {
            for done in units.iter().filter(|u| bound_units.contains(&u.id)) {
                if let Err(cleanup) = endpoint.unbind_unit(&instance.name, &app.name, &done.ip).await {
                    warn!(?cleanup, unit = %done.id, "failed to roll back unit bind");
                }
            }
            if let Err(cleanup) = endpoint.unbind_app(&instance.name, &app.name).await {
                warn!(?cleanup, app = %app.name, "failed to roll back app bind");
            }
            return Err(err.into());
        }
        out.message(format!(" ---> Bound unit {}", unit.id)).await;
        bound_units.push(unit.id.clone());
    }

    let current = get_instance(state, &instance.service_name, &instance.name).await?;
    let mut apps = current.apps.0;
    if !apps.contains(&app.name) {
        apps.push(app.name.clone());
    }
    let mut unit_ids = current.units.0;
    for id in bound_units {
        if !unit_ids.contains(&id) {
            unit_ids.push(id);
        }
    }
    services::set_bindings(&state.db, &instance.service_name, &instance.name, &apps, &unit_ids)
        .await?;

    if !env.is_empty()
        && let Some(mut fresh) = app_store::get_app(&state.db, &app.name).await?
    {
        let key = instance_key(instance);
        for (name, value) in &env {
            fresh.env.0.insert(
                name.clone(),
                EnvEntry {
                    value: value.clone(),
                    public: false,
                    sensitive: false,
                    instance: Some(key.clone()),
                },
            );
        }
        app_store::set_env(&state.db, &app.name, &fresh.env.0).await?;
    }

    out.message(format!(
        "Instance {:?} is now bound to the app {:?}.",
        instance.name, app.name
    ))
    .await;
    if !env.is_empty() {
        out.message("The following environment variables are available for use in your app:")
            .await;
        for name in env.keys() {
            out.message(format!("- {name}")).await;
        }
    }
    if no_restart {
        out.message("Restart skipped, new variables apply on the next restart.").await;
    }
    info!(instance = %instance_key(instance), app = %app.name, "app bound");
    Ok(())
}

pub async fn prepare_unbind(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    app_name: &str,
) -> ApiResult<BindOp> {
    let (service, instance, app) =
        prepare_binding(state, principal, service_name, name, app_name, false).await?;
    let event = open_event(
        state,
        principal,
        &instance,
        schemes::SERVICE_INSTANCE_UPDATE_UNBIND,
        json!({ "app": app.name }),
    )
    .await?;
    Ok(BindOp {
        op: InstanceOp {
            service,
            instance,
            event,
        },
        app,
        no_restart: false,
    })
}

pub async fn run_unbind(
    state: AppState,
    unbind: BindOp,
    out: StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let BindOp {
        op: InstanceOp {
            service,
            instance,
            event,
        },
        app,
        ..
    } = unbind;
    let result = async {
        let endpoint = state.broker.endpoint(&service, request_id)?;
        unbind_one(&state, &endpoint, &instance, &app.name, Some(&app), &out).await
    }
    .await;
    if let Err(err) = &result {
        out.error(err.message.clone()).await;
    }
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result
}

pub async fn status(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    request_id: Option<String>,
) -> ApiResult<String> {
    let service = catalog::get_service(state, service_name).await?;
    let instance = get_instance(state, service_name, name).await?;
    principal.require(
        schemes::SERVICE_INSTANCE_READ_STATUS,
        &instance_contexts(&instance),
    )?;
    let status = state
        .broker
        .endpoint(&service, request_id)?
        .status(&instance.name)
        .await?;
    Ok(format!("Service instance {:?} is {status}", instance.name))
}

/// Instance details plus whatever the broker reports about it.
pub async fn info(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    request_id: Option<String>,
) -> ApiResult<ServiceInstanceInfo> {
    let service = catalog::get_service(state, service_name).await?;
    let instance = get_instance(state, service_name, name).await?;
    principal.require(schemes::SERVICE_INSTANCE_READ, &instance_contexts(&instance))?;

    let custom_info = match state.broker.endpoint(&service, request_id) {
        Ok(endpoint) => endpoint.info(&instance.name).await.unwrap_or_else(|err| {
            warn!(?err, service = %service.name, instance = %instance.name, "broker info failed");
            Default::default()
        }),
        Err(err) => {
            warn!(?err, service = %service.name, "service has no usable endpoint");
            Default::default()
        }
    };
    let mut info = to_info(instance);
    info.custom_info = custom_info;
    Ok(info)
}

pub async fn grant_team(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    team: &str,
) -> ApiResult<()> {
    let instance = get_instance(state, service_name, name).await?;
    principal.require(schemes::SERVICE_INSTANCE_UPDATE_GRANT, &instance_contexts(&instance))?;
    if !users::team_exists(&state.db, team).await? {
        return Err(AppError::not_found("Team not found."));
    }
    let mut teams = instance.teams.0.clone();
    if teams.iter().any(|t| t == team) {
        return Err(AppError::conflict(
            "This team already has access to this instance",
        ));
    }
    teams.push(team.to_string());

    let event = open_event(
        state,
        principal,
        &instance,
        schemes::SERVICE_INSTANCE_UPDATE_GRANT,
        json!({ "team": team }),
    )
    .await?;
    let result = services::set_teams(&state.db, service_name, name, &teams).await;
    event
        .done(result.as_ref().err().map(|err| err.to_string()).as_deref())
        .await;
    result?;
    Ok(())
}

pub async fn revoke_team(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    team: &str,
) -> ApiResult<()> {
    let instance = get_instance(state, service_name, name).await?;
    principal.require(schemes::SERVICE_INSTANCE_UPDATE_REVOKE, &instance_contexts(&instance))?;
    if instance.team_owner == team {
        return Err(AppError::forbidden(
            "You can not revoke the access from the team owner of this service instance",
        ));
    }
    let mut teams = instance.teams.0.clone();
    let before = teams.len();
    teams.retain(|t| t != team);
    if teams.len() == before {
        return Err(AppError::not_found(
            "This team does not have access to this service instance",
        ));
    }

    let event = open_event(
        state,
        principal,
        &instance,
        schemes::SERVICE_INSTANCE_UPDATE_REVOKE,
        json!({ "team": team }),
    )
    .await?;
    let result = services::set_teams(&state.db, service_name, name, &teams).await;
    event
        .done(result.as_ref().err().map(|err| err.to_string()).as_deref())
        .await;
    result?;
    Ok(())
}

/// Broker path a proxied request goes to.
///
/// Callbacks outside `/resources/<instance>` are taken relative to it. Parent
/// segments are refused, and so are non-GET calls to the bind endpoints.
pub fn proxy_path(instance: &str, callback: &str, method: &Method) -> ApiResult<String> {
    let callback = callback.trim();
    if callback.is_empty() {
        return Err(AppError::bad_request("callback parameter is required"));
    }
    let (path, query) = match callback.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (callback, None),
    };
    let escapes = path.split('/').any(|segment| {
        segment == ".." || segment.to_ascii_lowercase().replace("%2e", ".") == ".."
    });
    if escapes {
        return Err(AppError::bad_request("invalid callback path"));
    }

    let base = format!("/resources/{instance}");
    let path = if path == base || path.starts_with(&format!("{base}/")) {
        path.to_string()
    } else {
        format!("{base}/{}", path.trim_start_matches('/'))
    };
    let path = path.trim_end_matches('/').to_string();

    if method != Method::GET && (path == format!("{base}/bind") || path == format!("{base}/bind-app")) {
        return Err(AppError::forbidden(
            "proxying to bind endpoints is not allowed",
        ));
    }

    Ok(match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    })
}

/// Forward a request to the instance's broker.
///
/// Mutating calls are recorded as lock-free events.
#[allow(clippy::too_many_arguments)]
pub async fn proxy(
    state: &AppState,
    principal: &Principal,
    service_name: &str,
    name: &str,
    method: Method,
    callback: &str,
    headers: &HeaderMap,
    body: reqwest::Body,
    request_id: Option<String>,
) -> ApiResult<reqwest::Response> {
    let service = catalog::get_service(state, service_name).await?;
    let instance = get_instance(state, service_name, name).await?;
    principal.require(
        schemes::SERVICE_INSTANCE_UPDATE_PROXY,
        &instance_contexts(&instance),
    )?;
    let path = proxy_path(&instance.name, callback, &method)?;
    let endpoint = state.broker.endpoint(&service, request_id)?;

    let event = if method == Method::GET {
        None
    } else {
        Some(
            events::open(
                &state.db,
                &state.lock,
                EventOpts::new(
                    targets::SERVICE_INSTANCE,
                    instance_key(&instance),
                    schemes::SERVICE_INSTANCE_UPDATE_PROXY,
                    principal,
                    Allowed::new(
                        schemes::SERVICE_INSTANCE_READ_EVENTS,
                        instance_contexts(&instance),
                    ),
                )
                .with_data(json!({ "method": method.as_str(), "path": path }))
                .without_lock(),
            )
            .await?,
        )
    };

    let result = endpoint.proxy(method, &path, headers, body).await;
    if let Some(event) = event {
        match &result {
            Ok(response) => {
                event
                    .done_with(None, json!({ "status": response.status().as_u16() }))
                    .await
            }
            Err(err) => event.done(Some(&err.to_string())).await,
        }
    }
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::persistence::NewService;
    use crate::services::test_support::{seed_app, seed_node, seed_team, setup_state};
    use crate::streaming;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_string_contains, method as http_method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn admin() -> Principal {
        Principal::user("admin@example.com", vec![Permission::root()])
    }

    async fn seed_service(state: &AppState, name: &str, endpoint: &str) {
        seed_team(state, "blue").await;
        services::insert_service(
            &state.db,
            NewService {
                name: name.into(),
                endpoint: BTreeMap::from([("production".to_string(), endpoint.to_string())]),
                username: name.into(),
                password: "secret".into(),
                owner_teams: vec!["blue".into()],
                teams: Vec::new(),
                is_restricted: false,
                doc: String::new(),
            },
        )
        .await
        .unwrap();
    }

    fn create_request(name: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: name.into(),
            team_owner: Some("blue".into()),
            ..CreateInstanceRequest::default()
        }
    }

    async fn drain(mut rx: tokio::sync::mpsc::Receiver<bytes::Bytes>) -> String {
        let mut body = Vec::new();
        while let Some(chunk) = rx.recv().await {
            body.extend_from_slice(&chunk);
        }
        String::from_utf8(body).unwrap()
    }

    #[tokio::test]
    async fn create_calls_broker_and_rejects_duplicates() {
        let state = setup_state().await;
        let broker = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/resources"))
            .and(body_string_contains("name=db1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&broker)
            .await;
        seed_service(&state, "mysql", &broker.uri()).await;

        let bad = create(&state, &admin(), "mysql", create_request("1db"), None)
            .await
            .unwrap_err();
        assert_eq!(bad.code, "bad_request");

        let instance = create(&state, &admin(), "mysql", create_request("db1"), None)
            .await
            .unwrap();
        assert_eq!(instance.team_owner, "blue");

        let dup = create(&state, &admin(), "mysql", create_request("db1"), None)
            .await
            .unwrap_err();
        assert_eq!(dup.code, "conflict");
    }

    #[tokio::test]
    async fn broker_failure_leaves_no_row() {
        let state = setup_state().await;
        let broker = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/resources"))
            .respond_with(ResponseTemplate::new(500).set_body_string("quota exceeded"))
            .mount(&broker)
            .await;
        seed_service(&state, "mysql", &broker.uri()).await;

        let err = create(&state, &admin(), "mysql", create_request("db1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "upstream");
        assert!(services::get_instance(&state.db, "mysql", "db1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bind_then_delete_with_unbind_all() {
        let state = setup_state().await;
        let broker = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/resources/db1/bind-app"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({ "DATABASE_HOST": "10.0.0.9" })),
            )
            .mount(&broker)
            .await;
        Mock::given(http_method("POST"))
            .and(path("/resources/db1/bind"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&broker)
            .await;
        Mock::given(http_method("DELETE"))
            .and(path("/resources/db1/bind"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&broker)
            .await;
        Mock::given(http_method("DELETE"))
            .and(path("/resources/db1/bind-app"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&broker)
            .await;
        Mock::given(http_method("DELETE"))
            .and(path("/resources/db1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&broker)
            .await;
        seed_service(&state, "mysql", &broker.uri()).await;
        seed_node(&state, "http://10.0.0.1:2375", "main").await;
        let app = seed_app(&state, "web", "blue").await;
        apps::app_provisioner(&state, &app)
            .await
            .unwrap()
            .add_units(&app, 1)
            .await
            .unwrap();
        services::insert_instance(
            &state.db,
            NewInstance {
                service_name: "mysql".into(),
                name: "db1".into(),
                plan_name: String::new(),
                description: String::new(),
                team_owner: "blue".into(),
                tags: Vec::new(),
            },
        )
        .await
        .unwrap();

        let op = prepare_bind(&state, &admin(), "mysql", "db1", "web", false)
            .await
            .unwrap();
        let (out, rx) = streaming::channel();
        let (result, body) = tokio::join!(run_bind(state.clone(), op, out, None), drain(rx));
        result.expect("bind");
        assert!(body.contains("is now bound to the app"), "{body}");

        let app = app_store::get_app(&state.db, "web").await.unwrap().unwrap();
        let entry = &app.env.0["DATABASE_HOST"];
        assert_eq!(entry.instance.as_deref(), Some("mysql/db1"));
        assert!(!entry.public);

        let err = prepare_delete(&state, &admin(), "mysql", "db1", false)
            .await
            .unwrap_err();
        assert_eq!(err.code, "bound");
        assert_eq!(err.message, BOUND_APPS_MESSAGE);

        let op = prepare_delete(&state, &admin(), "mysql", "db1", true).await.unwrap();
        let (out, rx) = streaming::channel();
        let (result, body) = tokio::join!(run_delete(state.clone(), op, out, None), drain(rx));
        result.expect("delete");
        assert!(
            body.ends_with("{\"Message\":\"service instance successfuly removed\"}\n"),
            "{body}"
        );
        assert!(services::get_instance(&state.db, "mysql", "db1").await.unwrap().is_none());
        let app = app_store::get_app(&state.db, "web").await.unwrap().unwrap();
        assert!(app.env.0.is_empty());
    }

    #[tokio::test]
    async fn status_text_follows_broker_code() {
        let state = setup_state().await;
        let broker = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/resources/db1/status"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&broker)
            .await;
        seed_service(&state, "mysql", &broker.uri()).await;
        services::insert_instance(
            &state.db,
            NewInstance {
                service_name: "mysql".into(),
                name: "db1".into(),
                plan_name: String::new(),
                description: String::new(),
                team_owner: "blue".into(),
                tags: Vec::new(),
            },
        )
        .await
        .unwrap();

        let text = status(&state, &admin(), "mysql", "db1", None).await.unwrap();
        assert_eq!(text, "Service instance \"db1\" is pending");
    }

    #[tokio::test]
    async fn owner_team_cannot_be_revoked() {
        let state = setup_state().await;
        seed_service(&state, "mysql", "http://broker").await;
        seed_team(&state, "red").await;
        services::insert_instance(
            &state.db,
            NewInstance {
                service_name: "mysql".into(),
                name: "db1".into(),
                plan_name: String::new(),
                description: String::new(),
                team_owner: "blue".into(),
                tags: Vec::new(),
            },
        )
        .await
        .unwrap();

        grant_team(&state, &admin(), "mysql", "db1", "red").await.unwrap();
        assert_eq!(
            grant_team(&state, &admin(), "mysql", "db1", "red")
                .await
                .unwrap_err()
                .code,
            "conflict"
        );
        assert_eq!(
            revoke_team(&state, &admin(), "mysql", "db1", "blue")
                .await
                .unwrap_err()
                .code,
            "forbidden"
        );
        revoke_team(&state, &admin(), "mysql", "db1", "red").await.unwrap();
        let instance = get_instance(&state, "mysql", "db1").await.unwrap();
        assert_eq!(instance.teams.0, vec!["blue".to_string()]);
    }

    #[test]
    fn proxy_paths_stay_under_the_instance() {
        assert_eq!(
            proxy_path("db1", "/resources/db1/export?full=1", &Method::GET).unwrap(),
            "/resources/db1/export?full=1"
        );
        assert_eq!(
            proxy_path("db1", "export", &Method::POST).unwrap(),
            "/resources/db1/export"
        );
        assert_eq!(
            proxy_path("db1", "/resources/other/export", &Method::GET).unwrap(),
            "/resources/db1/resources/other/export"
        );
        assert_eq!(
            proxy_path("db1", "/resources/db1/../../plans", &Method::GET)
                .unwrap_err()
                .code,
            "bad_request"
        );
        assert_eq!(
            proxy_path("db1", "%2E%2E/x", &Method::GET).unwrap_err().code,
            "bad_request"
        );
        assert_eq!(
            proxy_path("db1", "/resources/db1/bind-app", &Method::POST)
                .unwrap_err()
                .code,
            "forbidden"
        );
        assert!(proxy_path("db1", "/resources/db1/bind", &Method::GET).is_ok());
        assert!(proxy_path("db1", "", &Method::GET).is_err());
    }
}
