use std::collections::BTreeMap;

use common::api::{MachineView, TemplateView};
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError};
use crate::events::{self, Allowed, EventOpts, targets};
use crate::iaas::{self, machine_view};
use crate::permission::{ContextType, PermissionContext, schemes};
use crate::persistence::{TemplateRecord, machines};

fn iaas_context(name: &str) -> Vec<PermissionContext> {
    vec![PermissionContext::iaas(name)]
}

/// Machines on backends the caller may read.
pub async fn list_machines(state: &AppState, principal: &Principal) -> ApiResult<Vec<MachineView>> {
    let readable = principal.values_for(schemes::MACHINE_READ, ContextType::Iaas);
    Ok(machines::list_machines(&state.db)
        .await?
        .iter()
        .filter(|machine| {
            readable
                .as_ref()
                .is_none_or(|names| names.contains(&machine.iaas))
        })
        .map(machine_view)
        .collect())
}

pub async fn delete_machine(state: &AppState, principal: &Principal, id: &str) -> ApiResult<()> {
    let Some(machine) = machines::get_machine(&state.db, id).await? else {
        return Err(AppError::not_found("machine not found"));
    };
    principal.require(schemes::MACHINE_DELETE, &iaas_context(&machine.iaas))?;

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::IAAS,
            machine.iaas.clone(),
            schemes::MACHINE_DELETE,
            principal,
            Allowed::new(schemes::MACHINE_READ, iaas_context(&machine.iaas)),
        )
        .with_data(json!({ "id": machine.id, "address": machine.address }))
        .without_lock(),
    )
    .await?;
    let result = iaas::destroy_machine(&state.db, &state.iaas, &machine).await;
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result
}

fn template_view(record: TemplateRecord) -> TemplateView {
    TemplateView {
        name: record.name,
        iaas: record.iaas,
        params: record.params.0,
    }
}

pub async fn list_templates(
    state: &AppState,
    principal: &Principal,
) -> ApiResult<Vec<TemplateView>> {
    let readable = principal.values_for(schemes::MACHINE_TEMPLATE_READ, ContextType::Iaas);
    Ok(machines::list_templates(&state.db)
        .await?
        .into_iter()
        .filter(|template| {
            readable
                .as_ref()
                .is_none_or(|names| names.contains(&template.iaas))
        })
        .map(template_view)
        .collect())
}

/// Create or replace a template. The backend must be registered.
pub async fn save_template(
    state: &AppState,
    principal: &Principal,
    name: &str,
    iaas_name: &str,
    params: BTreeMap<String, String>,
) -> ApiResult<TemplateView> {
    if name.trim().is_empty() {
        return Err(AppError::bad_request("template name is required"));
    }
    let backend = state.iaas.get(Some(iaas_name))?;
    principal.require(schemes::MACHINE_TEMPLATE_CREATE, &iaas_context(backend.name()))?;
    let record = machines::upsert_template(&state.db, name.trim(), backend.name(), &params).await?;
    Ok(template_view(record))
}

pub async fn delete_template(state: &AppState, principal: &Principal, name: &str) -> ApiResult<()> {
    let Some(template) = machines::get_template(&state.db, name).await? else {
        return Err(AppError::not_found(format!("template {name:?} not found")));
    };
    principal.require(schemes::MACHINE_TEMPLATE_DELETE, &iaas_context(&template.iaas))?;
    machines::delete_template(&state.db, name).await?;
    Ok(())
}
