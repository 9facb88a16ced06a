//! Scaling an app's units up and down.
//!
//! Split like deploys: [`prepare`] checks and opens the app event, [`run`]
//! talks to the provisioner and the bound brokers from the streaming task.

use serde_json::json;
use tracing::info;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError};
use crate::events::{self, Allowed, Event, EventOpts, targets};
use crate::permission::schemes;
use crate::persistence::AppRecord;
use crate::services::apps::{self, app_contexts};
use crate::services::service_instances;
use crate::streaming::StreamWriter;

pub const INVALID_UNITS: &str =
    "Invalid number of units: the number must be an integer greater than 0.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitChange {
    Add,
    Remove,
}

impl UnitChange {
    pub fn scheme(self) -> &'static str {
        match self {
            UnitChange::Add => schemes::APP_UPDATE_UNIT_ADD,
            UnitChange::Remove => schemes::APP_UPDATE_UNIT_REMOVE,
        }
    }
}

/// Parse the `units` field.
pub fn parse_units(raw: Option<&str>) -> ApiResult<u32> {
    raw.and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|count| *count > 0)
        .ok_or_else(|| AppError::bad_request(INVALID_UNITS))
}

#[derive(Debug)]
pub struct UnitsOp {
    pub app: AppRecord,
    pub change: UnitChange,
    pub count: u32,
    event: Event,
}

pub async fn prepare(
    state: &AppState,
    principal: &Principal,
    app_name: &str,
    change: UnitChange,
    count: u32,
) -> ApiResult<UnitsOp> {
    let app = apps::get_app(state, app_name).await?;
    principal.require(change.scheme(), &app_contexts(&app))?;
    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::APP,
            app.name.clone(),
            change.scheme(),
            principal,
            Allowed::new(schemes::APP_READ_EVENTS, app_contexts(&app)),
        )
        .with_data(json!({ "units": count })),
    )
    .await?;
    Ok(UnitsOp {
        app,
        change,
        count,
        event,
    })
}

pub async fn run(
    state: AppState,
    op: UnitsOp,
    out: StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let result = match op.change {
        UnitChange::Add => add(&state, &op.app, op.count, &out, request_id).await,
        UnitChange::Remove => remove(&state, &op.app, op.count, &out, request_id).await,
    };
    if let Err(err) = &result {
        out.error(err.message.clone()).await;
    }
    op.event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result
}

async fn add(
    state: &AppState,
    app: &AppRecord,
    count: u32,
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let provisioner = apps::app_provisioner(state, app).await?;
    out.message(format!("Adding {count} units to app {:?}", app.name))
        .await;
    let added = provisioner
        .add_units(app, count)
        .await
        .map_err(|err| AppError::upstream(format!("failed to add units: {err}")))?;
    for unit in &added {
        out.message(format!(" ---> Started unit {} on {}", unit.id, unit.node_address))
            .await;
    }
    service_instances::bind_units(state, app, &added, out, request_id).await?;
    info!(app = %app.name, added = added.len(), "units added");
    out.message(format!("{} units added to app {:?}", added.len(), app.name))
        .await;
    Ok(())
}

async fn remove(
    state: &AppState,
    app: &AppRecord,
    count: u32,
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let provisioner = apps::app_provisioner(state, app).await?;
    let before = provisioner
        .units(app)
        .await
        .map_err(|err| AppError::upstream(format!("failed to list units: {err}")))?;
    if count as usize > before.len() {
        return Err(AppError::bad_request(format!(
            "Cannot remove {count} units from app {:?}, it has {}.",
            app.name,
            before.len()
        )));
    }

    out.message(format!("Removing {count} units from app {:?}", app.name))
        .await;
    provisioner
        .remove_units(app, count)
        .await
        .map_err(|err| AppError::upstream(format!("failed to remove units: {err}")))?;
    let after = provisioner
        .units(app)
        .await
        .map_err(|err| AppError::upstream(format!("failed to list units: {err}")))?;
    let removed: Vec<_> = before
        .into_iter()
        .filter(|unit| !after.iter().any(|kept| kept.id == unit.id))
        .collect();
    for unit in &removed {
        out.message(format!(" ---> Removed unit {}", unit.id)).await;
    }
    service_instances::unbind_units(state, app, &removed, out, request_id).await?;
    info!(app = %app.name, removed = removed.len(), "units removed");
    out.message(format!("{} units removed from app {:?}", removed.len(), app.name))
        .await;
    Ok(())
}
