use std::collections::BTreeMap;

use common::api::{HealerConfigView, HealingEventView};
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError};
use crate::events::{self, Allowed, EventOpts, targets};
use crate::permission::{PermissionContext, schemes};
use crate::persistence::{
    HealerConfigRecord, HealerConfigUpdate, HealerField, HealingAction, HealingEventRecord, healer,
};

/// Key of the entry every pool inherits from.
pub const BASE_POOL: &str = "";

const HISTORY_LIMIT: u32 = 200;

fn pool_context(pool: &str) -> Vec<PermissionContext> {
    if pool == BASE_POOL {
        Vec::new()
    } else {
        vec![PermissionContext::pool(pool)]
    }
}

/// Accepts both the wire names and the column names.
pub fn parse_field(name: &str) -> ApiResult<HealerField> {
    match name {
        "Enabled" | "enabled" => Ok(HealerField::Enabled),
        "MaxUnresponsiveTime" | "max_unresponsive_secs" => Ok(HealerField::MaxUnresponsive),
        "MaxTimeSinceSuccess" | "max_since_success_secs" => Ok(HealerField::MaxSinceSuccess),
        other => Err(AppError::bad_request(format!(
            "invalid healer config field {other:?}"
        ))),
    }
}

fn resolve(own: &HealerConfigRecord, base: &HealerConfigRecord, is_base: bool) -> HealerConfigView {
    fn pick<T: Copy>(own: Option<T>, base: Option<T>, is_base: bool) -> (Option<T>, bool) {
        match own {
            Some(value) => (Some(value), false),
            None if is_base => (None, false),
            None => (base, base.is_some()),
        }
    }
    let (enabled, enabled_inherited) = pick(own.enabled, base.enabled, is_base);
    let (max_unresponsive_secs, max_unresponsive_inherited) =
        pick(own.max_unresponsive_secs, base.max_unresponsive_secs, is_base);
    let (max_since_success_secs, max_since_success_inherited) =
        pick(own.max_since_success_secs, base.max_since_success_secs, is_base);
    HealerConfigView {
        enabled,
        enabled_inherited,
        max_unresponsive_secs,
        max_unresponsive_inherited,
        max_since_success_secs,
        max_since_success_inherited,
    }
}

/// Effective config of every configured pool, keyed by pool. The base entry
/// is always present.
pub async fn get_config(
    state: &AppState,
    principal: &Principal,
) -> ApiResult<BTreeMap<String, HealerConfigView>> {
    principal.require(schemes::HEALING_READ, &[])?;
    let records = healer::list_configs(&state.db).await?;
    let base = records
        .iter()
        .find(|record| record.pool == BASE_POOL)
        .cloned()
        .unwrap_or(HealerConfigRecord {
            pool: BASE_POOL.to_string(),
            enabled: None,
            max_unresponsive_secs: None,
            max_since_success_secs: None,
        });

    let mut views = BTreeMap::new();
    views.insert(BASE_POOL.to_string(), resolve(&base, &base, true));
    for record in records.iter().filter(|record| record.pool != BASE_POOL) {
        views.insert(record.pool.clone(), resolve(record, &base, false));
    }
    Ok(views)
}

pub async fn update_config(
    state: &AppState,
    principal: &Principal,
    pool: &str,
    update: HealerConfigUpdate,
) -> ApiResult<()> {
    principal.require(schemes::HEALING_UPDATE, &pool_context(pool))?;
    if update.max_unresponsive_secs.is_some_and(|v| v < 0)
        || update.max_since_success_secs.is_some_and(|v| v < 0)
    {
        return Err(AppError::bad_request("healer durations cannot be negative"));
    }

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::HEALER,
            pool,
            schemes::HEALING_UPDATE,
            principal,
            Allowed::new(schemes::HEALING_READ, pool_context(pool)),
        )
        .with_data(json!({
            "pool": pool,
            "enabled": update.enabled,
            "max_unresponsive_secs": update.max_unresponsive_secs,
            "max_since_success_secs": update.max_since_success_secs,
        })),
    )
    .await?;
    let result = healer::merge_config(&state.db, pool, &update).await;
    event
        .done(result.as_ref().err().map(|err| err.to_string()).as_deref())
        .await;
    Ok(result?)
}

/// Clear one field, or the whole pool entry when `field` is `None`.
pub async fn delete_config(
    state: &AppState,
    principal: &Principal,
    pool: &str,
    field: Option<&str>,
) -> ApiResult<()> {
    principal.require(schemes::HEALING_DELETE, &pool_context(pool))?;
    let field = field.filter(|f| !f.is_empty()).map(parse_field).transpose()?;
    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::HEALER,
            pool,
            schemes::HEALING_DELETE,
            principal,
            Allowed::new(schemes::HEALING_READ, pool_context(pool)),
        ),
    )
    .await?;
    let result = match field {
        Some(field) => healer::clear_field(&state.db, pool, field).await,
        None => healer::delete_config(&state.db, pool).await,
    };
    event
        .done(result.as_ref().err().map(|err| err.to_string()).as_deref())
        .await;
    result?;
    Ok(())
}

/// Healing history, newest first. `filter` is `node`, `container` or empty.
pub async fn list_history(
    state: &AppState,
    principal: &Principal,
    filter: Option<&str>,
) -> ApiResult<Vec<HealingEventView>> {
    principal.require(schemes::HEALING_READ, &[])?;
    let action = match filter.unwrap_or_default() {
        "" => None,
        "node" => Some(HealingAction::NodeHealing),
        "container" => Some(HealingAction::ContainerHealing),
        other => {
            return Err(AppError::bad_request(format!(
                "invalid filter {other:?}, expected node or container"
            )));
        }
    };
    Ok(healer::list_healing_events(&state.db, action, HISTORY_LIMIT)
        .await?
        .into_iter()
        .map(to_view)
        .collect())
}

fn to_view(record: HealingEventRecord) -> HealingEventView {
    HealingEventView {
        id: record.id,
        action: record.action.as_str().to_string(),
        failing: record.failing,
        created: record.created,
        start_time: record.start_time,
        end_time: record.end_time,
        error: record.error,
        successful: record.successful,
    }
}
