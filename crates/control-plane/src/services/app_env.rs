//! User-managed environment variables of an app.
//!
//! Variables injected by a service bind belong to that bind: they cannot be
//! overwritten or unset here.

use std::sync::LazyLock;

use common::api::EnvVar;
use regex::Regex;
use serde_json::json;
use tracing::info;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError};
use crate::events::{self, Allowed, EventOpts, targets};
use crate::permission::schemes;
use crate::persistence::{AppRecord, EnvEntry, apps as app_store};
use crate::services::apps::{self, app_contexts};

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][-_a-zA-Z0-9]*$").expect("env name pattern"));

pub const MISSING_ENVS: &str = "You must provide the list of environment variables";
pub const PRIVATE_VALUE: &str = "*** (private variable)";

/// `envs` holds `NAME=value` assignments.
#[derive(Debug, Clone, Default)]
pub struct SetEnvRequest {
    pub envs: Vec<String>,
    pub private: bool,
}

/// API view of one variable. Private and sensitive values are masked.
pub fn env_view(name: &str, entry: &EnvEntry) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: if entry.public && !entry.sensitive {
            entry.value.clone()
        } else {
            PRIVATE_VALUE.to_string()
        },
        public: entry.public,
        sensitive: entry.sensitive,
        instance: entry.instance.clone(),
    }
}

pub fn parse_assignment(raw: &str) -> ApiResult<(String, String)> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(AppError::bad_request(format!(
            "Invalid environment variable: {raw:?}"
        )));
    };
    let name = name.trim();
    if !ENV_NAME.is_match(name) {
        return Err(AppError::bad_request(format!(
            "Invalid environment variable name: '{name}'"
        )));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Variables of the app, narrowed to `names` when any are given.
pub async fn list(
    state: &AppState,
    principal: &Principal,
    app_name: &str,
    names: &[String],
) -> ApiResult<Vec<EnvVar>> {
    let app = apps::get_app(state, app_name).await?;
    principal.require(schemes::APP_READ_ENV, &app_contexts(&app))?;
    Ok(app
        .env
        .0
        .iter()
        .filter(|(name, _)| names.is_empty() || names.contains(name))
        .map(|(name, entry)| env_view(name, entry))
        .collect())
}

fn bound_elsewhere(app: &AppRecord, names: &[&str], verb: &str) -> ApiResult<()> {
    let conflicts: Vec<String> = names
        .iter()
        .filter_map(|name| {
            let instance = app.env.0.get(*name)?.instance.as_deref()?;
            Some(format!(
                "Environment variable {name:?} is already in use by service bind {instance:?}"
            ))
        })
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(AppError::bad_request(format!(
            "cannot {verb} variables: {}",
            conflicts.join("; ")
        )))
    }
}

/// Set variables. Returns how many were written.
pub async fn set(
    state: &AppState,
    principal: &Principal,
    app_name: &str,
    req: SetEnvRequest,
) -> ApiResult<usize> {
    if req.envs.is_empty() {
        return Err(AppError::bad_request(MISSING_ENVS));
    }
    let assignments = req
        .envs
        .iter()
        .map(|raw| parse_assignment(raw))
        .collect::<ApiResult<Vec<_>>>()?;

    let app = apps::get_app(state, app_name).await?;
    principal.require(schemes::APP_UPDATE_ENV_SET, &app_contexts(&app))?;
    let names: Vec<&str> = assignments.iter().map(|(name, _)| name.as_str()).collect();
    bound_elsewhere(&app, &names, "set")?;

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::APP,
            app.name.clone(),
            schemes::APP_UPDATE_ENV_SET,
            principal,
            Allowed::new(schemes::APP_READ_EVENTS, app_contexts(&app)),
        )
        .with_data(json!({ "envs": names, "private": req.private })),
    )
    .await?;

    let mut env = app.env.0.clone();
    for (name, value) in &assignments {
        env.insert(
            name.clone(),
            EnvEntry {
                value: value.clone(),
                public: !req.private,
                sensitive: false,
                instance: None,
            },
        );
    }
    let result = app_store::set_env(&state.db, &app.name, &env)
        .await
        .map_err(AppError::from);
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result?;
    info!(app = %app.name, count = assignments.len(), private = req.private, "env set");
    Ok(assignments.len())
}

/// Unset variables. Unknown names are ignored. Returns how many were removed.
pub async fn unset(
    state: &AppState,
    principal: &Principal,
    app_name: &str,
    names: &[String],
) -> ApiResult<usize> {
    if names.is_empty() {
        return Err(AppError::bad_request(MISSING_ENVS));
    }
    let app = apps::get_app(state, app_name).await?;
    principal.require(schemes::APP_UPDATE_ENV_UNSET, &app_contexts(&app))?;
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    bound_elsewhere(&app, &refs, "unset")?;

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::APP,
            app.name.clone(),
            schemes::APP_UPDATE_ENV_UNSET,
            principal,
            Allowed::new(schemes::APP_READ_EVENTS, app_contexts(&app)),
        )
        .with_data(json!({ "envs": refs })),
    )
    .await?;

    let mut env = app.env.0.clone();
    let removed = names
        .iter()
        .filter(|name| env.remove(name.as_str()).is_some())
        .count();
    let result = app_store::set_env(&state.db, &app.name, &env)
        .await
        .map_err(AppError::from);
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result?;
    info!(app = %app.name, removed, "env unset");
    Ok(removed)
}
