use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use common::api::{AppInfo, AppLock};
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError, is_unique_violation};
use crate::events::{self, Allowed, EventOpts, targets};
use crate::permission::{ContextType, PermissionContext, schemes};
use crate::persistence::{AppRecord, NewApp, apps, deploys, pools, tokens, users};
use crate::provision::Provisioner;
use crate::services::{app_env, service_instances};
use crate::streaming::StreamWriter;

static APP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,39}$").expect("app name pattern"));

pub const APP_NOT_FOUND: &str = "App not found.";

#[derive(Debug, Clone, Default)]
pub struct CreateAppRequest {
    pub name: String,
    pub platform: String,
    pub plan: String,
    pub pool: Option<String>,
    pub team_owner: Option<String>,
    pub description: String,
}

/// Contexts an app-scoped permission is checked against.
pub fn app_contexts(app: &AppRecord) -> Vec<PermissionContext> {
    let mut contexts = vec![PermissionContext::app(app.name.clone())];
    contexts.extend(app.teams.0.iter().cloned().map(PermissionContext::team));
    contexts.push(PermissionContext::pool(app.pool.clone()));
    contexts
}

pub async fn get_app(state: &AppState, name: &str) -> ApiResult<AppRecord> {
    apps::get_app(&state.db, name)
        .await?
        .ok_or_else(|| AppError::not_found(APP_NOT_FOUND))
}

/// App the caller may read. Hidden apps are reported as missing.
pub async fn get_visible(state: &AppState, principal: &Principal, name: &str) -> ApiResult<AppInfo> {
    let app = get_app(state, name).await?;
    if !principal.allows(schemes::APP_READ, &app_contexts(&app)) {
        return Err(AppError::not_found(APP_NOT_FOUND));
    }
    Ok(to_info(&app))
}

pub async fn list_visible(state: &AppState, principal: &Principal) -> ApiResult<Vec<AppInfo>> {
    Ok(apps::list_apps(&state.db)
        .await?
        .iter()
        .filter(|app| principal.allows(schemes::APP_READ, &app_contexts(app)))
        .map(to_info)
        .collect())
}

/// Names of the apps on which the caller holds `scheme`, `None` meaning all.
pub async fn visible_app_names(
    state: &AppState,
    principal: &Principal,
    scheme: &str,
) -> ApiResult<Option<Vec<String>>> {
    if principal
        .contexts_for(scheme)
        .iter()
        .any(|ctx| ctx.ctx_type == ContextType::Global)
    {
        return Ok(None);
    }
    Ok(Some(
        apps::list_apps(&state.db)
            .await?
            .into_iter()
            .filter(|app| principal.allows(scheme, &app_contexts(app)))
            .map(|app| app.name)
            .collect(),
    ))
}

pub async fn create_app(
    state: &AppState,
    principal: &Principal,
    req: CreateAppRequest,
) -> ApiResult<AppRecord> {
    let name = req.name.trim().to_lowercase();
    if !APP_NAME.is_match(&name) {
        return Err(AppError::bad_request(
            "Invalid app name, your app should have at most 40 characters, containing only lower case letters, numbers or dashes, starting with a letter.",
        ));
    }

    let team_owner = resolve_team_owner(state, principal, req.team_owner).await?;
    principal.require(
        schemes::APP_CREATE,
        &[PermissionContext::team(team_owner.clone())],
    )?;

    let pool = match req.pool.filter(|p| !p.is_empty()) {
        Some(name) => pools::get_pool(&state.db, &name)
            .await?
            .ok_or_else(|| AppError::not_found("Pool not found."))?,
        None => pools::default_pool(&state.db)
            .await?
            .ok_or_else(|| AppError::bad_request("No pool given and no default pool configured."))?,
    };
    if !pool.teams.0.is_empty() && !pool.teams.0.contains(&team_owner) {
        return Err(AppError::bad_request(format!(
            "App team owner {team_owner:?} has no access to pool {:?}",
            pool.name
        )));
    }
    let provisioner = state.provisioners.for_pool_provisioner(&pool.provisioner)?;

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::APP,
            name.clone(),
            schemes::APP_CREATE,
            principal,
            Allowed::new(
                schemes::APP_READ_EVENTS,
                vec![
                    PermissionContext::app(name.clone()),
                    PermissionContext::team(team_owner.clone()),
                ],
            ),
        )
        .with_data(json!({
            "name": name,
            "platform": req.platform,
            "plan": req.plan,
            "pool": pool.name,
            "teamOwner": team_owner,
        })),
    )
    .await?;

    let created = apps::create_app(
        &state.db,
        NewApp {
            name: name.clone(),
            platform: req.platform,
            plan: if req.plan.is_empty() {
                "default".to_string()
            } else {
                req.plan
            },
            pool: pool.name.clone(),
            team_owner: team_owner.clone(),
            teams: vec![team_owner],
            description: req.description,
            env: BTreeMap::new(),
        },
    )
    .await;
    let app = match created {
        Ok(app) => app,
        Err(err) if is_unique_violation(&err) => {
            let msg = "there is already an app with this name";
            event.done(Some(msg)).await;
            return Err(AppError::conflict(msg));
        }
        Err(err) => {
            event.done(Some(&err.to_string())).await;
            return Err(err.into());
        }
    };

    if let Err(err) = provisioner.provision(&app).await {
        let msg = format!("provisioning failed: {err}");
        event.done(Some(&msg)).await;
        if let Err(cleanup) = apps::delete_app(&state.db, &app.name).await {
            warn!(?cleanup, app = %app.name, "failed to remove unprovisioned app");
        }
        return Err(AppError::upstream(msg));
    }

    event.done(None).await;
    info!(app = %app.name, pool = %app.pool, team = %app.team_owner, "app created");
    Ok(app)
}

async fn resolve_team_owner(
    state: &AppState,
    principal: &Principal,
    requested: Option<String>,
) -> ApiResult<String> {
    if let Some(team) = requested.filter(|t| !t.is_empty()) {
        if !users::team_exists(&state.db, &team).await? {
            return Err(AppError::not_found("Team not found."));
        }
        return Ok(team);
    }

    let teams = match principal.values_for(schemes::APP_CREATE, ContextType::Team) {
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

/// Provisioner serving the app's pool.
pub async fn app_provisioner(state: &AppState, app: &AppRecord) -> ApiResult<Arc<dyn Provisioner>> {
    let pool_provisioner = pools::get_pool(&state.db, &app.pool)
        .await?
        .map(|pool| pool.provisioner)
        .unwrap_or_default();
    state.provisioners.for_pool_provisioner(&pool_provisioner)
}

/// Checks run before a delete stream starts.
pub async fn prepare_delete(
    state: &AppState,
    principal: &Principal,
    name: &str,
) -> ApiResult<AppRecord> {
    let app = get_app(state, name).await?;
    principal.require(schemes::APP_DELETE, &app_contexts(&app))?;
    Ok(app)
}

/// Tear the app down, reporting progress as JSON frames.
///
/// Service bindings go first so brokers see unbinds while units still exist.
pub async fn delete_app(
    state: &AppState,
    principal: &Principal,
    app: AppRecord,
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::APP,
            app.name.clone(),
            schemes::APP_DELETE,
            principal,
            Allowed::new(schemes::APP_READ_EVENTS, app_contexts(&app)),
        )
        .without_lock(),
    )
    .await?;

    let result = remove_app(state, &app, out, request_id).await;
    event
        .done(result.as_ref().err().map(|err| err.message.as_str()))
        .await;
    result
}

async fn remove_app(
    state: &AppState,
    app: &AppRecord,
    out: &StreamWriter,
    request_id: Option<String>,
) -> ApiResult<()> {
    service_instances::detach_app(state, app, out, request_id).await?;

    let provisioner = app_provisioner(state, app).await?;
    provisioner
        .destroy(app)
        .await
        .map_err(|err| AppError::upstream(format!("failed to destroy app units: {err}")))?;
    out.message(format!("Units of app {:?} removed", app.name)).await;

    let removed = deploys::mark_removed(&state.db, &app.name, Utc::now()).await?;
    let revoked = tokens::delete_app_tokens(&state.db, &app.name).await?;
    apps::delete_app(&state.db, &app.name).await?;
    info!(app = %app.name, removed_deploys = removed, revoked_tokens = revoked, "app deleted");
    out.message(format!("App {:?} successfully removed!", app.name)).await;
    Ok(())
}

pub fn to_info(app: &AppRecord) -> AppInfo {
    let env = app
        .env
        .0
        .iter()
        .map(|(name, entry)| app_env::env_view(name, entry))
        .collect();

    AppInfo {
        name: app.name.clone(),
        platform: app.platform.clone(),
        plan: app.plan.clone(),
        pool: app.pool.clone(),
        team_owner: app.team_owner.clone(),
        teams: app.teams.0.clone(),
        description: app.description.clone(),
        deploys: app.deploys,
        current_image: app.current_image.clone(),
        lock: AppLock {
            locked: app.lock_locked,
            reason: app.lock_reason.clone(),
            owner: app.lock_owner.clone(),
            acquired_at: app.lock_acquired_at,
        },
        env,
        created_at: app.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::persistence::{EnvEntry, EventFilter, nodes};
    use crate::services::test_support::{seed_app, seed_pool, seed_team, setup_state};
    use crate::streaming;

    fn admin() -> Principal {
        Principal::user("admin@example.com", vec![Permission::root()])
    }

    fn creator(team: &str) -> Principal {
        Principal::user(
            "dev@example.com",
            vec![Permission::new(schemes::APP, PermissionContext::team(team))],
        )
    }

    #[tokio::test]
    async fn create_uses_only_team_and_default_pool() {
        let state = setup_state().await;
        seed_pool(&state, "main").await;
        seed_team(&state, "blue").await;

        let app = create_app(
            &state,
            &creator("blue"),
            CreateAppRequest {
                name: "MyApp".into(),
                platform: "python".into(),
                ..CreateAppRequest::default()
            },
        )
        .await
        .expect("create");
        assert_eq!(app.name, "myapp");
        assert_eq!(app.team_owner, "blue");
        assert_eq!(app.teams.0, vec!["blue".to_string()]);
        assert_eq!(app.pool, "main");
        assert_eq!(app.plan, "default");
        let recorded = events::list_visible(
            &state.db,
            &admin(),
            &EventFilter {
                kind: Some(schemes::APP_CREATE.to_string()),
                ..EventFilter::default()
            },
            0,
            10,
        )
        .await
        .unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].target.value, "myapp");

        let info = get_visible(&state, &creator("blue"), "myapp").await.unwrap();
        assert!(info.teams.contains(&info.team_owner));
        assert!(
            get_visible(&state, &creator("red"), "myapp")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn create_rejects_bad_names_and_duplicates() {
        let state = setup_state().await;
        seed_pool(&state, "main").await;
        seed_team(&state, "blue").await;

        let bad = create_app(
            &state,
            &admin(),
            CreateAppRequest {
                name: "1app".into(),
                team_owner: Some("blue".into()),
                ..CreateAppRequest::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(bad.code, "bad_request");

        let req = CreateAppRequest {
            name: "web".into(),
            team_owner: Some("blue".into()),
            ..CreateAppRequest::default()
        };
        create_app(&state, &admin(), req.clone()).await.unwrap();
        let dup = create_app(&state, &admin(), req).await.unwrap_err();
        assert_eq!(dup.code, "conflict");
    }

    #[tokio::test]
    async fn ambiguous_team_requires_explicit_owner() {
        let state = setup_state().await;
        seed_pool(&state, "main").await;
        seed_team(&state, "blue").await;
        seed_team(&state, "red").await;

        let err = create_app(
            &state,
            &admin(),
            CreateAppRequest {
                name: "web".into(),
                ..CreateAppRequest::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.message, "You must provide a team to execute this action.");
    }

    #[tokio::test]
    async fn env_values_are_masked_unless_public() {
        let state = setup_state().await;
        let mut app = seed_app(&state, "web", "blue").await;
        app.env.0.insert(
            "PUBLIC".into(),
            EnvEntry {
                value: "shown".into(),
                public: true,
                sensitive: false,
                instance: None,
            },
        );
        app.env.0.insert(
            "SECRET".into(),
            EnvEntry {
                value: "hidden".into(),
                public: false,
                sensitive: false,
                instance: Some("mysql/db".into()),
            },
        );

        let info = to_info(&app);
        let public = info.env.iter().find(|v| v.name == "PUBLIC").unwrap();
        let secret = info.env.iter().find(|v| v.name == "SECRET").unwrap();
        assert_eq!(public.value, "shown");
        assert_eq!(secret.value, "*** (private variable)");
        assert_eq!(secret.instance.as_deref(), Some("mysql/db"));
    }

    #[tokio::test]
    async fn delete_removes_units_tokens_and_row() {
        let state = setup_state().await;
        let app = seed_app(&state, "web", "blue").await;
        let provisioner = app_provisioner(&state, &app).await.unwrap();
        provisioner.add_units(&app, 2).await.unwrap();
        crate::services::tokens::issue_app_token(&state, "web").await.unwrap();

        let app = prepare_delete(&state, &admin(), "web").await.unwrap();
        let (out, mut rx) = streaming::channel();
        delete_app(&state, &admin(), app, &out, None).await.expect("delete");
        drop(out);

        let mut body = Vec::new();
        while let Some(chunk) = rx.recv().await {
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("successfully removed"), "{body}");
        assert!(apps::get_app(&state.db, "web").await.unwrap().is_none());
        assert!(nodes::list_units_for_app(&state.db, "web").await.unwrap().is_empty());
        let recorded = events::list_visible(
            &state.db,
            &admin(),
            &EventFilter {
                kind: Some(schemes::APP_DELETE.to_string()),
                ..EventFilter::default()
            },
            0,
            10,
        )
        .await
        .unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(!recorded[0].running);
    }

    #[tokio::test]
    async fn visible_names_follow_read_contexts() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;
        seed_app(&state, "api", "red").await;

        assert_eq!(
            visible_app_names(&state, &admin(), schemes::APP_READ).await.unwrap(),
            None
        );
        assert_eq!(
            visible_app_names(&state, &creator("red"), schemes::APP_READ)
                .await
                .unwrap(),
            Some(vec!["api".to_string()])
        );
    }
}
