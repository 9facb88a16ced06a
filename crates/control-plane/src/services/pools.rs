use common::api::PoolView;
use serde_json::json;
use tracing::info;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError, is_unique_violation};
use crate::events::{self, Allowed, EventOpts, targets};
use crate::permission::{PermissionContext, schemes};
use crate::persistence::{NewPool, PoolRecord, apps, pools, users};

pub const POOL_NOT_FOUND: &str = "Pool not found.";

#[derive(Debug, Clone, Default)]
pub struct CreatePoolRequest {
    pub name: String,
    pub default: bool,
    /// Replace an existing default pool.
    pub force: bool,
    pub provisioner: String,
    /// Public pools accept apps from every team.
    pub public: bool,
    pub teams: Vec<String>,
}

pub fn pool_contexts(pool: &PoolRecord) -> Vec<PermissionContext> {
    let mut contexts = vec![PermissionContext::pool(pool.name.clone())];
    contexts.extend(pool.teams.0.iter().cloned().map(PermissionContext::team));
    contexts
}

pub fn to_view(pool: PoolRecord) -> PoolView {
    PoolView {
        name: pool.name,
        default: pool.is_default,
        provisioner: pool.provisioner,
        teams: pool.teams.0,
    }
}

pub async fn get_pool(state: &AppState, name: &str) -> ApiResult<PoolRecord> {
    pools::get_pool(&state.db, name)
        .await?
        .ok_or_else(|| AppError::not_found(POOL_NOT_FOUND))
}

/// Pools without teams are visible to everyone.
pub async fn list_visible(state: &AppState, principal: &Principal) -> ApiResult<Vec<PoolView>> {
    Ok(pools::list_pools(&state.db)
        .await?
        .into_iter()
        .filter(|pool| {
            pool.teams.0.is_empty() || principal.allows(schemes::POOL_READ, &pool_contexts(pool))
        })
        .map(to_view)
        .collect())
}

pub async fn create_pool(
    state: &AppState,
    principal: &Principal,
    req: CreatePoolRequest,
) -> ApiResult<PoolRecord> {
    principal.require(schemes::POOL_CREATE, &[])?;
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::bad_request("Pool name is required."));
    }
    if !req.provisioner.is_empty() {
        state.provisioners.get(&req.provisioner)?;
    }
    if req.default
        && !req.force
        && pools::default_pool(&state.db).await?.is_some()
    {
        return Err(AppError::conflict("Default pool already exists."));
    }
    let teams = if req.public { Vec::new() } else { req.teams };
    for team in &teams {
        if !users::team_exists(&state.db, team).await? {
            return Err(AppError::not_found("Team not found."));
        }
    }

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::POOL,
            name.clone(),
            schemes::POOL_CREATE,
            principal,
            Allowed::new(schemes::POOL_READ, vec![PermissionContext::pool(name.clone())]),
        )
        .with_data(json!({
            "name": name,
            "default": req.default,
            "force": req.force,
            "provisioner": req.provisioner,
        })),
    )
    .await?;

    let created = pools::create_pool(
        &state.db,
        NewPool {
            name: name.clone(),
            is_default: req.default,
            provisioner: req.provisioner,
            teams,
        },
        req.force,
    )
    .await;
    match created {
        Ok(pool) => {
            event.done(None).await;
            info!(pool = %pool.name, default = pool.is_default, "pool created");
            Ok(pool)
        }
        Err(err) if is_unique_violation(&err) => {
            let msg = "Pool already exists.";
            event.done(Some(msg)).await;
            Err(AppError::conflict(msg))
        }
        Err(err) => {
            event.done(Some(&err.to_string())).await;
            Err(err.into())
        }
    }
}

pub async fn delete_pool(state: &AppState, principal: &Principal, name: &str) -> ApiResult<()> {
    let pool = get_pool(state, name).await?;
    principal.require(schemes::POOL_DELETE, &pool_contexts(&pool))?;
    if apps::count_apps_in_pool(&state.db, name).await? > 0 {
        return Err(AppError::forbidden(
            "This pool has apps, you need to migrate or remove them before removing the pool",
        ));
    }

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::POOL,
            name,
            schemes::POOL_DELETE,
            principal,
            Allowed::new(schemes::POOL_READ, pool_contexts(&pool)),
        ),
    )
    .await?;
    let result = pools::delete_pool(&state.db, name).await;
    event
        .done(result.as_ref().err().map(|err| err.to_string()).as_deref())
        .await;
    result?;
    info!(pool = %name, "pool removed");
    Ok(())
}

pub async fn add_team(
    state: &AppState,
    principal: &Principal,
    name: &str,
    team: &str,
) -> ApiResult<()> {
    let pool = get_pool(state, name).await?;
    principal.require(schemes::POOL_UPDATE_TEAM_ADD, &pool_contexts(&pool))?;
    if !users::team_exists(&state.db, team).await? {
        return Err(AppError::not_found("Team not found."));
    }
    let mut teams = pool.teams.0;
    if teams.iter().any(|t| t == team) {
        return Ok(());
    }
    teams.push(team.to_string());
    pools::set_teams(&state.db, name, &teams).await?;
    Ok(())
}

pub async fn remove_team(
    state: &AppState,
    principal: &Principal,
    name: &str,
    team: &str,
) -> ApiResult<()> {
    let pool = get_pool(state, name).await?;
    principal.require(schemes::POOL_UPDATE_TEAM_REMOVE, &pool_contexts(&pool))?;
    let mut teams = pool.teams.0;
    let before = teams.len();
    teams.retain(|t| t != team);
    if teams.len() == before {
        return Err(AppError::not_found(format!(
            "Team {team:?} has no access to pool {name:?}"
        )));
    }
    pools::set_teams(&state.db, name, &teams).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::services::test_support::{seed_app, seed_team, setup_state};

    fn admin() -> Principal {
        Principal::user("admin@example.com", vec![Permission::root()])
    }

    fn request(name: &str, default: bool, force: bool) -> CreatePoolRequest {
        CreatePoolRequest {
            name: name.into(),
            default,
            force,
            public: true,
            ..CreatePoolRequest::default()
        }
    }

    #[tokio::test]
    async fn second_default_needs_force() {
        let state = setup_state().await;
        create_pool(&state, &admin(), request("p1", true, false)).await.unwrap();

        let err = create_pool(&state, &admin(), request("p2", true, false))
            .await
            .unwrap_err();
        assert_eq!(err.code, "conflict");

        create_pool(&state, &admin(), request("p2", true, true)).await.unwrap();
        let default = pools::default_pool(&state.db).await.unwrap().unwrap();
        assert_eq!(default.name, "p2");

        let dup = create_pool(&state, &admin(), request("p2", false, false))
            .await
            .unwrap_err();
        assert_eq!(dup.message, "Pool already exists.");
    }

    #[tokio::test]
    async fn unknown_provisioner_is_rejected() {
        let state = setup_state().await;
        let err = create_pool(
            &state,
            &admin(),
            CreatePoolRequest {
                name: "p1".into(),
                provisioner: "kubernetes".into(),
                ..CreatePoolRequest::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn pools_in_use_cannot_be_removed() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;
        let err = delete_pool(&state, &admin(), "main").await.unwrap_err();
        assert_eq!(err.code, "forbidden");
    }

    #[tokio::test]
    async fn team_access_controls_visibility() {
        let state = setup_state().await;
        seed_team(&state, "blue").await;
        create_pool(
            &state,
            &admin(),
            CreatePoolRequest {
                name: "private".into(),
                ..CreatePoolRequest::default()
            },
        )
        .await
        .unwrap();
        add_team(&state, &admin(), "private", "blue").await.unwrap();
        add_team(&state, &admin(), "private", "blue").await.unwrap();

        let blue = Principal::user(
            "dev@example.com",
            vec![Permission::new(schemes::POOL_READ, PermissionContext::team("blue"))],
        );
        let red = Principal::user(
            "other@example.com",
            vec![Permission::new(schemes::POOL_READ, PermissionContext::team("red"))],
        );
        assert_eq!(list_visible(&state, &blue).await.unwrap().len(), 1);
        assert!(list_visible(&state, &red).await.unwrap().is_empty());

        remove_team(&state, &admin(), "private", "blue").await.unwrap();
        assert!(
            remove_team(&state, &admin(), "private", "blue")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
