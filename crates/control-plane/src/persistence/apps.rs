use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;

/// Stored value of one environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub value: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub sensitive: bool,
    /// Service instance (`service/instance`) that injected the variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct AppRecord {
    pub name: String,
    pub platform: String,
    pub plan: String,
    pub pool: String,
    pub team_owner: String,
    #[sqlx(rename = "teams_json")]
    pub teams: Json<Vec<String>>,
    pub description: String,
    #[sqlx(rename = "env_json")]
    pub env: Json<BTreeMap<String, EnvEntry>>,
    pub deploys: i64,
    pub current_image: String,
    pub lock_locked: bool,
    pub lock_reason: String,
    pub lock_owner: String,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub lock_update_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApp {
    pub name: String,
    pub platform: String,
    pub plan: String,
    pub pool: String,
    pub team_owner: String,
    pub teams: Vec<String>,
    pub description: String,
    pub env: BTreeMap<String, EnvEntry>,
}

const APP_COLUMNS: &str = r#"
    name,
    platform,
    plan,
    pool,
    team_owner,
    teams_json,
    description,
    env_json,
    deploys,
    current_image,
    lock_locked,
    lock_reason,
    lock_owner,
    lock_acquired_at,
    lock_update_time,
    created_at,
    updated_at
"#;

pub async fn create_app(pool: &Db, new_app: NewApp) -> Result<AppRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO apps (
            name,
            platform,
            plan,
            pool,
            team_owner,
            teams_json,
            description,
            env_json,
            created_at,
            updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
        "#,
    )
    .bind(&new_app.name)
    .bind(&new_app.platform)
    .bind(&new_app.plan)
    .bind(&new_app.pool)
    .bind(&new_app.team_owner)
    .bind(Json(&new_app.teams))
    .bind(&new_app.description)
    .bind(Json(&new_app.env))
    .bind(now)
    .execute(pool)
    .await?;

    get_app(pool, &new_app.name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("app insert did not return row"))
}

pub async fn get_app(pool: &Db, name: &str) -> Result<Option<AppRecord>> {
    let record = sqlx::query_as::<_, AppRecord>(&format!(
        "SELECT {APP_COLUMNS} FROM apps WHERE name = ?1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_apps(pool: &Db) -> Result<Vec<AppRecord>> {
    let records = sqlx::query_as::<_, AppRecord>(&format!(
        "SELECT {APP_COLUMNS} FROM apps ORDER BY name ASC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn count_apps_in_pool(pool: &Db, pool_name: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM apps WHERE pool = ?1")
        .bind(pool_name)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn delete_app(pool: &Db, name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM apps WHERE name = ?1")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn set_env(pool: &Db, name: &str, env: &BTreeMap<String, EnvEntry>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE apps
        SET env_json = ?2, updated_at = ?3
        WHERE name = ?1
        "#,
    )
    .bind(name)
    .bind(Json(env))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn set_current_image(pool: &Db, name: &str, image: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE apps
        SET current_image = ?2, updated_at = ?3
        WHERE name = ?1
        "#,
    )
    .bind(name)
    .bind(image)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Compare-and-set on the lock flag. A held lock whose last refresh is older
/// than `stale_before` is taken over. Returns the number of rows taken (0 or 1).
pub async fn try_lock(
    pool: &Db,
    name: &str,
    reason: &str,
    owner: &str,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE apps
        SET lock_locked = 1,
            lock_reason = ?2,
            lock_owner = ?3,
            lock_acquired_at = ?4,
            lock_update_time = ?4
        WHERE name = ?1
          AND (lock_locked = 0 OR COALESCE(lock_update_time, lock_acquired_at) < ?5)
        "#,
    )
    .bind(name)
    .bind(reason)
    .bind(owner)
    .bind(now)
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Refresh a held lock. Matches on the acquisition time so a lock taken over
/// by someone else is left alone.
pub async fn touch_lock(
    pool: &Db,
    name: &str,
    acquired_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE apps
        SET lock_update_time = ?3
        WHERE name = ?1 AND lock_locked = 1 AND lock_acquired_at = ?2
        "#,
    )
    .bind(name)
    .bind(acquired_at)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn unlock(pool: &Db, name: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE apps
        SET lock_locked = 0,
            lock_reason = '',
            lock_owner = '',
            lock_acquired_at = NULL,
            lock_update_time = NULL
        WHERE name = ?1
        "#,
    )
    .bind(name)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
