use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct PoolRecord {
    pub name: String,
    pub is_default: bool,
    pub provisioner: String,
    #[sqlx(rename = "teams_json")]
    pub teams: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl PoolRecord {
    /// A pool with no team restriction is open to everybody.
    pub fn is_public(&self) -> bool {
        self.teams.0.is_empty()
    }

    pub fn allows_team(&self, team: &str) -> bool {
        self.is_public() || self.teams.0.iter().any(|t| t == team)
    }
}

#[derive(Debug, Clone)]
pub struct NewPool {
    pub name: String,
    pub is_default: bool,
    pub provisioner: String,
    pub teams: Vec<String>,
}

const POOL_COLUMNS: &str = "name, is_default, provisioner, teams_json, created_at";

/// Insert a pool. With `replace_default`, an existing default pool loses the
/// flag in the same transaction.
pub async fn create_pool(pool: &Db, new_pool: NewPool, replace_default: bool) -> Result<PoolRecord> {
    let mut tx = pool.begin().await?;
    if new_pool.is_default && replace_default {
        sqlx::query("UPDATE pools SET is_default = 0 WHERE is_default = 1")
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO pools (name, is_default, provisioner, teams_json, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&new_pool.name)
    .bind(new_pool.is_default)
    .bind(&new_pool.provisioner)
    .bind(Json(&new_pool.teams))
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    get_pool(pool, &new_pool.name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("pool insert did not return row"))
}

pub async fn get_pool(pool: &Db, name: &str) -> Result<Option<PoolRecord>> {
    let record = sqlx::query_as::<_, PoolRecord>(&format!(
        "SELECT {POOL_COLUMNS} FROM pools WHERE name = ?1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn default_pool(pool: &Db) -> Result<Option<PoolRecord>> {
    let record = sqlx::query_as::<_, PoolRecord>(&format!(
        "SELECT {POOL_COLUMNS} FROM pools WHERE is_default = 1"
    ))
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_pools(pool: &Db) -> Result<Vec<PoolRecord>> {
    let records = sqlx::query_as::<_, PoolRecord>(&format!(
        "SELECT {POOL_COLUMNS} FROM pools ORDER BY name ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn delete_pool(pool: &Db, name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM pools WHERE name = ?1")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn set_teams(pool: &Db, name: &str, teams: &[String]) -> Result<u64> {
    let result = sqlx::query("UPDATE pools SET teams_json = ?2 WHERE name = ?1")
        .bind(name)
        .bind(Json(teams))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
