use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, Sqlite};

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct ServiceRecord {
    pub name: String,
    #[sqlx(rename = "endpoint_json")]
    pub endpoint: Json<BTreeMap<String, String>>,
    pub username: String,
    pub password: String,
    #[sqlx(rename = "owner_teams_json")]
    pub owner_teams: Json<Vec<String>>,
    #[sqlx(rename = "teams_json")]
    pub teams: Json<Vec<String>>,
    pub is_restricted: bool,
    pub doc: String,
    pub created_at: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn production_endpoint(&self) -> Option<&str> {
        self.endpoint.0.get("production").map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct NewService {
    pub name: String,
    pub endpoint: BTreeMap<String, String>,
    pub username: String,
    pub password: String,
    pub owner_teams: Vec<String>,
    pub teams: Vec<String>,
    pub is_restricted: bool,
    pub doc: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct InstanceRecord {
    pub service_name: String,
    pub name: String,
    pub plan_name: String,
    pub description: String,
    pub team_owner: String,
    #[sqlx(rename = "teams_json")]
    pub teams: Json<Vec<String>>,
    #[sqlx(rename = "apps_json")]
    pub apps: Json<Vec<String>>,
    #[sqlx(rename = "units_json")]
    pub units: Json<Vec<String>>,
    #[sqlx(rename = "tags_json")]
    pub tags: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub service_name: String,
    pub name: String,
    pub plan_name: String,
    pub description: String,
    pub team_owner: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub service: Option<String>,
    pub app: Option<String>,
}

const SERVICE_COLUMNS: &str = r#"
    name,
    endpoint_json,
    username,
    password,
    owner_teams_json,
    teams_json,
    is_restricted,
    doc,
    created_at
"#;

const INSTANCE_COLUMNS: &str = r#"
    service_name,
    name,
    plan_name,
    description,
    team_owner,
    teams_json,
    apps_json,
    units_json,
    tags_json,
    created_at
"#;

pub async fn insert_service(pool: &Db, service: NewService) -> Result<ServiceRecord> {
    sqlx::query(
        r#"
        INSERT INTO services (
            name,
            endpoint_json,
            username,
            password,
            owner_teams_json,
            teams_json,
            is_restricted,
            doc,
            created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&service.name)
    .bind(Json(&service.endpoint))
    .bind(&service.username)
    .bind(&service.password)
    .bind(Json(&service.owner_teams))
    .bind(Json(&service.teams))
    .bind(service.is_restricted)
    .bind(&service.doc)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_service(pool, &service.name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("service insert did not return row"))
}

pub async fn get_service(pool: &Db, name: &str) -> Result<Option<ServiceRecord>> {
    let record = sqlx::query_as::<_, ServiceRecord>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE name = ?1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_services(pool: &Db) -> Result<Vec<ServiceRecord>> {
    let records = sqlx::query_as::<_, ServiceRecord>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services ORDER BY name ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn delete_service(pool: &Db, name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM services WHERE name = ?1")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn insert_instance(pool: &Db, instance: NewInstance) -> Result<InstanceRecord> {
    let teams = vec![instance.team_owner.clone()];
    sqlx::query(
        r#"
        INSERT INTO service_instances (
            service_name,
            name,
            plan_name,
            description,
            team_owner,
            teams_json,
            tags_json,
            created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&instance.service_name)
    .bind(&instance.name)
    .bind(&instance.plan_name)
    .bind(&instance.description)
    .bind(&instance.team_owner)
    .bind(Json(&teams))
    .bind(Json(&instance.tags))
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_instance(pool, &instance.service_name, &instance.name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("service instance insert did not return row"))
}

pub async fn get_instance(
    pool: &Db,
    service_name: &str,
    name: &str,
) -> Result<Option<InstanceRecord>> {
    let record = sqlx::query_as::<_, InstanceRecord>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM service_instances WHERE service_name = ?1 AND name = ?2"
    ))
    .bind(service_name)
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_instances(pool: &Db, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {INSTANCE_COLUMNS} FROM service_instances WHERE 1 = 1"
    ));
    if let Some(service) = &filter.service {
        qb.push(" AND service_name = ");
        qb.push_bind(service.clone());
    }
    if let Some(app) = &filter.app {
        qb.push(" AND EXISTS (SELECT 1 FROM json_each(apps_json) WHERE json_each.value = ");
        qb.push_bind(app.clone());
        qb.push(")");
    }
    qb.push(" ORDER BY service_name ASC, name ASC");

    let records = qb.build_query_as::<InstanceRecord>().fetch_all(pool).await?;
    Ok(records)
}

pub async fn count_instances(pool: &Db, service_name: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM service_instances WHERE service_name = ?1")
            .bind(service_name)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[derive(Debug, Clone)]
pub struct InstanceChanges {
    pub description: String,
    pub team_owner: String,
    pub tags: Vec<String>,
    pub plan_name: String,
    pub teams: Vec<String>,
}

pub async fn update_instance(
    pool: &Db,
    service_name: &str,
    name: &str,
    changes: &InstanceChanges,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE service_instances
        SET description = ?3, team_owner = ?4, tags_json = ?5, plan_name = ?6, teams_json = ?7
        WHERE service_name = ?1 AND name = ?2
        "#,
    )
    .bind(service_name)
    .bind(name)
    .bind(&changes.description)
    .bind(&changes.team_owner)
    .bind(Json(&changes.tags))
    .bind(&changes.plan_name)
    .bind(Json(&changes.teams))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn set_teams(pool: &Db, service_name: &str, name: &str, teams: &[String]) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE service_instances SET teams_json = ?3 WHERE service_name = ?1 AND name = ?2",
    )
    .bind(service_name)
    .bind(name)
    .bind(Json(teams))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Overwrite the bound apps and units of an instance.
pub async fn set_bindings(
    pool: &Db,
    service_name: &str,
    name: &str,
    apps: &[String],
    units: &[String],
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE service_instances
        SET apps_json = ?3, units_json = ?4
        WHERE service_name = ?1 AND name = ?2
        "#,
    )
    .bind(service_name)
    .bind(name)
    .bind(Json(apps))
    .bind(Json(units))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_instance(pool: &Db, service_name: &str, name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM service_instances WHERE service_name = ?1 AND name = ?2")
        .bind(service_name)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
