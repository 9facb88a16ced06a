use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct MachineRecord {
    pub id: String,
    pub iaas: String,
    pub address: String,
    #[sqlx(rename = "creation_params_json")]
    pub creation_params: Json<BTreeMap<String, String>>,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMachine {
    pub id: String,
    pub iaas: String,
    pub address: String,
    pub creation_params: BTreeMap<String, String>,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TemplateRecord {
    pub name: String,
    pub iaas: String,
    #[sqlx(rename = "params_json")]
    pub params: Json<BTreeMap<String, String>>,
}

const MACHINE_COLUMNS: &str =
    "id, iaas, address, creation_params_json, ca_cert, client_cert, created_at";

pub async fn insert_machine(pool: &Db, machine: NewMachine) -> Result<MachineRecord> {
    sqlx::query(
        r#"
        INSERT INTO machines (id, iaas, address, creation_params_json, ca_cert, client_cert, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&machine.id)
    .bind(&machine.iaas)
    .bind(&machine.address)
    .bind(Json(&machine.creation_params))
    .bind(&machine.ca_cert)
    .bind(&machine.client_cert)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_machine(pool, &machine.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("machine insert did not return row"))
}

pub async fn get_machine(pool: &Db, id: &str) -> Result<Option<MachineRecord>> {
    let record = sqlx::query_as::<_, MachineRecord>(&format!(
        "SELECT {MACHINE_COLUMNS} FROM machines WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Machines are addressed by host only; callers strip scheme and port.
pub async fn find_by_address(pool: &Db, host: &str) -> Result<Option<MachineRecord>> {
    let record = sqlx::query_as::<_, MachineRecord>(&format!(
        "SELECT {MACHINE_COLUMNS} FROM machines WHERE address = ?1 LIMIT 1"
    ))
    .bind(host)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_machines(pool: &Db) -> Result<Vec<MachineRecord>> {
    let records = sqlx::query_as::<_, MachineRecord>(&format!(
        "SELECT {MACHINE_COLUMNS} FROM machines ORDER BY created_at ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn delete_machine(pool: &Db, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM machines WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn upsert_template(
    pool: &Db,
    name: &str,
    iaas: &str,
    params: &BTreeMap<String, String>,
) -> Result<TemplateRecord> {
    sqlx::query(
        r#"
        INSERT INTO iaas_templates (name, iaas, params_json)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(name) DO UPDATE SET iaas = excluded.iaas, params_json = excluded.params_json
        "#,
    )
    .bind(name)
    .bind(iaas)
    .bind(Json(params))
    .execute(pool)
    .await?;

    get_template(pool, name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("template upsert did not return row"))
}

pub async fn get_template(pool: &Db, name: &str) -> Result<Option<TemplateRecord>> {
    let record = sqlx::query_as::<_, TemplateRecord>(
        "SELECT name, iaas, params_json FROM iaas_templates WHERE name = ?1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_templates(pool: &Db) -> Result<Vec<TemplateRecord>> {
    let records = sqlx::query_as::<_, TemplateRecord>(
        "SELECT name, iaas, params_json FROM iaas_templates ORDER BY name ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn delete_template(pool: &Db, name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM iaas_templates WHERE name = ?1")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
