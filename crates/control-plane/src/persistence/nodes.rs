use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum NodeStatus {
    Ready,
    Disabled,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Ready => "ready",
            NodeStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeRecord {
    pub address: String,
    pub provisioner: String,
    pub pool: String,
    pub status: NodeStatus,
    #[sqlx(rename = "metadata_json")]
    pub metadata: Json<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub address: String,
    pub provisioner: String,
    pub pool: String,
    pub status: NodeStatus,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UnitRecord {
    pub id: String,
    pub app: String,
    pub provisioner: String,
    pub node_address: String,
    pub ip: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUnit {
    pub id: String,
    pub app: String,
    pub provisioner: String,
    pub node_address: String,
    pub ip: String,
}

const NODE_COLUMNS: &str =
    "address, provisioner, pool, status, metadata_json, created_at, updated_at";
const UNIT_COLUMNS: &str = "id, app, provisioner, node_address, ip, status, created_at";

pub async fn insert_node(pool: &Db, node: NewNode) -> Result<NodeRecord> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO nodes (address, provisioner, pool, status, metadata_json, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        "#,
    )
    .bind(&node.address)
    .bind(&node.provisioner)
    .bind(&node.pool)
    .bind(node.status)
    .bind(Json(&node.metadata))
    .bind(now)
    .execute(pool)
    .await?;

    get_node(pool, &node.address)
        .await?
        .ok_or_else(|| anyhow::anyhow!("node insert did not return row"))
}

pub async fn get_node(pool: &Db, address: &str) -> Result<Option<NodeRecord>> {
    let record = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE address = ?1"
    ))
    .bind(address)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_nodes(pool: &Db, provisioner: &str) -> Result<Vec<NodeRecord>> {
    let records = sqlx::query_as::<_, NodeRecord>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE provisioner = ?1 ORDER BY address ASC"
    ))
    .bind(provisioner)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn update_node(
    pool: &Db,
    address: &str,
    pool_name: &str,
    status: NodeStatus,
    metadata: &BTreeMap<String, String>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE nodes
        SET pool = ?2, status = ?3, metadata_json = ?4, updated_at = ?5
        WHERE address = ?1
        "#,
    )
    .bind(address)
    .bind(pool_name)
    .bind(status)
    .bind(Json(metadata))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_node(pool: &Db, address: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM nodes WHERE address = ?1")
        .bind(address)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn insert_unit(pool: &Db, unit: NewUnit) -> Result<UnitRecord> {
    sqlx::query(
        r#"
        INSERT INTO units (id, app, provisioner, node_address, ip, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'started', ?6)
        "#,
    )
    .bind(&unit.id)
    .bind(&unit.app)
    .bind(&unit.provisioner)
    .bind(&unit.node_address)
    .bind(&unit.ip)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    let record = sqlx::query_as::<_, UnitRecord>(&format!(
        "SELECT {UNIT_COLUMNS} FROM units WHERE id = ?1"
    ))
    .bind(&unit.id)
    .fetch_optional(pool)
    .await?;
    record.ok_or_else(|| anyhow::anyhow!("unit insert did not return row"))
}

pub async fn list_units_for_app(pool: &Db, app: &str) -> Result<Vec<UnitRecord>> {
    let records = sqlx::query_as::<_, UnitRecord>(&format!(
        "SELECT {UNIT_COLUMNS} FROM units WHERE app = ?1 ORDER BY created_at ASC, id ASC"
    ))
    .bind(app)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn list_units_on_node(pool: &Db, address: &str) -> Result<Vec<UnitRecord>> {
    let records = sqlx::query_as::<_, UnitRecord>(&format!(
        "SELECT {UNIT_COLUMNS} FROM units WHERE node_address = ?1 ORDER BY id ASC"
    ))
    .bind(address)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn move_unit(pool: &Db, id: &str, address: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE units SET node_address = ?2 WHERE id = ?1")
        .bind(id)
        .bind(address)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_unit(pool: &Db, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM units WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_units_for_app(pool: &Db, app: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM units WHERE app = ?1")
        .bind(app)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
