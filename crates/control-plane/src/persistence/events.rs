use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use uuid::Uuid;

use super::Db;
use crate::Result;
use crate::permission::PermissionContext;

#[derive(Debug, Clone, FromRow)]
pub struct EventRecord {
    pub id: Uuid,
    pub target_type: String,
    pub target_value: String,
    pub kind: String,
    pub owner: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: String,
    pub running: bool,
    pub lock_target: bool,
    pub lock_update_time: Option<DateTime<Utc>>,
    #[sqlx(rename = "custom_data_json")]
    pub custom_data: Json<Value>,
    #[sqlx(rename = "end_custom_data_json")]
    pub end_custom_data: Json<Value>,
    pub allowed_scheme: String,
    #[sqlx(rename = "allowed_contexts_json")]
    pub allowed_contexts: Json<Vec<PermissionContext>>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: Uuid,
    pub target_type: String,
    pub target_value: String,
    pub kind: String,
    pub owner: String,
    pub start_time: DateTime<Utc>,
    pub lock_target: bool,
    pub custom_data: Value,
    pub allowed_scheme: String,
    pub allowed_contexts: Vec<PermissionContext>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub target_type: Option<String>,
    pub target_value: Option<String>,
    pub kind: Option<String>,
    pub owner: Option<String>,
    pub running: Option<bool>,
}

const EVENT_COLUMNS: &str = r#"
    id,
    target_type,
    target_value,
    kind,
    owner,
    start_time,
    end_time,
    error,
    running,
    lock_target,
    lock_update_time,
    custom_data_json,
    end_custom_data_json,
    allowed_scheme,
    allowed_contexts_json
"#;

/// Insert a running event. A second running, lock-taking event on the same
/// target violates `events_running_target_lock_idx`.
pub async fn insert_event(pool: &Db, event: NewEvent) -> Result<EventRecord> {
    sqlx::query(
        r#"
        INSERT INTO events (
            id,
            target_type,
            target_value,
            kind,
            owner,
            start_time,
            running,
            lock_target,
            lock_update_time,
            custom_data_json,
            allowed_scheme,
            allowed_contexts_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?6, ?8, ?9, ?10)
        "#,
    )
    .bind(event.id)
    .bind(&event.target_type)
    .bind(&event.target_value)
    .bind(&event.kind)
    .bind(&event.owner)
    .bind(event.start_time)
    .bind(event.lock_target)
    .bind(Json(&event.custom_data))
    .bind(&event.allowed_scheme)
    .bind(Json(&event.allowed_contexts))
    .execute(pool)
    .await?;

    get_event(pool, event.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("event insert did not return row"))
}

pub async fn get_event(pool: &Db, id: Uuid) -> Result<Option<EventRecord>> {
    let record = sqlx::query_as::<_, EventRecord>(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn running_lock_holder(
    pool: &Db,
    target_type: &str,
    target_value: &str,
) -> Result<Option<EventRecord>> {
    let record = sqlx::query_as::<_, EventRecord>(&format!(
        r#"
        SELECT {EVENT_COLUMNS}
        FROM events
        WHERE target_type = ?1 AND target_value = ?2 AND running = 1 AND lock_target = 1
        LIMIT 1
        "#
    ))
    .bind(target_type)
    .bind(target_value)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Refresh the lock of a running event. Returns 0 once the event has ended.
pub async fn touch_event(pool: &Db, id: Uuid, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE events SET lock_update_time = ?2 WHERE id = ?1 AND running = 1",
    )
    .bind(id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// End a running event whose lock was last refreshed before `stale_before`.
pub async fn expire_event(
    pool: &Db,
    id: Uuid,
    stale_before: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE events
        SET running = 0, end_time = ?4, error = ?3
        WHERE id = ?1
          AND running = 1
          AND COALESCE(lock_update_time, start_time) < ?2
        "#,
    )
    .bind(id)
    .bind(stale_before)
    .bind(error)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Close a running event. Ended events are never touched again.
pub async fn finish_event(
    pool: &Db,
    id: Uuid,
    error: &str,
    end_custom_data: &Value,
    end_time: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE events
        SET running = 0, end_time = ?2, error = ?3, end_custom_data_json = ?4
        WHERE id = ?1 AND running = 1
        "#,
    )
    .bind(id)
    .bind(end_time)
    .bind(error)
    .bind(Json(end_custom_data))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// One page of events, newest first.
pub async fn list_events(
    pool: &Db,
    filter: &EventFilter,
    offset: usize,
    limit: usize,
) -> Result<Vec<EventRecord>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE 1 = 1"
    ));
    if let Some(target_type) = &filter.target_type {
        qb.push(" AND target_type = ");
        qb.push_bind(target_type.clone());
    }
    if let Some(target_value) = &filter.target_value {
        qb.push(" AND target_value = ");
        qb.push_bind(target_value.clone());
    }
    if let Some(kind) = &filter.kind {
        qb.push(" AND kind = ");
        qb.push_bind(kind.clone());
    }
    if let Some(owner) = &filter.owner {
        qb.push(" AND owner = ");
        qb.push_bind(owner.clone());
    }
    if let Some(running) = filter.running {
        qb.push(" AND running = ");
        qb.push_bind(running);
    }
    qb.push(" ORDER BY start_time DESC, id DESC LIMIT ");
    qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    qb.push(" OFFSET ");
    qb.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

    let records = qb.build_query_as::<EventRecord>().fetch_all(pool).await?;
    Ok(records)
}

pub async fn prune_ended(pool: &Db, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM events WHERE running = 0 AND end_time IS NOT NULL AND end_time < ?1",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
