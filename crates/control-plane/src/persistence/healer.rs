use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

/// Stored healer policy. `None` fields inherit from the base (`""`) entry.
#[derive(Debug, Clone, Default, FromRow)]
pub struct HealerConfigRecord {
    pub pool: String,
    pub enabled: Option<bool>,
    pub max_unresponsive_secs: Option<i64>,
    pub max_since_success_secs: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct HealerConfigUpdate {
    pub enabled: Option<bool>,
    pub max_unresponsive_secs: Option<i64>,
    pub max_since_success_secs: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealerField {
    Enabled,
    MaxUnresponsive,
    MaxSinceSuccess,
}

impl HealerField {
    fn column(self) -> &'static str {
        match self {
            HealerField::Enabled => "enabled",
            HealerField::MaxUnresponsive => "max_unresponsive_secs",
            HealerField::MaxSinceSuccess => "max_since_success_secs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "TEXT", rename_all = "kebab-case")]
pub enum HealingAction {
    NodeHealing,
    ContainerHealing,
}

impl HealingAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HealingAction::NodeHealing => "node-healing",
            HealingAction::ContainerHealing => "container-healing",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct HealingEventRecord {
    pub id: Uuid,
    pub action: HealingAction,
    pub failing: String,
    pub created: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: String,
    pub successful: bool,
}

#[derive(Debug, Clone)]
pub struct NewHealingEvent {
    pub action: HealingAction,
    pub failing: String,
    pub created: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: String,
}

pub async fn get_config(pool: &Db, pool_name: &str) -> Result<Option<HealerConfigRecord>> {
    let record = sqlx::query_as::<_, HealerConfigRecord>(
        r#"
        SELECT pool, enabled, max_unresponsive_secs, max_since_success_secs
        FROM healer_configs
        WHERE pool = ?1
        "#,
    )
    .bind(pool_name)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_configs(pool: &Db) -> Result<Vec<HealerConfigRecord>> {
    let records = sqlx::query_as::<_, HealerConfigRecord>(
        r#"
        SELECT pool, enabled, max_unresponsive_secs, max_since_success_secs
        FROM healer_configs
        ORDER BY pool ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Merge the set fields of `update` into the pool entry, creating it if needed.
pub async fn merge_config(pool: &Db, pool_name: &str, update: &HealerConfigUpdate) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO healer_configs (pool, enabled, max_unresponsive_secs, max_since_success_secs, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(pool) DO UPDATE SET
            enabled = COALESCE(excluded.enabled, healer_configs.enabled),
            max_unresponsive_secs = COALESCE(excluded.max_unresponsive_secs, healer_configs.max_unresponsive_secs),
            max_since_success_secs = COALESCE(excluded.max_since_success_secs, healer_configs.max_since_success_secs),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(pool_name)
    .bind(update.enabled)
    .bind(update.max_unresponsive_secs)
    .bind(update.max_since_success_secs)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_field(pool: &Db, pool_name: &str, field: HealerField) -> Result<u64> {
    let result = sqlx::query(&format!(
        "UPDATE healer_configs SET {} = NULL, updated_at = ?2 WHERE pool = ?1",
        field.column()
    ))
    .bind(pool_name)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_config(pool: &Db, pool_name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM healer_configs WHERE pool = ?1")
        .bind(pool_name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn insert_healing_event(pool: &Db, event: NewHealingEvent) -> Result<HealingEventRecord> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO healer_history (id, action, failing, created, start_time, end_time, error, successful)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(id)
    .bind(event.action)
    .bind(&event.failing)
    .bind(&event.created)
    .bind(event.start_time)
    .bind(event.end_time)
    .bind(&event.error)
    .bind(event.error.is_empty() && event.end_time.is_some())
    .execute(pool)
    .await?;

    let record = sqlx::query_as::<_, HealingEventRecord>(
        r#"
        SELECT id, action, failing, created, start_time, end_time, error, successful
        FROM healer_history
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    record.ok_or_else(|| anyhow::anyhow!("healing event insert did not return row"))
}

pub async fn list_healing_events(
    pool: &Db,
    action: Option<HealingAction>,
    limit: u32,
) -> Result<Vec<HealingEventRecord>> {
    let records = sqlx::query_as::<_, HealingEventRecord>(
        r#"
        SELECT id, action, failing, created, start_time, end_time, error, successful
        FROM healer_history
        WHERE ?1 IS NULL OR action = ?1
        ORDER BY start_time DESC
        LIMIT ?2
        "#,
    )
    .bind(action)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;

    #[tokio::test]
    async fn merge_keeps_unset_fields() {
        let db = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&db).await.expect("migrations");

        merge_config(
            &db,
            "p1",
            &HealerConfigUpdate {
                enabled: Some(true),
                max_unresponsive_secs: Some(60),
                max_since_success_secs: None,
            },
        )
        .await
        .unwrap();
        merge_config(
            &db,
            "p1",
            &HealerConfigUpdate {
                max_since_success_secs: Some(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let cfg = get_config(&db, "p1").await.unwrap().unwrap();
        assert_eq!(cfg.enabled, Some(true));
        assert_eq!(cfg.max_unresponsive_secs, Some(60));
        assert_eq!(cfg.max_since_success_secs, Some(30));

        clear_field(&db, "p1", HealerField::Enabled).await.unwrap();
        let cfg = get_config(&db, "p1").await.unwrap().unwrap();
        assert_eq!(cfg.enabled, None);
    }

    #[tokio::test]
    async fn history_filters_by_action() {
        let db = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&db).await.expect("migrations");
        let now = Utc::now();
        for (action, failing) in [
            (HealingAction::NodeHealing, "http://n1:2375"),
            (HealingAction::ContainerHealing, "c1"),
        ] {
            insert_healing_event(
                &db,
                NewHealingEvent {
                    action,
                    failing: failing.into(),
                    created: String::new(),
                    start_time: now,
                    end_time: Some(now),
                    error: String::new(),
                },
            )
            .await
            .unwrap();
        }

        let nodes = list_healing_events(&db, Some(HealingAction::NodeHealing), 10)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].successful);
        assert_eq!(list_healing_events(&db, None, 10).await.unwrap().len(), 2);
    }
}
