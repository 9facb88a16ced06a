use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct DeployRecord {
    pub id: Uuid,
    pub app: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    #[sqlx(rename = "commit_sha")]
    pub commit: String,
    pub error: String,
    pub image: String,
    pub origin: String,
    pub kind: String,
    #[sqlx(rename = "user_name")]
    pub user: String,
    pub diff: String,
    pub can_rollback: bool,
    pub removed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDeploy {
    pub app: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub commit: String,
    pub image: String,
    pub origin: String,
    pub kind: String,
    pub user: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeployFilter {
    pub app: Option<String>,
    /// `None` means every app is visible.
    pub visible_apps: Option<Vec<String>>,
    pub skip: u32,
    pub limit: u32,
}

const DEPLOY_COLUMNS: &str = r#"
    id,
    app,
    timestamp,
    duration_ms,
    commit_sha,
    error,
    image,
    origin,
    kind,
    user_name,
    diff,
    can_rollback,
    removed_at
"#;

/// Record a successful deploy or rollback.
///
/// Earlier image-producing deploys become rollback targets, the app counter is
/// bumped and, when an image was produced, it becomes the app's current image.
pub async fn record_success(pool: &Db, deploy: NewDeploy) -> Result<DeployRecord> {
    let id = Uuid::new_v4();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE deploys
        SET can_rollback = 1
        WHERE app = ?1 AND image != '' AND error = '' AND removed_at IS NULL
        "#,
    )
    .bind(&deploy.app)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO deploys (
            id,
            app,
            timestamp,
            duration_ms,
            commit_sha,
            error,
            image,
            origin,
            kind,
            user_name,
            can_rollback
        )
        VALUES (?1, ?2, ?3, ?4, ?5, '', ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(id)
    .bind(&deploy.app)
    .bind(deploy.timestamp)
    .bind(deploy.duration_ms)
    .bind(&deploy.commit)
    .bind(&deploy.image)
    .bind(&deploy.origin)
    .bind(&deploy.kind)
    .bind(&deploy.user)
    .bind(!deploy.image.is_empty())
    .execute(&mut *tx)
    .await?;

    let updated = sqlx::query(
        r#"
        UPDATE apps
        SET deploys = deploys + 1,
            current_image = CASE WHEN ?2 != '' THEN ?2 ELSE current_image END,
            updated_at = ?3
        WHERE name = ?1
        "#,
    )
    .bind(&deploy.app)
    .bind(&deploy.image)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        anyhow::bail!("app {} vanished while recording deploy", deploy.app);
    }

    tx.commit().await?;

    get_deploy(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("deploy insert did not return row"))
}

/// Record a failed deploy. The counter is untouched and the row never becomes
/// a rollback target.
pub async fn record_failure(pool: &Db, deploy: NewDeploy, error: &str) -> Result<DeployRecord> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO deploys (
            id,
            app,
            timestamp,
            duration_ms,
            commit_sha,
            error,
            image,
            origin,
            kind,
            user_name,
            can_rollback
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)
        "#,
    )
    .bind(id)
    .bind(&deploy.app)
    .bind(deploy.timestamp)
    .bind(deploy.duration_ms)
    .bind(&deploy.commit)
    .bind(error)
    .bind(&deploy.image)
    .bind(&deploy.origin)
    .bind(&deploy.kind)
    .bind(&deploy.user)
    .execute(pool)
    .await?;

    get_deploy(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("deploy insert did not return row"))
}

pub async fn get_deploy(pool: &Db, id: Uuid) -> Result<Option<DeployRecord>> {
    let record = sqlx::query_as::<_, DeployRecord>(&format!(
        "SELECT {DEPLOY_COLUMNS} FROM deploys WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_deploys(pool: &Db, filter: &DeployFilter) -> Result<Vec<DeployRecord>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {DEPLOY_COLUMNS} FROM deploys WHERE removed_at IS NULL"
    ));

    if let Some(app) = &filter.app {
        qb.push(" AND app = ");
        qb.push_bind(app.clone());
    }

    if let Some(apps) = &filter.visible_apps {
        if apps.is_empty() {
            return Ok(Vec::new());
        }
        qb.push(" AND app IN (");
        let mut separated = qb.separated(", ");
        for app in apps {
            separated.push_bind(app.clone());
        }
        separated.push_unseparated(")");
    }

    qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ");
    qb.push_bind(filter.limit as i64);
    qb.push(" OFFSET ");
    qb.push_bind(filter.skip as i64);

    let records = qb.build_query_as::<DeployRecord>().fetch_all(pool).await?;
    Ok(records)
}

pub async fn latest_for_app(pool: &Db, app: &str) -> Result<Option<DeployRecord>> {
    let record = sqlx::query_as::<_, DeployRecord>(&format!(
        r#"
        SELECT {DEPLOY_COLUMNS}
        FROM deploys
        WHERE app = ?1 AND removed_at IS NULL
        ORDER BY timestamp DESC, id DESC
        LIMIT 1
        "#
    ))
    .bind(app)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Images the app may roll back to, newest first.
pub async fn rollback_candidates(pool: &Db, app: &str) -> Result<Vec<DeployRecord>> {
    let records = sqlx::query_as::<_, DeployRecord>(&format!(
        r#"
        SELECT {DEPLOY_COLUMNS}
        FROM deploys
        WHERE app = ?1 AND can_rollback = 1 AND image != '' AND removed_at IS NULL
        ORDER BY timestamp DESC, id DESC
        "#
    ))
    .bind(app)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn set_diff(pool: &Db, id: Uuid, diff: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE deploys SET diff = ?2 WHERE id = ?1")
        .bind(id)
        .bind(diff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Flag every deploy of a deleted app for garbage collection.
pub async fn mark_removed(pool: &Db, app: &str, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE deploys
        SET removed_at = ?2
        WHERE app = ?1 AND removed_at IS NULL
        "#,
    )
    .bind(app)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn prune_removed(pool: &Db, cutoff: DateTime<Utc>) -> Result<u64> {
    let result =
        sqlx::query("DELETE FROM deploys WHERE removed_at IS NOT NULL AND removed_at < ?1")
            .bind(cutoff)
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

pub async fn count_successful(pool: &Db, app: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM deploys WHERE app = ?1 AND error = '' AND removed_at IS NULL",
    )
    .bind(app)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{apps, migrations, pools};
    use chrono::Duration;
    use std::collections::BTreeMap;

    async fn setup() -> Db {
        let db = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&db).await.expect("migrations");
        pools::create_pool(
            &db,
            pools::NewPool {
                name: "main".into(),
                is_default: true,
                provisioner: String::new(),
                teams: Vec::new(),
            },
            false,
        )
        .await
        .expect("pool");
        for name in ["web", "worker"] {
            apps::create_app(
                &db,
                apps::NewApp {
                    name: name.into(),
                    platform: "go".into(),
                    plan: String::new(),
                    pool: "main".into(),
                    team_owner: "team".into(),
                    teams: vec!["team".into()],
                    description: String::new(),
                    env: BTreeMap::new(),
                },
            )
            .await
            .expect("app");
        }
        db
    }

    fn deploy(app: &str, image: &str, at: DateTime<Utc>) -> NewDeploy {
        NewDeploy {
            app: app.into(),
            timestamp: at,
            duration_ms: 10,
            commit: String::new(),
            image: image.into(),
            origin: String::new(),
            kind: "image".into(),
            user: "dev@example.com".into(),
        }
    }

    #[tokio::test]
    async fn success_marks_previous_images_rollbackable() {
        let db = setup().await;
        let now = Utc::now();
        let first = record_success(&db, deploy("web", "img:v1", now - Duration::seconds(10)))
            .await
            .unwrap();
        assert!(first.can_rollback);
        record_failure(&db, deploy("web", "", now - Duration::seconds(5)), "boom")
            .await
            .unwrap();
        record_success(&db, deploy("web", "img:v2", now)).await.unwrap();

        let app = apps::get_app(&db, "web").await.unwrap().unwrap();
        assert_eq!(app.deploys, 2);
        assert_eq!(app.current_image, "img:v2");
        assert_eq!(count_successful(&db, "web").await.unwrap(), 2);

        let candidates = rollback_candidates(&db, "web").await.unwrap();
        let images: Vec<_> = candidates.iter().map(|d| d.image.as_str()).collect();
        assert_eq!(images, vec!["img:v2", "img:v1"]);
    }

    #[tokio::test]
    async fn list_filters_by_app_and_visibility() {
        let db = setup().await;
        let now = Utc::now();
        record_success(&db, deploy("web", "a:v1", now - Duration::seconds(2)))
            .await
            .unwrap();
        record_success(&db, deploy("worker", "b:v1", now - Duration::seconds(1)))
            .await
            .unwrap();
        record_success(&db, deploy("web", "a:v2", now)).await.unwrap();

        let only_web = list_deploys(
            &db,
            &DeployFilter {
                app: Some("web".into()),
                visible_apps: None,
                skip: 0,
                limit: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(only_web.len(), 2);
        assert!(only_web.iter().all(|d| d.app == "web"));
        assert_eq!(only_web[0].image, "a:v2");

        let hidden = list_deploys(
            &db,
            &DeployFilter {
                app: None,
                visible_apps: Some(vec!["worker".into()]),
                skip: 0,
                limit: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(hidden.len(), 1);
        assert_eq!(hidden[0].app, "worker");
    }

    #[tokio::test]
    async fn removed_deploys_are_pruned_after_cutoff() {
        let db = setup().await;
        let now = Utc::now();
        record_success(&db, deploy("web", "a:v1", now)).await.unwrap();
        mark_removed(&db, "web", now - Duration::days(40)).await.unwrap();
        assert!(latest_for_app(&db, "web").await.unwrap().is_none());
        let pruned = prune_removed(&db, now - Duration::days(30)).await.unwrap();
        assert_eq!(pruned, 1);
    }
}
