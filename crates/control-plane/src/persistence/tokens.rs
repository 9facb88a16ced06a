use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TokenKind {
    User,
    App,
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenRecord {
    pub id: Uuid,
    pub token_hash: String,
    pub kind: TokenKind,
    pub user_email: Option<String>,
    pub app_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub token_hash: String,
    pub kind: TokenKind,
    pub user_email: Option<String>,
    pub app_name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

const TOKEN_COLUMNS: &str = "id, token_hash, kind, user_email, app_name, created_at, expires_at";

pub async fn get_token(pool: &Db, id: Uuid) -> Result<Option<TokenRecord>> {
    let record = sqlx::query_as::<_, TokenRecord>(&format!(
        "SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn create_token(pool: &Db, token: NewToken) -> Result<TokenRecord> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO tokens (id, token_hash, kind, user_email, app_name, created_at, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(id)
    .bind(&token.token_hash)
    .bind(token.kind)
    .bind(&token.user_email)
    .bind(&token.app_name)
    .bind(Utc::now())
    .bind(token.expires_at)
    .execute(pool)
    .await?;

    get_token(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("token insert did not return row"))
}

/// Lookup by digest. Expiry is checked by the caller.
pub async fn find_by_hash(pool: &Db, token_hash: &str) -> Result<Option<TokenRecord>> {
    let record = sqlx::query_as::<_, TokenRecord>(&format!(
        "SELECT {TOKEN_COLUMNS} FROM tokens WHERE token_hash = ?1"
    ))
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn delete_token(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tokens WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_app_tokens(pool: &Db, app: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tokens WHERE kind = 'app' AND app_name = ?1")
        .bind(app)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn prune_expired(pool: &Db, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tokens WHERE expires_at IS NOT NULL AND expires_at <= ?1")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_unique_violation;
    use crate::persistence::migrations;
    use chrono::Duration;

    async fn setup_db() -> Db {
        let pool = migrations::init_pool("sqlite::memory:").await.unwrap();
        migrations::run_migrations(&pool).await.unwrap();
        pool
    }

    fn user_token(hash: &str, expires_at: Option<DateTime<Utc>>) -> NewToken {
        NewToken {
            token_hash: hash.into(),
            kind: TokenKind::User,
            user_email: Some("dev@example.com".into()),
            app_name: None,
            expires_at,
        }
    }

    #[tokio::test]
    async fn token_roundtrip_by_hash() {
        let db = setup_db().await;
        let record = create_token(&db, user_token("digest-1", None)).await.unwrap();

        let found = find_by_hash(&db, "digest-1").await.unwrap().expect("token");
        assert_eq!(found.id, record.id);
        assert_eq!(found.kind, TokenKind::User);
        assert!(!found.is_expired(Utc::now()));
        assert!(find_by_hash(&db, "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn digests_are_unique() {
        let db = setup_db().await;
        create_token(&db, user_token("digest-1", None)).await.unwrap();
        let err = create_token(&db, user_token("digest-1", None))
            .await
            .expect_err("duplicate digest");
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn prune_removes_only_expired() {
        let db = setup_db().await;
        let now = Utc::now();
        create_token(&db, user_token("old", Some(now - Duration::hours(1))))
            .await
            .unwrap();
        create_token(&db, user_token("fresh", Some(now + Duration::hours(1))))
            .await
            .unwrap();

        assert_eq!(prune_expired(&db, now).await.unwrap(), 1);
        assert!(find_by_hash(&db, "fresh").await.unwrap().is_some());
    }
}
