use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub email: String,
    pub api_key_prefix: Option<String>,
    pub api_key_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A role granted to a user in one context value, with the schemes it carries.
#[derive(Debug, Clone, FromRow)]
pub struct RoleGrantRecord {
    pub role_name: String,
    pub context_type: String,
    pub context_value: String,
    #[sqlx(rename = "schemes_json")]
    pub schemes: Json<Vec<String>>,
}

pub async fn create_team(pool: &Db, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO teams (name, created_at) VALUES (?1, ?2)")
        .bind(name)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_teams(pool: &Db) -> Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>("SELECT name FROM teams ORDER BY name ASC")
        .fetch_all(pool)
        .await?;
    Ok(names)
}

pub async fn team_exists(pool: &Db, name: &str) -> Result<bool> {
    let found: Option<String> = sqlx::query_scalar("SELECT name FROM teams WHERE name = ?1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

pub async fn create_user(pool: &Db, email: &str) -> Result<UserRecord> {
    sqlx::query("INSERT INTO users (email, created_at) VALUES (?1, ?2)")
        .bind(email)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    get_user(pool, email)
        .await?
        .ok_or_else(|| anyhow::anyhow!("user insert did not return row"))
}

pub async fn get_user(pool: &Db, email: &str) -> Result<Option<UserRecord>> {
    let record = sqlx::query_as::<_, UserRecord>(
        "SELECT email, api_key_prefix, api_key_hash, created_at FROM users WHERE email = ?1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn set_api_key(pool: &Db, email: &str, prefix: &str, hash: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE users SET api_key_prefix = ?2, api_key_hash = ?3 WHERE email = ?1")
            .bind(email)
            .bind(prefix)
            .bind(hash)
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

/// Candidates for an API key; the caller verifies the argon2 hash.
pub async fn users_with_key_prefix(pool: &Db, prefix: &str) -> Result<Vec<UserRecord>> {
    let records = sqlx::query_as::<_, UserRecord>(
        r#"
        SELECT email, api_key_prefix, api_key_hash, created_at
        FROM users
        WHERE api_key_prefix = ?1 AND api_key_hash IS NOT NULL
        "#,
    )
    .bind(prefix)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn upsert_role(
    pool: &Db,
    name: &str,
    context_type: &str,
    schemes: &[String],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO roles (name, context_type, schemes_json)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(name) DO UPDATE SET
            context_type = excluded.context_type,
            schemes_json = excluded.schemes_json
        "#,
    )
    .bind(name)
    .bind(context_type)
    .bind(Json(schemes))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn assign_role(pool: &Db, email: &str, role: &str, context_value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO role_assignments (email, role_name, context_value)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(email, role_name, context_value) DO NOTHING
        "#,
    )
    .bind(email)
    .bind(role)
    .bind(context_value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn role_grants_for_user(pool: &Db, email: &str) -> Result<Vec<RoleGrantRecord>> {
    let records = sqlx::query_as::<_, RoleGrantRecord>(
        r#"
        SELECT
            ra.role_name AS role_name,
            r.context_type AS context_type,
            ra.context_value AS context_value,
            r.schemes_json AS schemes_json
        FROM role_assignments ra
        JOIN roles r ON r.name = ra.role_name
        WHERE ra.email = ?1
        ORDER BY ra.role_name ASC, ra.context_value ASC
        "#,
    )
    .bind(email)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;

    #[tokio::test]
    async fn grants_join_roles_and_assignments() {
        let db = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&db).await.expect("migrations");

        create_user(&db, "dev@example.com").await.unwrap();
        upsert_role(&db, "deployer", "team", &["app.deploy".to_string()])
            .await
            .unwrap();
        assign_role(&db, "dev@example.com", "deployer", "blue")
            .await
            .unwrap();
        assign_role(&db, "dev@example.com", "deployer", "blue")
            .await
            .unwrap();

        let grants = role_grants_for_user(&db, "dev@example.com").await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].context_type, "team");
        assert_eq!(grants[0].context_value, "blue");
        assert_eq!(grants[0].schemes.0, vec!["app.deploy".to_string()]);
    }

    #[tokio::test]
    async fn api_key_candidates_use_prefix() {
        let db = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&db).await.expect("migrations");

        create_user(&db, "a@example.com").await.unwrap();
        create_user(&db, "b@example.com").await.unwrap();
        set_api_key(&db, "a@example.com", "abcd1234", "$argon2id$stub")
            .await
            .unwrap();

        let found = users_with_key_prefix(&db, "abcd1234").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].email, "a@example.com");
        assert!(users_with_key_prefix(&db, "zzzz").await.unwrap().is_empty());
    }
}
