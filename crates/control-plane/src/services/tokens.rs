use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{NewToken, TokenKind, apps, tokens, users};
use crate::tokens::{api_key_prefix, digest_token, generate_token, hash_api_key};

#[derive(Clone, Debug)]
pub struct TokenWithValue {
    pub token_id: Uuid,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Issue a session token for an existing user, valid for `auth.token_ttl_secs`.
pub async fn issue_user_token(state: &AppState, email: &str) -> ApiResult<TokenWithValue> {
    if users::get_user(&state.db, email).await?.is_none() {
        return Err(AppError::not_found("User not found."));
    }

    let expires_at = if state.auth.token_ttl_secs == 0 {
        None
    } else {
        Some(Utc::now() + Duration::seconds(state.auth.token_ttl_secs as i64))
    };
    store_token(state, TokenKind::User, Some(email.to_string()), None, expires_at).await
}

/// Issue a non-expiring token bound to one app.
pub async fn issue_app_token(state: &AppState, app: &str) -> ApiResult<TokenWithValue> {
    if apps::get_app(&state.db, app).await?.is_none() {
        return Err(AppError::not_found("App not found."));
    }
    store_token(state, TokenKind::App, None, Some(app.to_string()), None).await
}

/// Replace the user's API key and return the new plaintext key.
pub async fn issue_api_key(state: &AppState, email: &str) -> ApiResult<String> {
    let key = generate_token();
    let prefix = api_key_prefix(&key)
        .ok_or_else(|| AppError::internal("generated api key too short"))?;
    let hash = hash_api_key(&key, &state.auth.token_pepper)?;
    let updated = users::set_api_key(&state.db, email, prefix, &hash).await?;
    if updated == 0 {
        return Err(AppError::not_found("User not found."));
    }
    Ok(key)
}

pub async fn revoke_token(state: &AppState, token_id: Uuid) -> ApiResult<()> {
    if tokens::delete_token(&state.db, token_id).await? == 0 {
        return Err(AppError::not_found("Token not found."));
    }
    Ok(())
}

async fn store_token(
    state: &AppState,
    kind: TokenKind,
    user_email: Option<String>,
    app_name: Option<String>,
    expires_at: Option<DateTime<Utc>>,
) -> ApiResult<TokenWithValue> {
    let token = generate_token();
    let record = tokens::create_token(
        &state.db,
        NewToken {
            token_hash: digest_token(&token, &state.auth.token_pepper),
            kind,
            user_email,
            app_name,
            expires_at,
        },
    )
    .await?;

    Ok(TokenWithValue {
        token_id: record.id,
        token,
        expires_at: record.expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{seed_app, setup_state};

    #[tokio::test]
    async fn user_tokens_expire_after_ttl() {
        let state = setup_state().await;
        users::create_user(&state.db, "dev@example.com").await.unwrap();

        let issued = issue_user_token(&state, "dev@example.com").await.unwrap();
        let expires_at = issued.expires_at.expect("ttl");
        assert!(expires_at > Utc::now());

        let stored = tokens::get_token(&state.db, issued.token_id)
            .await
            .unwrap()
            .expect("row");
        assert_ne!(stored.token_hash, issued.token);
    }

    #[tokio::test]
    async fn app_tokens_require_app() {
        let state = setup_state().await;
        let err = issue_app_token(&state, "ghost").await.unwrap_err();
        assert!(err.is_not_found());

        seed_app(&state, "web", "blue").await;
        let issued = issue_app_token(&state, "web").await.unwrap();
        assert!(issued.expires_at.is_none());

        revoke_token(&state, issued.token_id).await.unwrap();
        assert!(revoke_token(&state, issued.token_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn api_key_for_unknown_user_is_not_found() {
        let state = setup_state().await;
        let err = issue_api_key(&state, "nobody@example.com").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
