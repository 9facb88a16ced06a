use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    auth::Principal,
    error::{ApiResult, AppError},
    permission::{PermissionContext, schemes},
    services::{
        apps,
        tokens::{self, TokenWithValue},
    },
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/users/api-key", post(issue_api_key))
        .route("/users/tokens", post(issue_session_token))
        .route("/apps/{app}/tokens", post(issue_app_token))
        .route("/tokens/{id}", delete(revoke_token))
}

/// Plaintext token; only returned once.
#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct TokenResponse {
    pub token_id: Uuid,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<TokenWithValue> for TokenResponse {
    fn from(issued: TokenWithValue) -> Self {
        Self {
            token_id: issued.token_id,
            token: issued.token,
            expires_at: issued.expires_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct ApiKeyResponse {
    pub api_key: String,
}

fn user_email(principal: &Principal) -> ApiResult<&str> {
    if principal.app_name().is_some() {
        return Err(AppError::forbidden("app tokens cannot issue user credentials"));
    }
    Ok(principal.name())
}

/// Replaces the caller's API key.
#[utoipa::path(
    post,
    path = "/users/api-key",
    responses(
        (status = 201, description = "New API key", body = ApiKeyResponse),
        (status = 403, description = "Called with an app token"),
        (status = 404, description = "User not found")
    ),
    security(("bearer" = [])),
    tag = "tokens"
)]
pub(crate) async fn issue_api_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<(StatusCode, Json<ApiKeyResponse>)> {
    let email = user_email(&principal)?;
    let api_key = tokens::issue_api_key(&state, email).await?;
    Ok((StatusCode::CREATED, Json(ApiKeyResponse { api_key })))
}

#[utoipa::path(
    post,
    path = "/users/tokens",
    responses(
        (status = 201, description = "Session token for the caller", body = TokenResponse),
        (status = 403, description = "Called with an app token"),
        (status = 404, description = "User not found")
    ),
    security(("bearer" = [])),
    tag = "tokens"
)]
pub(crate) async fn issue_session_token(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<(StatusCode, Json<TokenResponse>)> {
    let email = user_email(&principal)?;
    let issued = tokens::issue_user_token(&state, email).await?;
    Ok((StatusCode::CREATED, Json(issued.into())))
}

#[utoipa::path(
    post,
    path = "/apps/{app}/tokens",
    params(("app" = String, Path, description = "App name")),
    responses(
        (status = 201, description = "Token bound to the app", body = TokenResponse),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "App not found")
    ),
    security(("bearer" = [])),
    tag = "tokens"
)]
pub(crate) async fn issue_app_token(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app): Path<String>,
) -> ApiResult<(StatusCode, Json<TokenResponse>)> {
    let record = apps::get_app(&state, &app).await?;
    principal.require(schemes::APP_TOKEN_CREATE, &apps::app_contexts(&record))?;
    let issued = tokens::issue_app_token(&state, &record.name).await?;
    Ok((StatusCode::CREATED, Json(issued.into())))
}

#[utoipa::path(
    delete,
    path = "/tokens/{id}",
    params(("id" = String, Path, description = "Token id")),
    responses(
        (status = 200, description = "Token revoked"),
        (status = 403, description = "Permission denied"),
        (status = 404, description = "Token not found")
    ),
    security(("bearer" = [])),
    tag = "tokens"
)]
pub(crate) async fn revoke_token(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    principal.require(schemes::TOKEN_DELETE, &[PermissionContext::global()])?;
    let id = Uuid::parse_str(&id).map_err(|_| AppError::not_found("Token not found."))?;
    tokens::revoke_token(&state, id).await?;
    Ok(StatusCode::OK)
}
