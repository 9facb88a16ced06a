use axum::{
    extract::{FromRequestParts, RawPathParams, State},
    http::{HeaderMap, Request, header::AUTHORIZATION},
    middleware::Next,
};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    permission::{self, ContextType, Permission, PermissionContext},
    persistence::{self, TokenKind},
    telemetry, tokens,
};

pub const MISSING_HEADER_MESSAGE: &str = "You must provide a valid Authorization header";
pub const INVALID_TOKEN_MESSAGE: &str = "Invalid token";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrincipalKind {
    User { email: String },
    App { app_name: String },
}

/// Authenticated caller, inserted into request extensions by [`require_auth`].
#[derive(Clone, Debug)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub token_id: Option<Uuid>,
    pub permissions: Vec<Permission>,
}

impl Principal {
    pub fn user(email: impl Into<String>, permissions: Vec<Permission>) -> Self {
        Self {
            kind: PrincipalKind::User {
                email: email.into(),
            },
            token_id: None,
            permissions,
        }
    }

    /// App tokens may do anything to their own app.
    pub fn app(app_name: impl Into<String>, token_id: Option<Uuid>) -> Self {
        let app_name = app_name.into();
        Self {
            permissions: vec![Permission::new(
                permission::schemes::APP,
                PermissionContext::app(app_name.clone()),
            )],
            kind: PrincipalKind::App { app_name },
            token_id,
        }
    }

    /// Name recorded as event owner and lock owner.
    pub fn name(&self) -> &str {
        match &self.kind {
            PrincipalKind::User { email } => email,
            PrincipalKind::App { app_name } => app_name,
        }
    }

    pub fn app_name(&self) -> Option<&str> {
        match &self.kind {
            PrincipalKind::App { app_name } => Some(app_name),
            PrincipalKind::User { .. } => None,
        }
    }

    pub fn allows(&self, scheme: &str, contexts: &[PermissionContext]) -> bool {
        permission::check(&self.permissions, scheme, contexts)
    }

    pub fn require(&self, scheme: &str, contexts: &[PermissionContext]) -> ApiResult<()> {
        if self.allows(scheme, contexts) {
            Ok(())
        } else {
            debug!(principal = %self.name(), scheme, "permission denied");
            Err(AppError::permission_denied())
        }
    }

    pub fn contexts_for(&self, scheme: &str) -> Vec<PermissionContext> {
        permission::contexts_for(&self.permissions, scheme)
    }

    /// Context values of one type, `None` meaning every value.
    pub fn values_for(&self, scheme: &str, ctx_type: ContextType) -> Option<Vec<String>> {
        permission::values_for(&self.permissions, scheme, ctx_type)
    }
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<axum::response::Response> {
    let request_id = telemetry::request_id_from_request(&req);
    let token = match extract_bearer(req.headers()) {
        Ok(token) => token,
        Err(err) => {
            debug!(request_id = request_id.as_deref(), path = %req.uri().path(), "missing credentials");
            return Err(err);
        }
    };

    let Some(principal) = resolve_principal(&state, &token)
        .await
        .map_err(AppError::from)?
    else {
        warn!(
            request_id = request_id.as_deref(),
            path = %req.uri().path(),
            "rejected bearer token"
        );
        return Err(AppError::unauthorized(INVALID_TOKEN_MESSAGE));
    };

    let (mut parts, body) = req.into_parts();
    let app_param = RawPathParams::from_request_parts(&mut parts, &state)
        .await
        .ok()
        .and_then(|params| {
            params
                .iter()
                .find(|(key, _)| *key == "app")
                .map(|(_, value)| value.to_string())
        });
    if let Some(app) = app_param {
        check_app_access(&state, &principal, &app).await?;
    }

    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Reject app tokens for other apps and user requests on missing apps.
async fn check_app_access(state: &AppState, principal: &Principal, app: &str) -> ApiResult<()> {
    if let Some(token_app) = principal.app_name()
        && token_app != app
    {
        return Err(AppError::forbidden(format!(
            "app token mismatch, token for \"{token_app}\", request for \"{app}\""
        )));
    }

    if persistence::apps::get_app(&state.db, app)
        .await
        .map_err(AppError::from)?
        .is_none()
    {
        return Err(AppError::not_found("App not found."));
    }
    Ok(())
}

/// Resolve a bearer token: bootstrap tokens, issued tokens, then API keys.
pub async fn resolve_principal(state: &AppState, token: &str) -> crate::Result<Option<Principal>> {
    let auth = &state.auth;
    if auth
        .bootstrap_tokens
        .iter()
        .any(|candidate| tokens::tokens_equal(candidate, token))
    {
        return Ok(Some(Principal::user(
            auth.bootstrap_user.clone(),
            vec![Permission::root()],
        )));
    }

    let digest = tokens::digest_token(token, &auth.token_pepper);
    if let Some(record) = persistence::tokens::find_by_hash(&state.db, &digest).await? {
        if record.is_expired(Utc::now()) {
            return Ok(None);
        }
        return match (record.kind, record.user_email, record.app_name) {
            (TokenKind::User, Some(email), _) => {
                let permissions = load_user_permissions(&state.db, &email).await?;
                let mut principal = Principal::user(email, permissions);
                principal.token_id = Some(record.id);
                Ok(Some(principal))
            }
            (TokenKind::App, _, Some(app_name)) => {
                Ok(Some(Principal::app(app_name, Some(record.id))))
            }
            _ => {
                warn!(token_id = %record.id, "token row without subject");
                Ok(None)
            }
        };
    }

    if let Some(prefix) = tokens::api_key_prefix(token) {
        for user in persistence::users::users_with_key_prefix(&state.db, prefix).await? {
            let Some(hash) = user.api_key_hash.as_deref() else {
                continue;
            };
            if tokens::verify_api_key(token, hash, &auth.token_pepper) {
                let permissions = load_user_permissions(&state.db, &user.email).await?;
                return Ok(Some(Principal::user(user.email, permissions)));
            }
        }
    }

    Ok(None)
}

pub async fn load_user_permissions(
    db: &persistence::Db,
    email: &str,
) -> crate::Result<Vec<Permission>> {
    let grants = persistence::users::role_grants_for_user(db, email).await?;
    let mut permissions = Vec::new();
    for grant in grants {
        let Some(ctx_type) = ContextType::parse(&grant.context_type) else {
            warn!(role = %grant.role_name, context = %grant.context_type, "unknown role context type");
            continue;
        };
        let value = if ctx_type == ContextType::Global {
            String::new()
        } else {
            grant.context_value.clone()
        };
        for scheme in grant.schemes.0 {
            permissions.push(Permission::new(
                scheme,
                PermissionContext::new(ctx_type, value.clone()),
            ));
        }
    }
    Ok(permissions)
}

/// Extract the token from `Authorization: bearer <token>`, scheme case-insensitive.
pub fn extract_bearer(headers: &HeaderMap) -> ApiResult<String> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::unauthorized(MISSING_HEADER_MESSAGE))?;

    let value = value
        .to_str()
        .map_err(|_| AppError::unauthorized(MISSING_HEADER_MESSAGE))?;

    let Some((scheme, token)) = value.trim().split_once(' ') else {
        return Err(AppError::unauthorized(MISSING_HEADER_MESSAGE));
    };
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AppError::unauthorized(MISSING_HEADER_MESSAGE));
    }

    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::schemes;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(extract_bearer(&headers).unwrap(), "abc");
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_bearer(&headers).unwrap(), "abc");
    }

    #[test]
    fn malformed_headers_are_unauthorized() {
        let mut headers = HeaderMap::new();
        let err = extract_bearer(&headers).unwrap_err();
        assert_eq!(err.message, MISSING_HEADER_MESSAGE);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer(&headers).is_err());
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer "));
        assert!(extract_bearer(&headers).is_err());
    }

    #[test]
    fn app_principal_only_reaches_its_app() {
        let principal = Principal::app("web", None);
        assert!(principal.allows(schemes::APP_DEPLOY, &[PermissionContext::app("web")]));
        assert!(!principal.allows(schemes::APP_DEPLOY, &[PermissionContext::app("api")]));
        assert!(!principal.allows(schemes::NODE_CREATE, &[PermissionContext::app("web")]));
        assert_eq!(principal.name(), "web");
    }

    #[tokio::test]
    async fn resolves_issued_tokens_and_bootstrap_tokens() {
        let state = crate::services::test_support::setup_state().await;
        persistence::users::create_user(&state.db, "dev@example.com")
            .await
            .unwrap();
        persistence::users::upsert_role(&state.db, "team-member", "team", &["app".to_string()])
            .await
            .unwrap();
        persistence::users::assign_role(&state.db, "dev@example.com", "team-member", "blue")
            .await
            .unwrap();

        let issued = crate::services::tokens::issue_user_token(&state, "dev@example.com")
            .await
            .unwrap();
        let principal = resolve_principal(&state, &issued.token)
            .await
            .unwrap()
            .expect("principal");
        assert_eq!(principal.name(), "dev@example.com");
        assert!(principal.allows(schemes::APP_DEPLOY, &[PermissionContext::team("blue")]));

        let admin = resolve_principal(&state, crate::services::test_support::TEST_BOOTSTRAP_TOKEN)
            .await
            .unwrap()
            .expect("bootstrap");
        assert!(admin.allows(schemes::NODE_DELETE, &[]));

        assert!(resolve_principal(&state, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolves_api_keys() {
        let state = crate::services::test_support::setup_state().await;
        persistence::users::create_user(&state.db, "ci@example.com")
            .await
            .unwrap();
        let key = crate::services::tokens::issue_api_key(&state, "ci@example.com")
            .await
            .unwrap();

        let principal = resolve_principal(&state, &key)
            .await
            .unwrap()
            .expect("principal");
        assert_eq!(principal.name(), "ci@example.com");
        assert!(principal.permissions.is_empty());
    }
}
