use axum::{
    body::Body,
    extract::{FromRequestParts, MatchedPath, RawPathParams, State},
    http::{HeaderName, HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use tracing::debug;

use crate::{
    app_state::AppState,
    auth::Principal,
    lock::{self, AppLockGuard, LockHandoff, PreventUnlock},
};

pub const SUPPORTED_CLIENT_HEADER: HeaderName = HeaderName::from_static("supported-paas-client");
pub const SUPPORTED_ADMIN_HEADER: HeaderName = HeaderName::from_static("supported-paas-admin");
pub const SUPPORTED_CLIENT_VERSION: &str = "1.0.1";
pub const SUPPORTED_ADMIN_VERSION: &str = "1.0.0";

pub(crate) async fn version_headers(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        SUPPORTED_CLIENT_HEADER,
        HeaderValue::from_static(SUPPORTED_CLIENT_VERSION),
    );
    headers.insert(
        SUPPORTED_ADMIN_HEADER,
        HeaderValue::from_static(SUPPORTED_ADMIN_VERSION),
    );
    response
}

fn mutates(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Holds the app lock for mutating requests on routes with an `{app}` segment.
///
/// Handlers that keep working after returning take the lock out of the
/// request's [`LockHandoff`] and release it when the work ends. Otherwise the
/// lock is released once the response body is done, unless the handler set
/// the request's [`PreventUnlock`] flag.
pub(crate) async fn app_lock(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let prevent = PreventUnlock::default();
    req.extensions_mut().insert(prevent.clone());

    let Some(route) = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
    else {
        return next.run(req).await;
    };
    if !mutates(req.method()) || state.lock.is_exempt(&route) {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let app = RawPathParams::from_request_parts(&mut parts, &state)
        .await
        .ok()
        .and_then(|params| {
            params
                .iter()
                .find(|(key, _)| *key == "app")
                .map(|(_, value)| value.to_string())
        });
    let Some(app) = app else {
        return next.run(Request::from_parts(parts, body)).await;
    };

    let owner = parts
        .extensions
        .get::<Principal>()
        .map(|principal| principal.name().to_string())
        .unwrap_or_default();
    let reason = format!("{} {}", parts.method, parts.uri.path());
    let mut guard = match lock::acquire(&state.db, &state.lock, &app, &reason, &owner).await {
        Ok(guard) => guard,
        Err(err) => return err.into_response(),
    };
    guard.keep_when(prevent);
    let handoff = LockHandoff::new(guard);
    parts.extensions.insert(handoff.clone());

    let response = next.run(Request::from_parts(parts, body)).await;
    match handoff.take() {
        Some(guard) => release_after_body(response, guard),
        None => {
            debug!(app = %app, "app lock handed to background work");
            response
        }
    }
}

fn release_after_body(response: Response, guard: AppLockGuard) -> Response {
    let (parts, body) = response.into_parts();
    let mut data = body.into_data_stream();
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(chunk) = data.next().await {
            yield chunk;
        }
    };
    Response::from_parts(parts, Body::from_stream(stream))
}
