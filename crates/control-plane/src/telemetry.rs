use std::time::Duration;

use axum::{extract::Extension, http::Request};
use common::api::DeployKind;
use metrics::{counter, histogram};
use sqlx::Error as SqlxError;
use tower_http::request_id::RequestId;

pub(crate) fn request_id_from_extension(
    request_id: Option<Extension<RequestId>>,
) -> Option<String> {
    request_id.and_then(|id| request_id_value(&id))
}

pub(crate) fn request_id_from_request<B>(req: &Request<B>) -> Option<String> {
    req.extensions()
        .get::<RequestId>()
        .and_then(request_id_value)
}

fn request_id_value(id: &RequestId) -> Option<String> {
    id.header_value()
        .to_str()
        .ok()
        .map(|value| value.to_string())
}

pub(crate) fn record_internal_error_metrics(err: &anyhow::Error) {
    counter!("control_plane_internal_errors_total").increment(1);
    if let Some(db_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    {
        let kind = match db_err {
            SqlxError::RowNotFound => "row_not_found",
            SqlxError::Database(_) => "database",
            SqlxError::Io(_) => "io",
            SqlxError::Tls(_) => "tls",
            _ => "other",
        };
        counter!("control_plane_db_errors_total", "kind" => kind).increment(1);
    }
}

pub(crate) fn record_deploy_result(kind: DeployKind, succeeded: bool) {
    let result = if succeeded { "success" } else { "failure" };
    counter!(
        "control_plane_deploys_total",
        "kind" => kind.as_str(),
        "result" => result
    )
    .increment(1);
}

pub(crate) fn record_lock_conflict() {
    counter!("control_plane_app_lock_conflicts_total").increment(1);
}

/// `kind` is `app` or `event`.
pub(crate) fn record_lock_expired(kind: &'static str) {
    counter!("control_plane_locks_expired_total", "kind" => kind).increment(1);
}

pub(crate) fn record_broker_call(service: &str, elapsed: Duration, failed: bool) {
    histogram!(
        "control_plane_broker_request_duration_seconds",
        "service" => service.to_string()
    )
    .record(elapsed.as_secs_f64());
    if failed {
        counter!(
            "control_plane_broker_request_errors_total",
            "service" => service.to_string()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn request_id_from_request_returns_value() {
        let mut req = Request::new(());
        req.extensions_mut()
            .insert(RequestId::new(HeaderValue::from_static("4f1c-deploy")));

        assert_eq!(request_id_from_request(&req), Some("4f1c-deploy".to_string()));
    }

    #[test]
    fn request_id_from_request_returns_none_when_missing() {
        let req = Request::new(());
        assert!(request_id_from_request(&req).is_none());
    }

    #[test]
    fn domain_counters_accept_labels_without_recorder() {
        record_deploy_result(DeployKind::ArchiveUrl, true);
        record_lock_conflict();
        record_broker_call("mysql", Duration::from_millis(12), true);
    }

    #[test]
    fn request_id_from_extension_handles_present_and_missing() {
        let ext = Extension(RequestId::new(HeaderValue::from_static("req-456")));
        assert_eq!(
            request_id_from_extension(Some(ext)),
            Some("req-456".to_string())
        );
        assert!(request_id_from_extension(None).is_none());
    }
}
