use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    extract::MatchedPath,
    http::{Request, Response as HttpResponse},
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower::{Layer, Service};

static METRICS_HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .add_global_label("app_version", crate::version::VERSION)
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub fn record_build_info(snapshot: &crate::persistence::MigrationSnapshot) {
    let schema_version = snapshot
        .latest_applied
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string());
    let target_version = snapshot
        .latest_available
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string());

    gauge!(
        "control_plane_info",
        "version" => crate::version::VERSION,
        "git_sha" => crate::version::GIT_SHA,
        "schema_version" => schema_version,
        "schema_target_version" => target_version
    )
    .set(1.0);

    gauge!("control_plane_schema_version").set(snapshot.latest_applied.unwrap_or_default() as f64);
    gauge!("control_plane_schema_target_version")
        .set(snapshot.latest_available.unwrap_or_default() as f64);
    gauge!("control_plane_migrations_pending").set(snapshot.pending.len() as f64);
}

/// Middleware layer that records HTTP request metrics, labelled by matched route.
#[derive(Clone, Default)]
pub struct HttpMetricsLayer;

impl HttpMetricsLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for HttpMetricsLayer {
    type Service = HttpMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpMetricsService { inner }
    }
}

#[derive(Clone)]
pub struct HttpMetricsService<S> {
    inner: S,
}

impl<S, B, ResBody> Service<Request<B>> for HttpMetricsService<S>
where
    S: Service<Request<B>, Response = HttpResponse<ResBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let method = req.method().to_string();
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_owned())
            .unwrap_or_else(|| "unmatched".to_string());
        let start = Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let result = fut.await;
            let latency = start.elapsed().as_secs_f64();

            let status = match &result {
                Ok(response) => response.status().as_u16().to_string(),
                Err(_) => "error".to_string(),
            };
            counter!(
                "control_plane_http_requests_total",
                "method" => method.clone(),
                "path" => path.clone(),
                "status" => status.clone()
            )
            .increment(1);
            histogram!(
                "control_plane_http_request_duration_seconds",
                "method" => method,
                "path" => path,
                "status" => status
            )
            .record(latency);

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, routing::get};
    use tower::ServiceExt;

    #[tokio::test]
    async fn requests_are_counted_by_matched_route() {
        let handle = init_metrics_recorder();
        let app: Router = Router::new()
            .route("/apps/{app}", get(|| async { "ok" }))
            .layer(HttpMetricsLayer::new());

        let response = app
            .oneshot(Request::get("/apps/web").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());

        let rendered = handle.render();
        assert!(rendered.contains("control_plane_http_requests_total"));
        assert!(rendered.contains("path=\"/apps/{app}\""));
    }
}
