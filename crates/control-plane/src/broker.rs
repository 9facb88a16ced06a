//! HTTP client for service broker endpoints.
//!
//! Brokers expose `/resources` style endpoints. Every call carries the
//! service's basic-auth credentials and, when the inbound request had one,
//! the request id.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use common::api::ServicePlan;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::AppError;
use crate::persistence::ServiceRecord;
use crate::telemetry;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Service instance not found.")]
    InstanceNotFound,
    #[error("Service instance already exists.")]
    AlreadyExists,
    #[error("Service instance is not ready yet.")]
    NotReady,
    #[error("service \"{0}\" has no production endpoint")]
    NoEndpoint(String),
    #[error("invalid response from service (status {status}): {body}")]
    Upstream { status: u16, body: String },
    #[error("timeout calling service \"{0}\"")]
    Timeout(String),
    #[error("failed to reach service: {0}")]
    Transport(#[source] reqwest::Error),
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::InstanceNotFound => AppError::not_found(err.to_string()),
            BrokerError::AlreadyExists => AppError::conflict(err.to_string()),
            BrokerError::NotReady => AppError::bad_request(err.to_string()),
            BrokerError::NoEndpoint(_) => AppError::bad_request(err.to_string()),
            BrokerError::Upstream { body, .. } => AppError::upstream(body),
            BrokerError::Timeout(_) | BrokerError::Transport(_) => {
                AppError::upstream(err.to_string())
            }
        }
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[derive(Clone)]
pub struct BrokerClient {
    client: Client,
    request_id_header: HeaderName,
}

impl BrokerClient {
    pub fn new(cfg: &BrokerConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            request_id_header: cfg.request_id_header_name()?,
        })
    }

    /// Header carrying request ids, shared with the API router.
    pub fn request_id_header(&self) -> &HeaderName {
        &self.request_id_header
    }

    pub fn endpoint(&self, service: &ServiceRecord, request_id: Option<String>) -> BrokerResult<Endpoint> {
        let base = service
            .production_endpoint()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| BrokerError::NoEndpoint(service.name.clone()))?;
        let base = if base.starts_with("http://") || base.starts_with("https://") {
            base.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", base.trim_end_matches('/'))
        };
        Ok(Endpoint {
            client: self.client.clone(),
            request_id_header: self.request_id_header.clone(),
            service: service.name.clone(),
            base,
            username: service.username.clone(),
            password: service.password.clone(),
            request_id,
        })
    }
}

/// Parameters sent to `POST /resources`.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub name: String,
    pub plan: String,
    pub team: String,
    pub user: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InfoItem {
    label: String,
    value: String,
}

/// One service's broker, ready to be called.
#[derive(Clone)]
pub struct Endpoint {
    client: Client,
    request_id_header: HeaderName,
    service: String,
    base: String,
    username: String,
    password: String,
    request_id: Option<String>,
}

impl Endpoint {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .header(header::ACCEPT, "application/json");
        if let Some(id) = &self.request_id {
            req = req.header(self.request_id_header.clone(), id.as_str());
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> BrokerResult<Response> {
        let started = Instant::now();
        let result = req.send().await;
        let failed = match &result {
            Ok(response) => response.status().is_server_error(),
            Err(_) => true,
        };
        telemetry::record_broker_call(&self.service, started.elapsed(), failed);
        result.map_err(|err| {
            if err.is_timeout() {
                BrokerError::Timeout(self.service.clone())
            } else {
                BrokerError::Transport(err)
            }
        })
    }

    pub async fn create(&self, params: &CreateParams) -> BrokerResult<()> {
        let mut form = vec![
            ("name", params.name.clone()),
            ("user", params.user.clone()),
            ("team", params.team.clone()),
            ("description", params.description.clone()),
        ];
        if !params.plan.is_empty() {
            form.push(("plan", params.plan.clone()));
        }
        for tag in &params.tags {
            form.push(("tag", tag.clone()));
        }

        let response = self
            .send(self.request(Method::POST, "/resources").form(&form))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(BrokerError::AlreadyExists),
            _ => Err(upstream(response).await),
        }
    }

    pub async fn destroy(&self, instance: &str) -> BrokerResult<()> {
        let response = self
            .send(self.request(Method::DELETE, &format!("/resources/{instance}")))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BrokerError::InstanceNotFound),
            _ => Err(upstream(response).await),
        }
    }

    /// Bind an app. Returns the variables the broker wants injected.
    ///
    /// Brokers that predate `/bind-app` answer 404 there; those get the
    /// legacy `/bind` call instead.
    pub async fn bind_app(
        &self,
        instance: &str,
        app: &str,
        app_hosts: &[String],
    ) -> BrokerResult<BTreeMap<String, String>> {
        let mut form = vec![("app-name", app.to_string())];
        for host in app_hosts {
            form.push(("app-host", host.clone()));
        }

        let response = self
            .send(
                self.request(Method::POST, &format!("/resources/{instance}/bind-app"))
                    .form(&form),
            )
            .await?;
        let response = if response.status() == StatusCode::NOT_FOUND {
            debug!(service = %self.service, instance, "bind-app missing, using legacy bind");
            self.send(
                self.request(Method::POST, &format!("/resources/{instance}/bind"))
                    .form(&form),
            )
            .await?
        } else {
            response
        };

        match response.status() {
            status if status.is_success() => {
                let body = response.bytes().await.map_err(BrokerError::Transport)?;
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(BTreeMap::new());
                }
                serde_json::from_slice(&body).map_err(|err| BrokerError::Upstream {
                    status: 200,
                    body: format!("invalid bind response: {err}"),
                })
            }
            StatusCode::NOT_FOUND => Err(BrokerError::InstanceNotFound),
            StatusCode::PRECONDITION_FAILED => Err(BrokerError::NotReady),
            _ => Err(upstream(response).await),
        }
    }

    pub async fn unbind_app(&self, instance: &str, app: &str) -> BrokerResult<()> {
        let response = self
            .send(
                self.request(Method::DELETE, &format!("/resources/{instance}/bind-app"))
                    .form(&[("app-name", app)]),
            )
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // Legacy brokers only know unit binds, which were removed already.
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(upstream(response).await),
        }
    }

    pub async fn bind_unit(&self, instance: &str, app: &str, unit_host: &str) -> BrokerResult<()> {
        let response = self
            .send(
                self.request(Method::POST, &format!("/resources/{instance}/bind"))
                    .form(&[("app-name", app), ("unit-host", unit_host)]),
            )
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BrokerError::InstanceNotFound),
            StatusCode::PRECONDITION_FAILED => Err(BrokerError::NotReady),
            _ => Err(upstream(response).await),
        }
    }

    pub async fn unbind_unit(&self, instance: &str, app: &str, unit_host: &str) -> BrokerResult<()> {
        let response = self
            .send(
                self.request(Method::DELETE, &format!("/resources/{instance}/bind"))
                    .form(&[("app-name", app), ("unit-host", unit_host)]),
            )
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BrokerError::InstanceNotFound),
            _ => Err(upstream(response).await),
        }
    }

    /// Status text as reported to users.
    pub async fn status(&self, instance: &str) -> BrokerResult<String> {
        let response = self
            .send(self.request(Method::GET, &format!("/resources/{instance}/status")))
            .await?;
        let status = response.status();
        let text = match status {
            StatusCode::OK => response.text().await.map_err(BrokerError::Transport)?,
            StatusCode::ACCEPTED => "pending".to_string(),
            StatusCode::NO_CONTENT => "up".to_string(),
            StatusCode::NOT_FOUND => "not implemented for this service".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR => "down".to_string(),
            _ => return Err(upstream(response).await),
        };
        Ok(text.trim().to_string())
    }

    /// Extra information shown with the instance. Brokers without it return 404.
    pub async fn info(&self, instance: &str) -> BrokerResult<BTreeMap<String, String>> {
        let response = self
            .send(self.request(Method::GET, &format!("/resources/{instance}")))
            .await?;
        match response.status() {
            StatusCode::OK => {
                let items: Vec<InfoItem> = response.json().await.map_err(BrokerError::Transport)?;
                Ok(items.into_iter().map(|item| (item.label, item.value)).collect())
            }
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(BTreeMap::new()),
            _ => Err(upstream(response).await),
        }
    }

    pub async fn plans(&self) -> BrokerResult<Vec<ServicePlan>> {
        let response = self
            .send(self.request(Method::GET, "/resources/plans"))
            .await?;
        match response.status() {
            StatusCode::OK => response.json().await.map_err(BrokerError::Transport),
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(Vec::new()),
            _ => Err(upstream(response).await),
        }
    }

    /// Forward a raw request to `path` on the broker.
    ///
    /// The caller's `Authorization`, `Host` and hop-by-hop headers are dropped
    /// and replaced by the service credentials.
    pub async fn proxy(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: reqwest::Body,
    ) -> BrokerResult<Response> {
        let mut req = self.request(method, path_and_query);
        for (name, value) in headers {
            if is_stripped_header(name) {
                continue;
            }
            req = req.header(name.clone(), value.clone());
        }
        self.send(req.body(body)).await
    }
}

pub(crate) fn is_stripped_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "authorization"
            | "host"
            | "content-length"
            | "connection"
            | "transfer-encoding"
            | "keep-alive"
            | "upgrade"
            | "te"
            | "trailer"
            | "proxy-authorization"
    )
}

async fn upstream(response: Response) -> BrokerError {
    let status = response.status().as_u16();
    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => {
            warn!(?err, status, "failed to read broker error body");
            String::new()
        }
    };
    let body = if body.trim().is_empty() {
        format!("broker returned status {status}")
    } else {
        body.trim().to_string()
    };
    BrokerError::Upstream { status, body }
}
