use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    broker::BrokerClient,
    config::{AuthConfig, DeployConfig, EventsConfig, IaasConfig, LimitsConfig, LockConfig},
    iaas::IaasRegistry,
    persistence,
    provision::ProvisionerRegistry,
};

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub auth: AuthConfig,
    pub lock: LockConfig,
    pub deploy: DeployConfig,
    pub broker: BrokerClient,
    pub iaas_config: IaasConfig,
    pub events: EventsConfig,
    pub limits: LimitsConfig,
    /// Filled at startup, read-only afterwards.
    pub provisioners: ProvisionerRegistry,
    pub iaas: IaasRegistry,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
}

impl AppState {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.deploy.keepalive_secs.max(1))
    }

    /// Clamp a caller-provided list limit to `limits.max_list_limit`.
    pub fn list_limit(&self, requested: Option<u32>) -> u32 {
        let max = self.limits.max_list_limit.max(1);
        requested.filter(|limit| *limit > 0).unwrap_or(max).min(max)
    }
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
