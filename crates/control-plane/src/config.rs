use std::time::Duration;

use axum::http::HeaderName;
use serde::{Deserialize, Deserializer};

pub const ENV_PREFIX: &str = "PAAS_CP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsListenerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub lock: LockConfig,
    pub deploy: DeployConfig,
    pub broker: BrokerConfig,
    pub iaas: IaasConfig,
    pub events: EventsConfig,
    pub limits: LimitsConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsListenerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Static tokens that resolve to a global administrator.
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub bootstrap_tokens: Vec<String>,
    pub bootstrap_user: String,
    pub token_pepper: String,
    pub token_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    pub wait_ms: u64,
    pub poll_min_ms: u64,
    pub poll_max_ms: u64,
    /// Interval at which running operations refresh their lock.
    pub heartbeat_secs: u64,
    /// A lock not refreshed for this long is considered abandoned.
    pub expire_secs: u64,
    /// Matched route templates that never take the application lock.
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub exempt_routes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    pub keepalive_secs: u64,
    pub image_prefix: String,
    pub default_provisioner: String,
    pub upload_body_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub timeout_secs: u64,
    pub request_id_header: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IaasConfig {
    #[serde(default)]
    pub default: Option<String>,
    pub node_protocol: String,
    pub node_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_list_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub migrations_dry_run_on_start: bool,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    let values = match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => value.split(',').map(|s| s.to_string()).collect(),
        StringOrVec::Vec(values) => values,
    };
    Ok(values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}

pub const DEFAULT_EXEMPT_ROUTES: [&str; 6] = [
    "/apps/{app}/deploy",
    "/apps/{app}/deploy/rollback",
    "/apps/{app}/repository/clone",
    "/apps/{app}/diff",
    "/apps/{app}/log",
    "/apps/{app}/shell",
];

impl AuthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bootstrap_user.trim().is_empty() {
            anyhow::bail!("auth.bootstrap_user cannot be empty");
        }
        if self.token_pepper.is_empty() {
            anyhow::bail!("auth.token_pepper cannot be empty");
        }
        if self.token_ttl_secs == 0 {
            anyhow::bail!("auth.token_ttl_secs must be > 0");
        }
        Ok(())
    }
}

impl LockConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_min_ms == 0 {
            anyhow::bail!("lock.poll_min_ms must be > 0");
        }
        if self.poll_min_ms > self.poll_max_ms {
            anyhow::bail!("lock.poll_min_ms must be <= lock.poll_max_ms");
        }
        if self.heartbeat_secs == 0 {
            anyhow::bail!("lock.heartbeat_secs must be > 0");
        }
        if self.expire_secs <= self.heartbeat_secs {
            anyhow::bail!("lock.expire_secs must be greater than lock.heartbeat_secs");
        }
        Ok(())
    }

    pub fn wait_window(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }

    pub fn is_exempt(&self, matched_path: &str) -> bool {
        self.exempt_routes.iter().any(|route| route == matched_path)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: 5_000,
            poll_min_ms: 10,
            poll_max_ms: 200,
            heartbeat_secs: 30,
            expire_secs: 300,
            exempt_routes: DEFAULT_EXEMPT_ROUTES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl DeployConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keepalive_secs == 0 {
            anyhow::bail!("deploy.keepalive_secs must be > 0");
        }
        if self.default_provisioner.trim().is_empty() {
            anyhow::bail!("deploy.default_provisioner cannot be empty");
        }
        if self.upload_body_bytes == 0 {
            anyhow::bail!("deploy.upload_body_bytes must be > 0");
        }
        Ok(())
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            image_prefix: "paas/app-".into(),
            default_provisioner: "local".into(),
            upload_body_bytes: 256 * 1024 * 1024,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_secs == 0 {
            anyhow::bail!("broker.timeout_secs must be > 0");
        }
        self.request_id_header_name()?;
        Ok(())
    }

    pub fn request_id_header_name(&self) -> anyhow::Result<HeaderName> {
        self.request_id_header
            .trim()
            .parse::<HeaderName>()
            .map_err(|err| anyhow::anyhow!("invalid broker.request_id_header: {err}"))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            request_id_header: "X-Request-ID".into(),
        }
    }
}

impl IaasConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.node_protocol.as_str(), "http" | "https") {
            anyhow::bail!("iaas.node_protocol must be http or https");
        }
        if self.node_port == 0 {
            anyhow::bail!("iaas.node_port must be > 0");
        }
        if let Some(name) = &self.default
            && name.trim().is_empty()
        {
            anyhow::bail!("iaas.default cannot be empty when set");
        }
        Ok(())
    }
}

impl Default for IaasConfig {
    fn default() -> Self {
        Self {
            default: None,
            node_protocol: "http".into(),
            node_port: 2375,
        }
    }
}

impl EventsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(60))
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            retention_secs: 30 * 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_list_limit: 500,
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric token strings are not coerced.
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "0.0.0.0")?
        .set_default("metrics.port", 9100)?
        .set_default("database.url", "sqlite://data/control-plane.db")?
        .set_default("auth.bootstrap_tokens", Vec::<String>::new())?
        .set_default("auth.bootstrap_user", "admin@localhost")?
        .set_default("auth.token_pepper", "dev-token-pepper")?
        .set_default("auth.token_ttl_secs", 7 * 24 * 60 * 60u64)?
        .set_default("lock.wait_ms", 5_000u64)?
        .set_default("lock.poll_min_ms", 10u64)?
        .set_default("lock.poll_max_ms", 200u64)?
        .set_default("lock.heartbeat_secs", 30u64)?
        .set_default("lock.expire_secs", 300u64)?
        .set_default("lock.exempt_routes", DEFAULT_EXEMPT_ROUTES.to_vec())?
        .set_default("deploy.keepalive_secs", 30u64)?
        .set_default("deploy.image_prefix", "paas/app-")?
        .set_default("deploy.default_provisioner", "local")?
        .set_default("deploy.upload_body_bytes", 256 * 1024 * 1024u64)?
        .set_default("broker.timeout_secs", 60u64)?
        .set_default("broker.request_id_header", "X-Request-ID")?
        .set_default("iaas.default", Option::<String>::None)?
        .set_default("iaas.node_protocol", "http")?
        .set_default("iaas.node_port", 2375)?
        .set_default("events.retention_secs", 30 * 24 * 60 * 60u64)?
        .set_default("events.sweep_interval_secs", 60 * 60u64)?
        .set_default("limits.max_list_limit", 500u32)?
        .set_default("features.migrations_dry_run_on_start", false)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.auth.bootstrap_user = app.auth.bootstrap_user.trim().to_string();
    app.deploy.default_provisioner = app.deploy.default_provisioner.trim().to_string();
    app.iaas.node_protocol = app.iaas.node_protocol.trim().to_ascii_lowercase();
    app.auth.validate()?;
    app.lock.validate()?;
    app.deploy.validate()?;
    app.broker.validate()?;
    app.iaas.validate()?;
    if app.limits.max_list_limit == 0 {
        anyhow::bail!("limits.max_list_limit must be > 0");
    }
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::{env, panic};

    fn with_control_plane_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let prefix = format!("{}__", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();

        // Tests touching the environment run under #[serial].
        unsafe {
            for (key, _) in &existing {
                env::remove_var(key);
            }
            for (key, value) in vars {
                env::set_var(key, value);
            }
        }

        let result = panic::catch_unwind(test);

        unsafe {
            for (key, _) in vars {
                env::remove_var(key);
            }
            for (key, value) in existing {
                env::set_var(key, value);
            }
        }

        result.unwrap();
    }

    #[test]
    #[serial]
    fn defaults_load_without_file() {
        with_control_plane_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.server.port, 8080);
            assert_eq!(cfg.lock.wait_ms, 5_000);
            assert_eq!(cfg.lock.heartbeat_interval(), Duration::from_secs(30));
            assert_eq!(cfg.lock.expire_after(), Duration::from_secs(300));
            assert_eq!(cfg.deploy.keepalive_secs, 30);
            assert_eq!(cfg.deploy.default_provisioner, "local");
            assert_eq!(cfg.broker.timeout_secs, 60);
            assert_eq!(cfg.broker.request_id_header, "X-Request-ID");
            assert!(cfg.iaas.default.is_none());
            assert!(cfg.auth.bootstrap_tokens.is_empty());
            assert!(cfg.lock.is_exempt("/apps/{app}/deploy"));
            assert!(!cfg.lock.is_exempt("/apps/{app}"));
        });
    }

    #[test]
    #[serial]
    fn numeric_tokens_remain_strings() {
        with_control_plane_env(
            &[
                ("PAAS_CP__AUTH__BOOTSTRAP_TOKENS", "1111, 2222"),
                ("PAAS_CP__AUTH__TOKEN_PEPPER", "9999"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(
                    cfg.auth.bootstrap_tokens,
                    vec!["1111".to_string(), "2222".to_string()]
                );
                assert_eq!(cfg.auth.token_pepper, "9999");
            },
        );
    }

    #[test]
    #[serial]
    fn numeric_and_bool_env_values_still_parse() {
        with_control_plane_env(
            &[
                ("PAAS_CP__SERVER__PORT", "9090"),
                ("PAAS_CP__LOCK__WAIT_MS", "250"),
                ("PAAS_CP__FEATURES__MIGRATIONS_DRY_RUN_ON_START", "true"),
                ("PAAS_CP__IAAS__DEFAULT", "ec2"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(cfg.server.port, 9090);
                assert_eq!(cfg.lock.wait_window(), Duration::from_millis(250));
                assert!(cfg.features.migrations_dry_run_on_start);
                assert_eq!(cfg.iaas.default.as_deref(), Some("ec2"));
            },
        );
    }

    #[test]
    #[serial]
    fn invalid_lock_bounds_fail_startup() {
        with_control_plane_env(
            &[
                ("PAAS_CP__LOCK__POLL_MIN_MS", "500"),
                ("PAAS_CP__LOCK__POLL_MAX_MS", "100"),
            ],
            || {
                let err = load().expect_err("bounds rejected");
                assert!(err.to_string().contains("lock.poll_min_ms"));
            },
        );
    }

    #[test]
    #[serial]
    fn lock_expiry_must_outlast_heartbeat() {
        with_control_plane_env(
            &[
                ("PAAS_CP__LOCK__HEARTBEAT_SECS", "60"),
                ("PAAS_CP__LOCK__EXPIRE_SECS", "60"),
            ],
            || {
                let err = load().expect_err("expiry rejected");
                assert!(err.to_string().contains("lock.expire_secs"));
            },
        );
    }

    #[test]
    fn iaas_protocol_must_be_http() {
        let cfg = IaasConfig {
            node_protocol: "tcp".into(),
            ..IaasConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sweep_interval_has_floor() {
        let cfg = EventsConfig {
            retention_secs: 10,
            sweep_interval_secs: 5,
        };
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(60));
    }
}
