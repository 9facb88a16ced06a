pub mod app_state;
pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod iaas;
pub mod lock;
pub mod metrics;
pub mod openapi;
pub mod permission;
pub mod persistence;
pub mod provision;
pub mod routes;
pub mod services;
pub mod streaming;
pub mod tasks;
pub mod telemetry;
pub mod tokens;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{env, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::app_state::AppState;
use crate::broker::BrokerClient;
use crate::iaas::{Iaas, IaasRegistry};
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::provision::{LocalProvisioner, Provisioner, ProvisionerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Serve,
    MigrationsDryRun,
}

/// Extension points for embedders. Extra backends are registered next to the
/// built-in `local` provisioner; a name clash replaces the built-in one.
#[derive(Clone, Default)]
pub struct ControlPlaneHooks {
    pub extra_provisioners: Vec<Arc<dyn Provisioner>>,
    pub extra_iaas: Vec<Arc<dyn Iaas>>,
}

pub fn parse_command() -> Result<CommandMode> {
    parse_args(env::args().skip(1))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CommandMode> {
    let Some(first) = args.next() else {
        return Ok(CommandMode::Serve);
    };

    match first.as_str() {
        "serve" => Ok(CommandMode::Serve),
        "--migrations-dry-run" | "migrations-dry-run" => Ok(CommandMode::MigrationsDryRun),
        "migrate" => match args.next().as_deref() {
            Some("--dry-run") | Some("dry-run") => Ok(CommandMode::MigrationsDryRun),
            _ => anyhow::bail!("unknown migrate option; use --dry-run"),
        },
        "--help" | "-h" => {
            println!(
                "Usage: paas-control-plane [serve]|[migrate --dry-run]\n\
                 Run without arguments to start the server."
            );
            std::process::exit(0);
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

/// Boot the control-plane using the provided command mode.
pub async fn run(mode: CommandMode) -> Result<()> {
    run_with(mode, ControlPlaneHooks::default()).await
}

pub async fn run_with(mode: CommandMode, hooks: ControlPlaneHooks) -> Result<()> {
    run_with_shutdown(mode, hooks, shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(
    mode: CommandMode,
    hooks: ControlPlaneHooks,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    if mode == CommandMode::MigrationsDryRun
        || app_config.features.migrations_dry_run_on_start
    {
        let snapshot = persistence::migrations::dry_run_migrations(&db_pool).await?;
        info!(
            current_version = snapshot.latest_applied,
            target_version = snapshot.latest_available,
            pending = snapshot.pending.len(),
            "migration dry-run completed"
        );
        if mode == CommandMode::MigrationsDryRun {
            return Ok(());
        }
    }

    let migration_outcome = persistence::migrations::run_migrations(&db_pool).await?;
    if migration_outcome.applied.is_empty() {
        info!(
            current_version = migration_outcome.snapshot.latest_applied,
            target_version = migration_outcome.snapshot.latest_available,
            "database schema is up to date"
        );
    } else {
        for mig in &migration_outcome.applied {
            info!(
                version = mig.version,
                description = mig.description,
                "applied database migration"
            );
        }
    }
    record_build_info(&migration_outcome.snapshot);

    let mut provisioners: Vec<Arc<dyn Provisioner>> =
        vec![Arc::new(LocalProvisioner::new(db_pool.clone()))];
    provisioners.extend(hooks.extra_provisioners);
    let provisioners =
        ProvisionerRegistry::new(app_config.deploy.default_provisioner.clone(), provisioners);
    provisioners.get(provisioners.default_name()).map_err(|err| {
        anyhow::anyhow!("deploy.default_provisioner: {}", err.message)
    })?;
    let iaas = IaasRegistry::new(app_config.iaas.default.clone(), hooks.extra_iaas);
    info!(
        provisioners = ?provisioners.names(),
        iaas = ?iaas.names(),
        "backends registered"
    );

    let state = AppState {
        db: db_pool.clone(),
        auth: app_config.auth.clone(),
        lock: app_config.lock.clone(),
        deploy: app_config.deploy.clone(),
        broker: BrokerClient::new(&app_config.broker)?,
        iaas_config: app_config.iaas.clone(),
        events: app_config.events.clone(),
        limits: app_config.limits.clone(),
        provisioners,
        iaas,
        metrics_handle,
        schema: migration_outcome.snapshot,
    };

    tokio::spawn(routes::retention_loop(
        state.db.clone(),
        state.events.clone(),
    ));

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let app: Router = routes::build_router(state.clone()).with_state(state.clone());
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let metrics_app = routes::build_metrics_router().with_state(state.clone());
    let metrics_service = metrics_app.into_make_service_with_connect_info::<SocketAddr>();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "control-plane listening");
    info!(%metrics_addr, "control-plane metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_service)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    let (first_name, first_res) = tokio::select! {
        res = &mut api_task => ("api", res),
        res = &mut metrics_task => ("metrics", res),
    };
    let _ = shutdown_tx.send(true);
    let (other_name, other_res) = if first_name == "api" {
        ("metrics", metrics_task.await)
    } else {
        ("api", api_task.await)
    };

    let first = listener_result(first_name, first_res);
    let other = listener_result(other_name, other_res);
    first.and(other)
}

fn listener_result(
    name: &str,
    res: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    res.map_err(|err| anyhow::anyhow!("control-plane {name} task failed: {err}"))?
        .map_err(|err| anyhow::anyhow!("control-plane {name} server failed: {err}"))
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> impl Iterator<Item = String> {
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn parses_command_modes() {
        assert_eq!(parse_args(args(&[])).unwrap(), CommandMode::Serve);
        assert_eq!(parse_args(args(&["serve"])).unwrap(), CommandMode::Serve);
        assert_eq!(
            parse_args(args(&["migrate", "--dry-run"])).unwrap(),
            CommandMode::MigrationsDryRun
        );
        assert!(parse_args(args(&["migrate"])).is_err());
        assert!(parse_args(args(&["--standalone"])).is_err());
    }
}
