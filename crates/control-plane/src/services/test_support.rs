use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::app_state::AppState;
use crate::config::{
    AuthConfig, BrokerConfig, DeployConfig, EventsConfig, IaasConfig, LimitsConfig, LockConfig,
};
use crate::iaas::{Iaas, IaasRegistry, Machine};
use crate::persistence::{
    self, AppRecord, MachineRecord, NewApp, NewNode, NewPool, NodeStatus, apps, nodes, pools,
    users,
};
use crate::provision::{BoxFuture, LocalProvisioner, ProvisionerRegistry};

pub(crate) const TEST_BOOTSTRAP_TOKEN: &str = "bootstrap-token";
pub(crate) const TEST_PEPPER: &str = "pepper";

/// IaaS that hands out sequential private addresses.
#[derive(Default)]
pub(crate) struct FakeIaas {
    created: AtomicUsize,
}

impl Iaas for FakeIaas {
    fn name(&self) -> &str {
        "fake"
    }

    fn describe(&self) -> String {
        "fake iaas: no parameters required".into()
    }

    fn create_machine(&self, _params: BTreeMap<String, String>) -> BoxFuture<'_, crate::Result<Machine>> {
        Box::pin(async move {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Machine {
                id: format!("m-{n}"),
                address: format!("10.1.0.{n}"),
                ca_cert: None,
                client_cert: None,
            })
        })
    }

    fn delete_machine<'a>(&'a self, _machine: &'a MachineRecord) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

pub(crate) async fn setup_state() -> AppState {
    let db = persistence::migrations::init_pool("sqlite::memory:")
        .await
        .expect("pool");
    let migration_outcome = persistence::migrations::run_migrations(&db)
        .await
        .expect("migrations");
    let metrics_handle = crate::metrics::init_metrics_recorder();
    crate::metrics::record_build_info(&migration_outcome.snapshot);

    let deploy = DeployConfig::default();
    let broker = crate::broker::BrokerClient::new(&BrokerConfig::default()).expect("broker client");
    let provisioners = ProvisionerRegistry::new(
        deploy.default_provisioner.clone(),
        vec![Arc::new(LocalProvisioner::new(db.clone()))],
    );
    let iaas = IaasRegistry::new(Some("fake".into()), vec![Arc::new(FakeIaas::default())]);

    AppState {
        db,
        auth: AuthConfig {
            bootstrap_tokens: vec![TEST_BOOTSTRAP_TOKEN.into()],
            bootstrap_user: "admin@example.com".into(),
            token_pepper: TEST_PEPPER.into(),
            token_ttl_secs: 3_600,
        },
        lock: LockConfig {
            wait_ms: 200,
            ..LockConfig::default()
        },
        deploy,
        broker,
        iaas_config: IaasConfig::default(),
        events: EventsConfig::default(),
        limits: LimitsConfig::default(),
        provisioners,
        iaas,
        metrics_handle,
        schema: migration_outcome.snapshot,
    }
}

/// Create the pool when missing. The first pool becomes the default.
pub(crate) async fn seed_pool(state: &AppState, name: &str) {
    if pools::get_pool(&state.db, name).await.expect("pool lookup").is_some() {
        return;
    }
    let is_default = pools::default_pool(&state.db)
        .await
        .expect("default lookup")
        .is_none();
    pools::create_pool(
        &state.db,
        NewPool {
            name: name.into(),
            is_default,
            provisioner: String::new(),
            teams: Vec::new(),
        },
        false,
    )
    .await
    .expect("pool");
}

pub(crate) async fn seed_team(state: &AppState, team: &str) {
    if !users::team_exists(&state.db, team).await.expect("team lookup") {
        users::create_team(&state.db, team).await.expect("team");
    }
}

/// App in pool `main` owned by `team`.
pub(crate) async fn seed_app(state: &AppState, name: &str, team: &str) -> AppRecord {
    seed_pool(state, "main").await;
    seed_team(state, team).await;
    apps::create_app(
        &state.db,
        NewApp {
            name: name.into(),
            platform: "python".into(),
            plan: "default".into(),
            pool: "main".into(),
            team_owner: team.into(),
            teams: vec![team.into()],
            description: String::new(),
            env: BTreeMap::new(),
        },
    )
    .await
    .expect("app")
}

pub(crate) async fn seed_node(state: &AppState, address: &str, pool: &str) {
    seed_pool(state, pool).await;
    nodes::insert_node(
        &state.db,
        NewNode {
            address: address.into(),
            provisioner: "local".into(),
            pool: pool.into(),
            status: NodeStatus::Ready,
            metadata: BTreeMap::new(),
        },
    )
    .await
    .expect("node");
}

/// User holding `schemes` in the given team.
pub(crate) async fn seed_team_member(state: &AppState, email: &str, team: &str, schemes: &[&str]) {
    seed_team(state, team).await;
    if users::get_user(&state.db, email).await.expect("user lookup").is_none() {
        users::create_user(&state.db, email).await.expect("user");
    }
    let role = format!("{team}-{}", schemes.join("+"));
    let schemes: Vec<String> = schemes.iter().map(|s| s.to_string()).collect();
    users::upsert_role(&state.db, &role, "team", &schemes)
        .await
        .expect("role");
    users::assign_role(&state.db, email, &role, team)
        .await
        .expect("assign");
}
