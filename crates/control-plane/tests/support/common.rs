#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request as HttpRequest, StatusCode, header},
};
use control_plane::{
    app_state::AppState,
    broker::BrokerClient,
    config::{
        AuthConfig, BrokerConfig, DeployConfig, EventsConfig, IaasConfig, LimitsConfig, LockConfig,
    },
    iaas::{Iaas, IaasRegistry, Machine},
    metrics::{init_metrics_recorder, record_build_info},
    persistence::{
        self as db, AppRecord, MachineRecord, NewApp, NewNode, NewPool, NodeStatus, apps,
        migrations, nodes, pools, users,
    },
    provision::{BoxFuture, LocalProvisioner, ProvisionerRegistry},
    routes::{build_metrics_router, build_router},
    services::tokens,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

pub const TEST_BOOTSTRAP_TOKEN: &str = "test-bootstrap-token";
pub const TEST_ADMIN: &str = "admin@example.com";
pub const TEST_PEPPER: &str = "test-pepper";

/// IaaS handing out sequential private addresses.
#[derive(Default)]
pub struct FakeIaas {
    created: AtomicUsize,
    deleted: AtomicUsize,
}

impl FakeIaas {
    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }
}

impl Iaas for FakeIaas {
    fn name(&self) -> &str {
        "fake"
    }

    fn create_machine(
        &self,
        _params: BTreeMap<String, String>,
    ) -> BoxFuture<'_, control_plane::Result<Machine>> {
        Box::pin(async move {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Machine {
                id: format!("m-{n}"),
                address: format!("10.9.0.{n}"),
                ca_cert: None,
                client_cert: None,
            })
        })
    }

    fn delete_machine<'a>(
        &'a self,
        _machine: &'a MachineRecord,
    ) -> BoxFuture<'a, control_plane::Result<()>> {
        Box::pin(async move {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub metrics: Router,
    pub state: AppState,
    pub iaas: Arc<FakeIaas>,
}

pub async fn make_state(iaas: Arc<FakeIaas>) -> AppState {
    let db = migrations::init_pool("sqlite::memory:")
        .await
        .expect("db init");
    let outcome = migrations::run_migrations(&db).await.expect("migrations");
    let metrics_handle = init_metrics_recorder();
    record_build_info(&outcome.snapshot);

    let deploy = DeployConfig::default();
    let provisioners = ProvisionerRegistry::new(
        deploy.default_provisioner.clone(),
        vec![Arc::new(LocalProvisioner::new(db.clone()))],
    );
    let iaas = IaasRegistry::new(Some("fake".into()), vec![iaas as Arc<dyn Iaas>]);

    AppState {
        db,
        auth: AuthConfig {
            bootstrap_tokens: vec![TEST_BOOTSTRAP_TOKEN.into()],
            bootstrap_user: TEST_ADMIN.into(),
            token_pepper: TEST_PEPPER.into(),
            token_ttl_secs: 3_600,
        },
        lock: LockConfig {
            wait_ms: 100,
            ..LockConfig::default()
        },
        deploy,
        broker: BrokerClient::new(&BrokerConfig::default()).expect("broker client"),
        iaas_config: IaasConfig::default(),
        events: EventsConfig::default(),
        limits: LimitsConfig::default(),
        provisioners,
        iaas,
        metrics_handle,
        schema: outcome.snapshot,
    }
}

pub async fn setup_app() -> TestApp {
    let iaas = Arc::new(FakeIaas::default());
    let state = make_state(iaas.clone()).await;
    TestApp {
        router: build_router(state.clone()).with_state(state.clone()),
        metrics: build_metrics_router().with_state(state.clone()),
        state,
        iaas,
    }
}

pub async fn seed_team(db: &db::Db, team: &str) {
    if !users::team_exists(db, team).await.expect("team lookup") {
        users::create_team(db, team).await.expect("team");
    }
}

/// Create the pool when missing; the first one becomes the default.
pub async fn seed_pool(db: &db::Db, name: &str) {
    if pools::get_pool(db, name).await.expect("pool lookup").is_some() {
        return;
    }
    let is_default = pools::default_pool(db).await.expect("default").is_none();
    pools::create_pool(
        db,
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

/// App in pool `main` owned by `team`.
pub async fn seed_app(db: &db::Db, name: &str, team: &str) -> AppRecord {
    seed_pool(db, "main").await;
    seed_team(db, team).await;
    apps::create_app(
        db,
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

pub async fn seed_node(db: &db::Db, address: &str, pool: &str) {
    seed_pool(db, pool).await;
    nodes::insert_node(
        db,
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

/// Session token for a user holding `schemes` in `team`.
pub async fn user_token(state: &AppState, email: &str, team: &str, schemes: &[&str]) -> String {
    seed_team(&state.db, team).await;
    if users::get_user(&state.db, email)
        .await
        .expect("user lookup")
        .is_none()
    {
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
    tokens::issue_user_token(state, email)
        .await
        .expect("token")
        .token
}

pub fn form_request(method: &str, uri: &str, token: &str, body: &str) -> HttpRequest<Body> {
    HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("bearer {token}"))
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn request(method: &str, uri: &str, token: &str) -> HttpRequest<Body> {
    HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

pub async fn send(router: &Router, req: HttpRequest<Body>) -> (StatusCode, HeaderMap, String) {
    let response = router.clone().oneshot(req).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).into_owned())
}
