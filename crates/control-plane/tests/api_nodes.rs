#[path = "support/common.rs"]
mod common;

use ::common::api::{
    HealerConfigView, NodeInfoResponse, NodeListResponse, NodeView, PoolView, TemplateView,
};
use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use common::{
    TEST_BOOTSTRAP_TOKEN, form_request, request, seed_node, seed_pool, seed_team, send, setup_app,
    user_token,
};
use control_plane::persistence::{machines, nodes};
use std::collections::BTreeMap;

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("bearer {TEST_BOOTSTRAP_TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn register_list_and_remove_node() {
    let app = setup_app().await;
    seed_pool(&app.state.db, "main").await;

    let (status, _, body) = send(
        &app.router,
        form_request(
            "POST",
            "/docker/node",
            TEST_BOOTSTRAP_TOKEN,
            "register=true&Metadata.address=http://10.0.0.5:2375&Metadata.pool=main&Metadata.zone=a",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let node: NodeView = serde_json::from_str(&body).unwrap();
    assert_eq!(node.address, "http://10.0.0.5:2375");
    assert_eq!(node.pool, "main");
    assert_eq!(node.status, "ready");
    assert_eq!(node.metadata.get("zone").map(String::as_str), Some("a"));

    let (status, _, body) = send(&app.router, request("GET", "/node", TEST_BOOTSTRAP_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    let listing: NodeListResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(listing.nodes.len(), 1);
    assert!(listing.machines.is_empty());

    let (status, _, body) = send(
        &app.router,
        request(
            "GET",
            "/docker/node/http%3A%2F%2F10.0.0.5%3A2375",
            TEST_BOOTSTRAP_TOKEN,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let info: NodeInfoResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(info.node.address, "http://10.0.0.5:2375");
    assert!(info.machine.is_none());

    let (status, _, body) = send(
        &app.router,
        request(
            "DELETE",
            "/node/http%3A%2F%2F10.0.0.5%3A2375?no-rebalance=true",
            TEST_BOOTSTRAP_TOKEN,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(
        nodes::get_node(&app.state.db, "http://10.0.0.5:2375")
            .await
            .unwrap()
            .is_none()
    );

    let (status, _, _) = send(&app.router, request("GET", "/node", TEST_BOOTSTRAP_TOKEN)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn register_rejects_bad_address_and_duplicates() {
    let app = setup_app().await;
    seed_node(&app.state.db, "http://10.0.0.5:2375", "main").await;

    let (status, _, body) = send(
        &app.router,
        form_request(
            "POST",
            "/node",
            TEST_BOOTSTRAP_TOKEN,
            "register=true&address=ftp://10.0.0.6&Metadata.pool=main",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid address url: scheme must be http[s]\n");

    let (status, _, _) = send(
        &app.router,
        form_request(
            "POST",
            "/node",
            TEST_BOOTSTRAP_TOKEN,
            "register=true&address=http://10.0.0.5:2375&Metadata.pool=main",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, body) = send(
        &app.router,
        form_request(
            "POST",
            "/node",
            TEST_BOOTSTRAP_TOKEN,
            "register=true&address=http://10.0.0.7:2375",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "pool is required\n");
}

#[tokio::test]
async fn iaas_node_creates_and_destroys_machine() {
    let app = setup_app().await;
    seed_pool(&app.state.db, "main").await;

    let (status, _, body) = send(
        &app.router,
        form_request(
            "POST",
            "/node",
            TEST_BOOTSTRAP_TOKEN,
            "Metadata.pool=main&Metadata.iaas=fake&Metadata.flavor=small",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let node: NodeView = serde_json::from_str(&body).unwrap();
    assert_eq!(node.address, "http://10.9.0.1:2375");
    assert_eq!(node.metadata.get("iaas-id").map(String::as_str), Some("m-1"));

    let machine = machines::get_machine(&app.state.db, "m-1")
        .await
        .unwrap()
        .expect("machine row");
    assert_eq!(machine.address, "10.9.0.1");
    assert_eq!(
        machine.creation_params.get("flavor").map(String::as_str),
        Some("small")
    );

    let (status, _, body) = send(
        &app.router,
        request(
            "DELETE",
            "/node/http%3A%2F%2F10.9.0.1%3A2375?remove-iaas=true",
            TEST_BOOTSTRAP_TOKEN,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(app.iaas.deleted(), 1);
    assert!(
        machines::get_machine(&app.state.db, "m-1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn update_node_moves_pool_and_disables() {
    let app = setup_app().await;
    seed_node(&app.state.db, "http://10.0.0.5:2375", "main").await;
    seed_pool(&app.state.db, "batch").await;

    let (status, _, body) = send(
        &app.router,
        form_request(
            "PUT",
            "/node",
            TEST_BOOTSTRAP_TOKEN,
            "address=http://10.0.0.5:2375&enable=true&disable=true",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "A node can't be enabled and disabled simultaneously.\n");

    let (status, _, body) = send(
        &app.router,
        form_request(
            "PUT",
            "/node",
            TEST_BOOTSTRAP_TOKEN,
            "address=http://10.0.0.5:2375&disable=true&Metadata.pool=batch",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let node = nodes::get_node(&app.state.db, "http://10.0.0.5:2375")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.pool, "batch");

    let (status, _, _) = send(
        &app.router,
        form_request(
            "PUT",
            "/node",
            TEST_BOOTSTRAP_TOKEN,
            "address=http://10.0.0.99:2375&enable=true",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pools_and_teams() {
    let app = setup_app().await;
    seed_team(&app.state.db, "blue").await;

    let (status, _, body) = send(
        &app.router,
        form_request(
            "POST",
            "/pools",
            TEST_BOOTSTRAP_TOKEN,
            "name=main&default=true",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let pool: PoolView = serde_json::from_str(&body).unwrap();
    assert!(pool.default);

    let (status, _, _) = send(
        &app.router,
        form_request(
            "POST",
            "/pools",
            TEST_BOOTSTRAP_TOKEN,
            "name=other&default=true",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, body) = send(
        &app.router,
        form_request("POST", "/pools/main/team", TEST_BOOTSTRAP_TOKEN, "team=blue"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, _, body) = send(&app.router, request("GET", "/pools", TEST_BOOTSTRAP_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    let pools: Vec<PoolView> = serde_json::from_str(&body).unwrap();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].teams, vec!["blue".to_string()]);

    let (status, _, _) = send(
        &app.router,
        request("DELETE", "/pools/main", TEST_BOOTSTRAP_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(&app.router, request("GET", "/pools", TEST_BOOTSTRAP_TOKEN)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn templates_fill_machine_params() {
    let app = setup_app().await;
    seed_pool(&app.state.db, "main").await;

    let (status, _, body) = send(
        &app.router,
        json_request(
            "POST",
            "/iaas/templates",
            serde_json::json!({
                "name": "small",
                "iaas": "fake",
                "params": { "flavor": "small", "region": "eu" }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let template: TemplateView = serde_json::from_str(&body).unwrap();
    assert_eq!(template.iaas, "fake");

    let (status, _, body) = send(
        &app.router,
        form_request(
            "POST",
            "/node",
            TEST_BOOTSTRAP_TOKEN,
            "Metadata.pool=main&Metadata.template=small&Metadata.region=us",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let machine = machines::get_machine(&app.state.db, "m-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        machine.creation_params.get("flavor").map(String::as_str),
        Some("small")
    );
    assert_eq!(
        machine.creation_params.get("region").map(String::as_str),
        Some("us")
    );

    let (status, _, body) = send(
        &app.router,
        request("GET", "/iaas/templates", TEST_BOOTSTRAP_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let templates: Vec<TemplateView> = serde_json::from_str(&body).unwrap();
    assert_eq!(templates.len(), 1);

    let (status, _, _) = send(
        &app.router,
        request("DELETE", "/iaas/templates/small", TEST_BOOTSTRAP_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(
        &app.router,
        request("DELETE", "/iaas/templates/small", TEST_BOOTSTRAP_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healer_config_inherits_from_base() {
    let app = setup_app().await;

    let (status, _, body) = send(
        &app.router,
        form_request(
            "POST",
            "/healing/node",
            TEST_BOOTSTRAP_TOKEN,
            "Enabled=true&MaxUnresponsiveTime=300",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, _, body) = send(
        &app.router,
        form_request(
            "POST",
            "/healing/node",
            TEST_BOOTSTRAP_TOKEN,
            "pool=batch&MaxUnresponsiveTime=60",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, _, body) = send(
        &app.router,
        request("GET", "/healing/node", TEST_BOOTSTRAP_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let config: BTreeMap<String, HealerConfigView> = serde_json::from_str(&body).unwrap();
    let batch = &config["batch"];
    assert_eq!(batch.enabled, Some(true));
    assert!(batch.enabled_inherited);
    assert_eq!(batch.max_unresponsive_secs, Some(60));
    assert!(!batch.max_unresponsive_inherited);

    let (status, _, _) = send(
        &app.router,
        form_request(
            "POST",
            "/healing/node",
            TEST_BOOTSTRAP_TOKEN,
            "MaxTimeSinceSuccess=soon",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        &app.router,
        request("DELETE", "/healing/node?pool=batch", TEST_BOOTSTRAP_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, body) = send(
        &app.router,
        request("GET", "/healing/node", TEST_BOOTSTRAP_TOKEN),
    )
    .await;
    let config: BTreeMap<String, HealerConfigView> = serde_json::from_str(&body).unwrap();
    assert!(!config.contains_key("batch"));
}

#[tokio::test]
async fn node_routes_need_pool_permissions() {
    let app = setup_app().await;
    seed_node(&app.state.db, "http://10.0.0.5:2375", "main").await;
    let token = user_token(&app.state, "dev@example.com", "blue", &["app.read"]).await;

    let (status, _, _) = send(
        &app.router,
        form_request(
            "POST",
            "/node",
            &token,
            "register=true&address=http://10.0.0.6:2375&Metadata.pool=main",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, body) = send(&app.router, request("GET", "/node", &token)).await;
    assert!(
        status == StatusCode::NO_CONTENT || body.contains("\"nodes\":[]"),
        "{status} {body}"
    );
}
