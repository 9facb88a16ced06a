use std::collections::BTreeMap;
use std::sync::LazyLock;

use common::api::{ServicePlan, ServiceView};
use regex::Regex;
use serde_json::json;
use tracing::info;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError, is_unique_violation};
use crate::events::{self, Allowed, EventOpts, targets};
use crate::permission::{ContextType, PermissionContext, schemes};
use crate::persistence::{NewService, ServiceRecord, services, users};

static SERVICE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{1,62}$").expect("service name pattern"));

pub const SERVICE_NOT_FOUND: &str = "Service not found.";

#[derive(Debug, Clone, Default)]
pub struct CreateServiceRequest {
    pub name: String,
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub team: Option<String>,
    pub restricted: bool,
    pub doc: String,
}

/// Contexts a service-scoped permission is checked against.
pub fn service_contexts(service: &ServiceRecord) -> Vec<PermissionContext> {
    let mut contexts = vec![PermissionContext::service(service.name.clone())];
    contexts.extend(
        service
            .owner_teams
            .0
            .iter()
            .chain(service.teams.0.iter())
            .cloned()
            .map(PermissionContext::team),
    );
    contexts
}

pub fn to_view(service: ServiceRecord) -> ServiceView {
    ServiceView {
        name: service.name,
        endpoint: service.endpoint.0,
        owner_teams: service.owner_teams.0,
        teams: service.teams.0,
        restricted: service.is_restricted,
        doc: service.doc,
    }
}

pub async fn get_service(state: &AppState, name: &str) -> ApiResult<ServiceRecord> {
    services::get_service(&state.db, name)
        .await?
        .ok_or_else(|| AppError::not_found(SERVICE_NOT_FOUND))
}

/// Unrestricted services are listed to every caller.
pub async fn list_visible(state: &AppState, principal: &Principal) -> ApiResult<Vec<ServiceView>> {
    Ok(services::list_services(&state.db)
        .await?
        .into_iter()
        .filter(|service| {
            !service.is_restricted || principal.allows(schemes::SERVICE_READ, &service_contexts(service))
        })
        .map(to_view)
        .collect())
}

pub async fn create_service(
    state: &AppState,
    principal: &Principal,
    req: CreateServiceRequest,
) -> ApiResult<ServiceRecord> {
    if !SERVICE_NAME.is_match(&req.name) {
        return Err(AppError::bad_request(
            "Invalid service name, it should start with a lower case letter and contain only letters, numbers, dashes or underscores.",
        ));
    }
    if req.endpoint.trim().is_empty() {
        return Err(AppError::bad_request("Service production endpoint is required"));
    }
    let team = match req.team.filter(|t| !t.is_empty()) {
        Some(team) => team,
        None => match principal.values_for(schemes::SERVICE_CREATE, ContextType::Team) {
            Some(teams) if teams.len() == 1 => teams[0].clone(),
            _ => {
                return Err(AppError::bad_request(
                    "You must provide a team responsible for this service in the manifest file.",
                ));
            }
        },
    };
    if !users::team_exists(&state.db, &team).await? {
        return Err(AppError::not_found("Team not found."));
    }
    principal.require(schemes::SERVICE_CREATE, &[PermissionContext::team(team.clone())])?;

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::SERVICE,
            req.name.clone(),
            schemes::SERVICE_CREATE,
            principal,
            Allowed::new(
                schemes::SERVICE_READ,
                vec![
                    PermissionContext::service(req.name.clone()),
                    PermissionContext::team(team.clone()),
                ],
            ),
        )
        .with_data(json!({ "name": req.name, "team": team, "restricted": req.restricted })),
    )
    .await?;

    let inserted = services::insert_service(
        &state.db,
        NewService {
            name: req.name.clone(),
            endpoint: BTreeMap::from([("production".to_string(), req.endpoint.trim().to_string())]),
            username: if req.username.is_empty() {
                req.name.clone()
            } else {
                req.username
            },
            password: req.password,
            owner_teams: vec![team],
            teams: Vec::new(),
            is_restricted: req.restricted,
            doc: req.doc,
        },
    )
    .await;
    match inserted {
        Ok(service) => {
            event.done(None).await;
            info!(service = %service.name, "service created");
            Ok(service)
        }
        Err(err) if is_unique_violation(&err) => {
            let msg = "Service already exists.";
            event.done(Some(msg)).await;
            Err(AppError::conflict(msg))
        }
        Err(err) => {
            event.done(Some(&err.to_string())).await;
            Err(err.into())
        }
    }
}

pub async fn delete_service(state: &AppState, principal: &Principal, name: &str) -> ApiResult<()> {
    let service = get_service(state, name).await?;
    principal.require(schemes::SERVICE_DELETE, &service_contexts(&service))?;
    if services::count_instances(&state.db, name).await? > 0 {
        return Err(AppError::forbidden(
            "This service cannot be removed because it has instances.\nPlease remove these instances before removing the service.",
        ));
    }

    let event = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::SERVICE,
            name,
            schemes::SERVICE_DELETE,
            principal,
            Allowed::new(schemes::SERVICE_READ, service_contexts(&service)),
        ),
    )
    .await?;
    let result = services::delete_service(&state.db, name).await;
    event
        .done(result.as_ref().err().map(|err| err.to_string()).as_deref())
        .await;
    result?;
    info!(service = %name, "service removed");
    Ok(())
}

pub async fn plans(
    state: &AppState,
    principal: &Principal,
    name: &str,
    request_id: Option<String>,
) -> ApiResult<Vec<ServicePlan>> {
    let service = get_service(state, name).await?;
    if service.is_restricted {
        principal.require(schemes::SERVICE_READ_PLANS, &service_contexts(&service))?;
    }
    let endpoint = state.broker.endpoint(&service, request_id)?;
    Ok(endpoint.plans().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::services::test_support::{seed_team, setup_state};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn admin() -> Principal {
        Principal::user("admin@example.com", vec![Permission::root()])
    }

    fn request(name: &str, endpoint: &str) -> CreateServiceRequest {
        CreateServiceRequest {
            name: name.into(),
            endpoint: endpoint.into(),
            password: "secret".into(),
            team: Some("blue".into()),
            ..CreateServiceRequest::default()
        }
    }

    #[tokio::test]
    async fn create_validates_and_rejects_duplicates() {
        let state = setup_state().await;
        seed_team(&state, "blue").await;

        let err = create_service(&state, &admin(), request("Bad Name", "http://b"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "bad_request");

        let service = create_service(&state, &admin(), request("mysql", "mysql.local:8080"))
            .await
            .unwrap();
        assert_eq!(service.username, "mysql");
        assert_eq!(service.owner_teams.0, vec!["blue".to_string()]);

        let dup = create_service(&state, &admin(), request("mysql", "http://b"))
            .await
            .unwrap_err();
        assert_eq!(dup.code, "conflict");
    }

    #[tokio::test]
    async fn restricted_services_are_hidden_from_other_teams() {
        let state = setup_state().await;
        seed_team(&state, "blue").await;
        let mut req = request("secret-db", "http://b");
        req.restricted = true;
        create_service(&state, &admin(), req).await.unwrap();
        create_service(&state, &admin(), request("open-db", "http://b"))
            .await
            .unwrap();

        let red = Principal::user(
            "dev@example.com",
            vec![Permission::new(schemes::SERVICE, PermissionContext::team("red"))],
        );
        let names: Vec<String> = list_visible(&state, &red)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["open-db".to_string()]);
    }

    #[tokio::test]
    async fn plans_come_from_broker() {
        let state = setup_state().await;
        seed_team(&state, "blue").await;
        let broker = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/plans"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "small", "description": "1 GB"}
            ])))
            .expect(1)
            .mount(&broker)
            .await;
        create_service(&state, &admin(), request("mysql", &broker.uri()))
            .await
            .unwrap();

        let plans = plans(&state, &admin(), "mysql", None).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name, "small");
    }
}
