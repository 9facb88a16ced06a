use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    response::Response,
    routing::get,
};
use common::api::EventView;
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use super::{json_or_no_content, parse_flag};
use crate::{
    app_state::AppState,
    auth::Principal,
    error::{ApiResult, AppError},
    events,
    persistence::EventFilter,
};

const EVENT_NOT_FOUND: &str = "Event not found.";

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/events", get(list_events))
        .route("/events/{id}", get(get_event))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct EventListQuery {
    #[serde(rename = "target.type")]
    pub target_type: Option<String>,
    #[serde(rename = "target.value")]
    pub target_value: Option<String>,
    /// Operation kind, e.g. `app.deploy`.
    pub kindname: Option<String>,
    pub ownername: Option<String>,
    /// `true` for running events only, `false` for finished ones.
    pub running: Option<String>,
    #[serde(default)]
    pub skip: u32,
    pub limit: Option<u32>,
}

impl EventListQuery {
    fn filter(self) -> EventFilter {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        EventFilter {
            target_type: non_empty(self.target_type),
            target_value: non_empty(self.target_value),
            kind: non_empty(self.kindname),
            owner: non_empty(self.ownername),
            running: non_empty(self.running).map(|v| parse_flag(&v)),
        }
    }
}

#[utoipa::path(
    get,
    path = "/events",
    params(EventListQuery),
    responses(
        (status = 200, description = "Events visible to the caller, newest first", body = [EventView]),
        (status = 204, description = "No events")
    ),
    security(("bearer" = [])),
    tag = "events"
)]
pub(crate) async fn list_events(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<Response> {
    let skip = query.skip as usize;
    let limit = state.list_limit(query.limit) as usize;
    let items = events::list_visible(&state.db, &principal, &query.filter(), skip, limit).await?;
    Ok(json_or_no_content(items))
}

#[utoipa::path(
    get,
    path = "/events/{id}",
    params(("id" = String, Path, description = "Event id")),
    responses(
        (status = 200, description = "Event", body = EventView),
        (status = 404, description = "Event not found")
    ),
    security(("bearer" = [])),
    tag = "events"
)]
pub(crate) async fn get_event(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<EventView>> {
    let id = Uuid::parse_str(&id).map_err(|_| AppError::not_found(EVENT_NOT_FOUND))?;
    Ok(Json(events::get_visible(&state.db, &principal, id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_filters_are_ignored() {
        let filter = EventListQuery {
            target_type: Some("app".into()),
            target_value: Some(" ".into()),
            kindname: Some("app.deploy".into()),
            ownername: None,
            running: Some("true".into()),
            skip: 0,
            limit: None,
        }
        .filter();
        assert_eq!(filter.target_type.as_deref(), Some("app"));
        assert!(filter.target_value.is_none());
        assert_eq!(filter.kind.as_deref(), Some("app.deploy"));
        assert_eq!(filter.running, Some(true));
    }
}
