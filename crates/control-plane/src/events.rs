//! Event log for mutating operations.
//!
//! Opening an event that takes the target lock fails with `conflict` while
//! another lock-taking event on the same target is running. The check is the
//! partial unique index on running events, so it holds across processes.
//! A running event refreshes its lock every `lock.heartbeat_secs`; one left
//! without refresh for `lock.expire_secs` is closed as expired and no longer
//! blocks its target.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use common::api::{EventTarget, EventView};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    auth::Principal,
    config::LockConfig,
    error::{ApiResult, AppError, is_unique_violation},
    lock,
    permission::PermissionContext,
    persistence::{self, Db, EventFilter, EventRecord, NewEvent},
    telemetry,
};

pub mod targets {
    pub const APP: &str = "app";
    pub const NODE: &str = "node";
    pub const POOL: &str = "pool";
    pub const IAAS: &str = "iaas";
    pub const SERVICE: &str = "service";
    pub const SERVICE_INSTANCE: &str = "service-instance";
    pub const HEALER: &str = "healer";
}

/// Who may list an event.
#[derive(Debug, Clone)]
pub struct Allowed {
    pub scheme: String,
    pub contexts: Vec<PermissionContext>,
}

impl Allowed {
    pub fn new(scheme: &str, contexts: Vec<PermissionContext>) -> Self {
        Self {
            scheme: scheme.to_string(),
            contexts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventOpts {
    pub target_type: &'static str,
    pub target_value: String,
    pub kind: String,
    pub owner: String,
    pub custom_data: Value,
    pub allowed: Allowed,
    pub disable_lock: bool,
}

impl EventOpts {
    pub fn new(
        target_type: &'static str,
        target_value: impl Into<String>,
        kind: &str,
        principal: &Principal,
        allowed: Allowed,
    ) -> Self {
        Self {
            target_type,
            target_value: target_value.into(),
            kind: kind.to_string(),
            owner: principal.name().to_string(),
            custom_data: Value::Null,
            allowed,
            disable_lock: false,
        }
    }

    pub fn with_data(mut self, custom_data: Value) -> Self {
        self.custom_data = custom_data;
        self
    }

    pub fn without_lock(mut self) -> Self {
        self.disable_lock = true;
        self
    }
}

/// Handle on a running event.
///
/// The lock heartbeat stops when the event is closed or every clone of the
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct Event {
    db: Db,
    pub id: Uuid,
    pub target_type: &'static str,
    pub target_value: String,
    pub kind: String,
    stop: Arc<watch::Sender<bool>>,
}

impl Event {
    /// Refresh the event lock now. The heartbeat calls this on its own.
    pub async fn refresh_lock(&self) -> ApiResult<bool> {
        let touched = persistence::events::touch_event(&self.db, self.id, Utc::now()).await?;
        Ok(touched > 0)
    }

    /// Close the event. Bookkeeping failures are logged, never returned.
    pub async fn done(&self, error: Option<&str>) {
        self.done_with(error, Value::Null).await
    }

    pub async fn done_with(&self, error: Option<&str>, end_data: Value) {
        self.stop.send_replace(true);
        let result = persistence::events::finish_event(
            &self.db,
            self.id,
            error.unwrap_or_default(),
            &end_data,
            Utc::now(),
        )
        .await;
        match result {
            Ok(0) => warn!(event_id = %self.id, "event already closed"),
            Ok(_) => {}
            Err(err) => warn!(?err, event_id = %self.id, "failed to close event"),
        }
    }
}

async fn refresh_loop(db: Db, id: Uuid, every: Duration, mut stopped: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match persistence::events::touch_event(&db, id, Utc::now()).await {
                    Ok(0) => return,
                    Ok(_) => {}
                    Err(err) => warn!(?err, event_id = %id, "failed to refresh event lock"),
                }
            }
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow() {
                    return;
                }
            }
        }
    }
}

fn new_event(opts: &EventOpts, id: Uuid) -> NewEvent {
    NewEvent {
        id,
        target_type: opts.target_type.to_string(),
        target_value: opts.target_value.clone(),
        kind: opts.kind.clone(),
        owner: opts.owner.clone(),
        start_time: Utc::now(),
        lock_target: !opts.disable_lock,
        custom_data: opts.custom_data.clone(),
        allowed_scheme: opts.allowed.scheme.clone(),
        allowed_contexts: opts.allowed.contexts.clone(),
    }
}

/// Open an event. A lock-taking event conflicts with a running one on the
/// same target unless that one has expired, in which case it is closed with
/// an expiry error and the open is retried once.
pub async fn open(db: &Db, cfg: &LockConfig, opts: EventOpts) -> ApiResult<Event> {
    let id = Uuid::new_v4();
    let mut retried = false;
    loop {
        let inserted = persistence::events::insert_event(db, new_event(&opts, id)).await;
        match inserted {
            Ok(_) => break,
            Err(err) if is_unique_violation(&err) => {
                let holder = persistence::events::running_lock_holder(
                    db,
                    opts.target_type,
                    &opts.target_value,
                )
                .await?;
                let Some(holder) = holder else {
                    if retried {
                        return Err(AppError::conflict(format!(
                            "event locked: {}({})",
                            opts.target_type, opts.target_value
                        )));
                    }
                    retried = true;
                    continue;
                };
                if retried || !expire_if_stale(db, cfg, &holder).await? {
                    return Err(AppError::conflict(locked_message(&holder)));
                }
                retried = true;
            }
            Err(err) => return Err(err.into()),
        }
    }

    let (stop, stopped) = watch::channel(false);
    if !opts.disable_lock {
        tokio::spawn(refresh_loop(db.clone(), id, cfg.heartbeat_interval(), stopped));
    }
    Ok(Event {
        db: db.clone(),
        id,
        target_type: opts.target_type,
        target_value: opts.target_value,
        kind: opts.kind,
        stop: Arc::new(stop),
    })
}

async fn expire_if_stale(db: &Db, cfg: &LockConfig, holder: &EventRecord) -> ApiResult<bool> {
    let now = Utc::now();
    let error = format!("event expired, no update for {}s", cfg.expire_secs);
    let expired = persistence::events::expire_event(
        db,
        holder.id,
        lock::stale_before(cfg, now),
        &error,
        now,
    )
    .await?;
    if expired == 0 {
        return Ok(false);
    }
    telemetry::record_lock_expired("event");
    warn!(
        event_id = %holder.id,
        target_type = %holder.target_type,
        target_value = %holder.target_value,
        kind = %holder.kind,
        "expired abandoned event"
    );
    debug!(event_id = %holder.id, "retrying event open after expiry");
    Ok(true)
}

fn locked_message(holder: &EventRecord) -> String {
    format!(
        "event locked: {}({}) running \"{}\" start by {} at {}",
        holder.target_type,
        holder.target_value,
        holder.kind,
        holder.owner,
        holder
            .start_time
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

pub fn is_visible(principal: &Principal, record: &EventRecord) -> bool {
    principal.allows(&record.allowed_scheme, &record.allowed_contexts.0)
}

pub async fn list_visible(
    db: &Db,
    principal: &Principal,
    filter: &EventFilter,
    skip: usize,
    limit: usize,
) -> ApiResult<Vec<EventView>> {
    let wanted = skip.saturating_add(limit);
    let mut visible = Vec::new();
    let mut offset = 0usize;
    while visible.len() < wanted {
        let page = persistence::events::list_events(db, filter, offset, LIST_PAGE).await?;
        let fetched = page.len();
        visible.extend(page.into_iter().filter(|record| is_visible(principal, record)));
        if fetched < LIST_PAGE {
            break;
        }
        offset += fetched;
    }
    Ok(visible
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(to_view)
        .collect())
}

/// Rows read per query while collecting a page of visible events.
const LIST_PAGE: usize = 200;

/// Events the caller cannot see are reported as missing.
pub async fn get_visible(db: &Db, principal: &Principal, id: Uuid) -> ApiResult<EventView> {
    persistence::events::get_event(db, id)
        .await?
        .filter(|record| is_visible(principal, record))
        .map(to_view)
        .ok_or_else(|| AppError::not_found("Event not found."))
}

pub fn to_view(record: EventRecord) -> EventView {
    EventView {
        id: record.id,
        target: EventTarget {
            target_type: record.target_type,
            value: record.target_value,
        },
        kind: record.kind,
        owner: record.owner,
        start_time: record.start_time,
        end_time: record.end_time,
        running: record.running,
        error: record.error,
        custom_data: record.custom_data.0,
        end_custom_data: record.end_custom_data.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{Permission, schemes};
    use crate::services::test_support::setup_state;

    fn admin() -> Principal {
        Principal::user("admin@example.com", vec![Permission::root()])
    }

    fn opts(target: &str) -> EventOpts {
        EventOpts::new(
            targets::NODE,
            target,
            schemes::NODE_UPDATE,
            &admin(),
            Allowed::new(schemes::NODE_READ_EVENTS, vec![PermissionContext::pool("main")]),
        )
    }

    #[tokio::test]
    async fn second_open_on_target_conflicts_until_done() {
        let state = setup_state().await;
        let first = open(&state.db, &state.lock, opts("http://n1:2375")).await.expect("open");

        let err = open(&state.db, &state.lock, opts("http://n1:2375")).await.unwrap_err();
        assert_eq!(err.code, "conflict");
        assert!(
            err.message.starts_with(
                "event locked: node(http://n1:2375) running \"node.update\" start by admin@example.com at "
            ),
            "{}",
            err.message
        );

        open(&state.db, &state.lock, opts("http://n1:2375").without_lock())
            .await
            .expect("lock-free event");
        open(&state.db, &state.lock, opts("http://n2:2375")).await.expect("other target");

        first.done(Some("boom")).await;
        open(&state.db, &state.lock, opts("http://n1:2375")).await.expect("reopen");

        let view = get_visible(&state.db, &admin(), first.id).await.unwrap();
        assert!(!view.running);
        assert_eq!(view.error, "boom");
    }

    #[tokio::test]
    async fn visibility_follows_allowed_contexts() {
        let state = setup_state().await;
        let event = open(&state.db, &state.lock, opts("http://n1:2375")).await.unwrap();
        event.done(None).await;

        let pool_reader = Principal::user(
            "ops@example.com",
            vec![Permission::new("node.read", PermissionContext::pool("main"))],
        );
        let stranger = Principal::user(
            "dev@example.com",
            vec![Permission::new("node.read", PermissionContext::pool("other"))],
        );
        let filter = EventFilter::default();

        assert_eq!(
            list_visible(&state.db, &pool_reader, &filter, 0, 10)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(
            list_visible(&state.db, &stranger, &filter, 0, 10)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            get_visible(&state.db, &stranger, event.id)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    async fn backdate(state: &crate::app_state::AppState, id: Uuid, secs: i64) {
        let past = Utc::now() - chrono::Duration::seconds(secs);
        sqlx::query("UPDATE events SET start_time = ?2, lock_update_time = ?2 WHERE id = ?1")
            .bind(id)
            .bind(past)
            .execute(&state.db)
            .await
            .expect("backdate");
    }

    #[tokio::test]
    async fn abandoned_event_expires_and_frees_target() {
        let state = setup_state().await;
        let stale = open(&state.db, &state.lock, opts("http://n1:2375")).await.unwrap();
        backdate(&state, stale.id, state.lock.expire_secs as i64 + 5).await;

        let fresh = open(&state.db, &state.lock, opts("http://n1:2375"))
            .await
            .expect("expired holder does not block");

        let view = get_visible(&state.db, &admin(), stale.id).await.unwrap();
        assert!(!view.running);
        assert_eq!(
            view.error,
            format!("event expired, no update for {}s", state.lock.expire_secs)
        );
        assert!(view.end_time.is_some());

        // Closing the expired handle later leaves the recorded expiry alone.
        stale.done(None).await;
        let view = get_visible(&state.db, &admin(), stale.id).await.unwrap();
        assert!(view.error.starts_with("event expired"));
        fresh.done(None).await;
    }

    #[tokio::test]
    async fn refreshed_event_keeps_its_lock() {
        let state = setup_state().await;
        let event = open(&state.db, &state.lock, opts("http://n1:2375")).await.unwrap();
        backdate(&state, event.id, state.lock.expire_secs as i64 + 5).await;
        assert!(event.refresh_lock().await.unwrap());

        let err = open(&state.db, &state.lock, opts("http://n1:2375"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "conflict");

        event.done(None).await;
        assert!(!event.refresh_lock().await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_running_event() {
        let state = setup_state().await;
        let cfg = LockConfig {
            heartbeat_secs: 1,
            expire_secs: 2,
            ..state.lock.clone()
        };
        let event = open(&state.db, &cfg, opts("http://n1:2375")).await.unwrap();
        backdate(&state, event.id, 60).await;

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        let record = persistence::events::get_event(&state.db, event.id)
            .await
            .unwrap()
            .unwrap();
        let refreshed = record.lock_update_time.expect("lock update time");
        assert!(Utc::now() - refreshed < chrono::Duration::seconds(2));
        event.done(None).await;
    }

    #[tokio::test]
    async fn listing_pages_past_hidden_events() {
        let state = setup_state().await;
        let hidden = Allowed::new(
            schemes::NODE_READ_EVENTS,
            vec![PermissionContext::pool("secret")],
        );
        for n in 0..(LIST_PAGE + 5) {
            let mut o = opts(&format!("http://hidden{n}:2375")).without_lock();
            o.allowed = hidden.clone();
            open(&state.db, &state.lock, o).await.unwrap().done(None).await;
        }
        let mut shown = Vec::new();
        for n in 0..3 {
            let event = open(&state.db, &state.lock, opts(&format!("http://n{n}:2375")))
                .await
                .unwrap();
            event.done(None).await;
            shown.push(event.id);
        }
        // Older visible events sit behind a full page of hidden ones.
        sqlx::query("UPDATE events SET start_time = ?1 WHERE target_value LIKE 'http://n%'")
            .bind(Utc::now() - chrono::Duration::days(1))
            .execute(&state.db)
            .await
            .unwrap();

        let pool_reader = Principal::user(
            "ops@example.com",
            vec![Permission::new("node.read", PermissionContext::pool("main"))],
        );
        let filter = EventFilter::default();
        let first = list_visible(&state.db, &pool_reader, &filter, 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = list_visible(&state.db, &pool_reader, &filter, 2, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        let all = list_visible(&state.db, &pool_reader, &filter, 0, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|view| shown.contains(&view.id)));
    }
}
