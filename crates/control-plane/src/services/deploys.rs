//! Deploy pipeline.
//!
//! Handlers call a `prepare_*` function first. It resolves the app, checks
//! permissions, takes the app lock and opens the event, so every refusal is a
//! plain HTTP error. The matching `run_*` function then executes inside the
//! spawned streaming task and always closes the event and the lock.

use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use common::api::{DeployData, DeployKind};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::error::{ApiResult, AppError};
use crate::events::{self, Allowed, Event, EventOpts, targets};
use crate::lock::{self, AppLockGuard, PreventUnlock};
use crate::permission::schemes;
use crate::persistence::{AppRecord, DeployFilter, DeployRecord, NewDeploy, deploys};
use crate::provision::{DeployArgs, RollbackArgs};
use crate::services::apps::{self, app_contexts};
use crate::streaming::StreamWriter;
use crate::telemetry;

pub const ORIGINS: [&str; 5] = ["git", "image", "rollback", "app-deploy", "drag-and-drop"];
pub const DEPLOY_NOT_FOUND: &str = "Deploy not found.";

/// Deploy input as read from the form or multipart body.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub archive_url: Option<String>,
    pub commit: Option<String>,
    pub image: Option<String>,
    pub file: Option<Bytes>,
    pub build: bool,
    pub origin: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RollbackRequest {
    pub image: String,
    pub origin: Option<String>,
}

/// Everything a running deploy needs once the lock and event are held.
#[derive(Debug)]
pub struct PreparedDeploy {
    pub app: AppRecord,
    pub kind: DeployKind,
    pub origin: String,
    pub user: String,
    pub request: DeployRequest,
    pub event: Event,
    pub lock: AppLockGuard,
}

#[derive(Debug)]
pub struct PreparedRollback {
    pub app: AppRecord,
    pub origin: String,
    pub user: String,
    pub image: String,
    pub event: Event,
    pub lock: AppLockGuard,
}

pub fn classify(req: &DeployRequest, rollback: bool) -> DeployKind {
    let has = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
    if rollback {
        DeployKind::Rollback
    } else if has(&req.image) && req.file.is_none() {
        DeployKind::Image
    } else if req.file.is_some() && req.build {
        DeployKind::UploadBuild
    } else if req.file.is_some() {
        DeployKind::Upload
    } else if has(&req.commit) {
        DeployKind::Git
    } else if has(&req.archive_url) {
        DeployKind::ArchiveUrl
    } else {
        DeployKind::AppDeploy
    }
}

pub fn scheme_for_kind(kind: DeployKind) -> &'static str {
    match kind {
        DeployKind::Git => schemes::APP_DEPLOY_GIT,
        DeployKind::Image => schemes::APP_DEPLOY_IMAGE,
        DeployKind::Upload => schemes::APP_DEPLOY_UPLOAD,
        DeployKind::UploadBuild => schemes::APP_DEPLOY_BUILD,
        DeployKind::ArchiveUrl => schemes::APP_DEPLOY_ARCHIVE_URL,
        DeployKind::Rollback => schemes::APP_DEPLOY_ROLLBACK,
        DeployKind::AppDeploy => schemes::APP_DEPLOY,
    }
}

/// An image deploy always records origin `image`.
pub fn resolve_origin(origin: Option<&str>, has_image: bool) -> ApiResult<String> {
    if has_image {
        return Ok("image".to_string());
    }
    match origin.filter(|o| !o.is_empty()) {
        None => Ok(String::new()),
        Some(origin) if ORIGINS.contains(&origin) => Ok(origin.to_string()),
        Some(_) => Err(AppError::bad_request("Invalid deployment origin")),
    }
}

/// Image tag for the app's next deploy.
pub fn next_image(state: &AppState, app: &AppRecord) -> String {
    format!("{}{}:v{}", state.deploy.image_prefix, app.name, app.deploys + 1)
}

fn deploy_user(principal: &Principal, requested: Option<&str>) -> String {
    requested
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| principal.name())
        .to_string()
}

async fn lock_and_open(
    state: &AppState,
    principal: &Principal,
    app: &AppRecord,
    custom_data: serde_json::Value,
) -> ApiResult<(AppLockGuard, Event)> {
    let lock = lock::acquire(
        &state.db,
        &state.lock,
        &app.name,
        &format!("deploy {}", app.name),
        principal.name(),
    )
    .await?;

    let opened = events::open(
        &state.db,
        &state.lock,
        EventOpts::new(
            targets::APP,
            app.name.clone(),
            schemes::APP_DEPLOY,
            principal,
            Allowed::new(schemes::APP_READ_EVENTS, app_contexts(app)),
        )
        .with_data(custom_data),
    )
    .await;
    match opened {
        Ok(event) => Ok((lock, event)),
        Err(err) => {
            lock.release().await;
            Err(err)
        }
    }
}

pub async fn prepare_deploy(
    state: &AppState,
    principal: &Principal,
    app_name: &str,
    req: DeployRequest,
) -> ApiResult<PreparedDeploy> {
    let app = apps::get_app(state, app_name).await?;
    let has_image = req.image.as_deref().is_some_and(|i| !i.is_empty());
    let origin = resolve_origin(req.origin.as_deref(), has_image)?;
    let kind = classify(&req, false);
    principal.require(scheme_for_kind(kind), &app_contexts(&app))?;

    let user = deploy_user(principal, req.user.as_deref());
    let custom_data = json!({
        "app.name": app.name,
        "commit": req.commit.clone().unwrap_or_default(),
        "filesize": req.file.as_ref().map(|f| f.len()).unwrap_or_default(),
        "kind": kind.as_str(),
        "archiveurl": req.archive_url.clone().unwrap_or_default(),
        "user": user,
        "image": req.image.clone().unwrap_or_default(),
        "origin": origin,
        "build": req.build,
        "rollback": false,
    });
    let (lock, event) = lock_and_open(state, principal, &app, custom_data).await?;

    Ok(PreparedDeploy {
        app,
        kind,
        origin,
        user,
        request: req,
        event,
        lock,
    })
}

/// Run a prepared deploy, writing text progress and the `OK` terminator.
///
/// The lock is kept when `prevent` is set by the time the run finishes.
pub async fn run_deploy(
    state: AppState,
    prepared: PreparedDeploy,
    out: StreamWriter,
    prevent: PreventUnlock,
) {
    let PreparedDeploy {
        app,
        kind,
        origin,
        user,
        request,
        event,
        mut lock,
    } = prepared;
    lock.keep_when(prevent);
    let started = Instant::now();
    let target_image = next_image(&state, &app);
    let build_only = request.build;

    let result = match apps::app_provisioner(&state, &app).await {
        Ok(provisioner) => provisioner
            .deploy(
                DeployArgs {
                    app: app.clone(),
                    kind,
                    target_image,
                    source_image: request.image.clone(),
                    archive_url: request.archive_url.clone(),
                    commit: request.commit.clone(),
                    file: request.file.clone(),
                    build_only,
                },
                out.clone(),
            )
            .await
            .map_err(|err| err.to_string()),
        Err(err) => Err(err.message),
    };

    let record = NewDeploy {
        app: app.name.clone(),
        timestamp: Utc::now(),
        duration_ms: started.elapsed().as_millis() as i64,
        commit: request.commit.unwrap_or_default(),
        image: result.as_deref().unwrap_or_default().to_string(),
        origin,
        kind: kind.as_str().to_string(),
        user,
    };

    let result = match result {
        Ok(image) if !build_only => record_produced(&state, record.clone(), image).await,
        other => other,
    };

    let outcome = match result {
        Ok(image) => {
            out.write("OK\n").await;
            info!(app = %app.name, kind = kind.as_str(), %image, build_only, "deploy finished");
            event.done_with(None, json!({ "image": image })).await;
            true
        }
        Err(msg) => {
            if !build_only
                && let Err(err) = deploys::record_failure(&state.db, record, &msg).await
            {
                warn!(?err, app = %app.name, "failed to record failed deploy");
            }
            out.write(format!("error: {msg}\n")).await;
            out.error(msg.clone()).await;
            warn!(app = %app.name, kind = kind.as_str(), error = %msg, "deploy failed");
            event.done(Some(&msg)).await;
            false
        }
    };

    lock.release().await;
    telemetry::record_deploy_result(kind, outcome);
}

/// Store a produced image as the app's newest deploy. The image already
/// exists when this fails, so the error names it.
async fn record_produced(
    state: &AppState,
    record: NewDeploy,
    image: String,
) -> Result<String, String> {
    match deploys::record_success(&state.db, record).await {
        Ok(_) => Ok(image),
        Err(err) => Err(format!(
            "image {image} was built but the deploy could not be recorded: {err}"
        )),
    }
}

pub async fn prepare_rollback(
    state: &AppState,
    principal: &Principal,
    app_name: &str,
    req: RollbackRequest,
) -> ApiResult<PreparedRollback> {
    let app = apps::get_app(state, app_name).await?;
    if req.image.trim().is_empty() {
        return Err(AppError::bad_request(
            "you must specify an image or a version",
        ));
    }
    let origin = match req.origin.as_deref().filter(|o| !o.is_empty()) {
        Some(origin) => resolve_origin(Some(origin), false)?,
        None => "rollback".to_string(),
    };
    principal.require(schemes::APP_DEPLOY_ROLLBACK, &app_contexts(&app))?;

    let user = principal.name().to_string();
    let custom_data = json!({
        "app.name": app.name,
        "kind": DeployKind::Rollback.as_str(),
        "user": user,
        "image": req.image,
        "origin": origin,
        "rollback": true,
    });
    let (lock, event) = lock_and_open(state, principal, &app, custom_data).await?;

    Ok(PreparedRollback {
        app,
        origin,
        user,
        image: req.image,
        event,
        lock,
    })
}

/// Run a prepared rollback, writing JSON frames.
pub async fn run_rollback(
    state: AppState,
    prepared: PreparedRollback,
    out: StreamWriter,
    prevent: PreventUnlock,
) {
    let PreparedRollback {
        app,
        origin,
        user,
        image,
        event,
        mut lock,
    } = prepared;
    lock.keep_when(prevent);
    let started = Instant::now();

    let result = match rollback_inner(&state, &app, image, out.clone()).await {
        Ok(image) => {
            let record = NewDeploy {
                app: app.name.clone(),
                timestamp: Utc::now(),
                duration_ms: started.elapsed().as_millis() as i64,
                commit: String::new(),
                image: image.clone(),
                origin,
                kind: DeployKind::Rollback.as_str().to_string(),
                user,
            };
            record_produced(&state, record, image).await
        }
        Err(msg) => Err(msg),
    };
    let outcome = match result {
        Ok(image) => {
            out.message("OK").await;
            info!(app = %app.name, %image, "rollback finished");
            event.done_with(None, json!({ "image": image })).await;
            true
        }
        Err(msg) => {
            out.error(msg.clone()).await;
            warn!(app = %app.name, error = %msg, "rollback failed");
            event.done(Some(&msg)).await;
            false
        }
    };

    lock.release().await;
    telemetry::record_deploy_result(DeployKind::Rollback, outcome);
}

async fn rollback_inner(
    state: &AppState,
    app: &AppRecord,
    requested_image: String,
    out: StreamWriter,
) -> Result<String, String> {
    let candidates = deploys::rollback_candidates(&state.db, &app.name)
        .await
        .map_err(|err| err.to_string())?
        .into_iter()
        .map(|record| record.image)
        .collect();
    let provisioner = apps::app_provisioner(state, app)
        .await
        .map_err(|err| err.message)?;
    provisioner
        .rollback(
            RollbackArgs {
                app: app.clone(),
                requested_image,
                candidates,
            },
            out,
        )
        .await
        .map_err(|err| err.to_string())
}

/// Attach a textual diff to the app's newest deploy.
pub async fn save_diff(
    state: &AppState,
    principal: &Principal,
    app_name: &str,
    diff: &str,
) -> ApiResult<()> {
    let app = apps::get_app(state, app_name).await?;
    principal.require(schemes::APP_DEPLOY, &app_contexts(&app))?;
    let Some(latest) = deploys::latest_for_app(&state.db, &app.name).await? else {
        return Err(AppError::not_found(DEPLOY_NOT_FOUND));
    };
    deploys::set_diff(&state.db, latest.id, diff).await?;
    Ok(())
}

pub async fn list_deploys(
    state: &AppState,
    principal: &Principal,
    app: Option<String>,
    skip: u32,
    limit: Option<u32>,
) -> ApiResult<Vec<DeployData>> {
    let visible_apps =
        apps::visible_app_names(state, principal, schemes::APP_READ_DEPLOY).await?;
    let filter = DeployFilter {
        app: app.filter(|a| !a.is_empty()),
        visible_apps,
        skip,
        limit: state.list_limit(limit),
    };
    Ok(deploys::list_deploys(&state.db, &filter)
        .await?
        .into_iter()
        .map(to_data)
        .collect())
}

/// Deploys of apps the caller cannot read are reported as missing.
pub async fn get_deploy(state: &AppState, principal: &Principal, id: Uuid) -> ApiResult<DeployData> {
    let Some(record) = deploys::get_deploy(&state.db, id).await? else {
        return Err(AppError::not_found(DEPLOY_NOT_FOUND));
    };
    let visible = match crate::persistence::apps::get_app(&state.db, &record.app).await? {
        Some(app) => principal.allows(schemes::APP_READ_DEPLOY, &app_contexts(&app)),
        None => principal.allows(schemes::APP_READ_DEPLOY, &[]),
    };
    if !visible {
        return Err(AppError::not_found(DEPLOY_NOT_FOUND));
    }
    Ok(to_data(record))
}

pub fn to_data(record: DeployRecord) -> DeployData {
    DeployData {
        id: record.id,
        app: record.app,
        timestamp: record.timestamp,
        duration_ms: record.duration_ms,
        commit: record.commit,
        error: record.error,
        image: record.image,
        origin: record.origin,
        kind: DeployKind::parse(&record.kind).unwrap_or(DeployKind::AppDeploy),
        user: record.user,
        diff: record.diff,
        can_rollback: record.can_rollback,
        removed_at: record.removed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::PreventUnlock;
    use crate::permission::{Permission, PermissionContext};
    use crate::persistence::apps as app_store;
    use crate::services::test_support::{seed_app, setup_state};
    use crate::streaming;

    fn admin() -> Principal {
        Principal::user("admin@example.com", vec![Permission::root()])
    }

    async fn drain(mut rx: tokio::sync::mpsc::Receiver<Bytes>) -> String {
        let mut body = Vec::new();
        while let Some(chunk) = rx.recv().await {
            body.extend_from_slice(&chunk);
        }
        String::from_utf8(body).unwrap()
    }

    async fn deploy(state: &AppState, app: &str, req: DeployRequest) -> String {
        let prepared = prepare_deploy(state, &admin(), app, req).await.expect("prepare");
        let (out, rx) = streaming::channel();
        let run = run_deploy(state.clone(), prepared, out, PreventUnlock::default());
        let (_, body) = tokio::join!(run, drain(rx));
        body
    }

    #[test]
    fn classification_follows_priority() {
        let file = Some(Bytes::from_static(b"tarball"));
        let req = |f: fn(&mut DeployRequest)| {
            let mut req = DeployRequest::default();
            f(&mut req);
            req
        };

        assert_eq!(classify(&DeployRequest::default(), true), DeployKind::Rollback);
        assert_eq!(
            classify(&req(|r| r.image = Some("img".into())), false),
            DeployKind::Image
        );
        let mut upload = DeployRequest {
            file: file.clone(),
            image: Some("img".into()),
            ..DeployRequest::default()
        };
        assert_eq!(classify(&upload, false), DeployKind::Upload);
        upload.build = true;
        assert_eq!(classify(&upload, false), DeployKind::UploadBuild);
        assert_eq!(
            classify(
                &req(|r| {
                    r.commit = Some("abc".into());
                    r.archive_url = Some("http://x/a.tar.gz".into());
                }),
                false
            ),
            DeployKind::Git
        );
        assert_eq!(
            classify(&req(|r| r.archive_url = Some("http://x/a.tar.gz".into())), false),
            DeployKind::ArchiveUrl
        );
        assert_eq!(classify(&DeployRequest::default(), false), DeployKind::AppDeploy);
    }

    #[test]
    fn origin_must_be_known() {
        assert_eq!(resolve_origin(Some("git"), false).unwrap(), "git");
        assert_eq!(resolve_origin(Some("drag"), true).unwrap(), "image");
        assert_eq!(resolve_origin(None, false).unwrap(), "");
        let err = resolve_origin(Some("drag"), false).unwrap_err();
        assert_eq!(err.message, "Invalid deployment origin");
    }

    #[tokio::test]
    async fn archive_deploy_records_success_and_releases_lock() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;

        let body = deploy(
            &state,
            "web",
            DeployRequest {
                archive_url: Some("http://something.tar.gz".into()),
                user: Some("fulano".into()),
                ..DeployRequest::default()
            },
        )
        .await;
        assert!(body.ends_with("OK\n"), "{body}");

        let app = app_store::get_app(&state.db, "web").await.unwrap().unwrap();
        assert_eq!(app.deploys, 1);
        assert_eq!(app.current_image, "paas/app-web:v1");
        assert!(!app.lock_locked);

        let listed = list_deploys(&state, &admin(), Some("web".into()), 0, None)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, DeployKind::ArchiveUrl);
        assert_eq!(listed[0].user, "fulano");
    }

    #[tokio::test]
    async fn failed_deploy_writes_error_trailer() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;

        let body = deploy(
            &state,
            "web",
            DeployRequest {
                archive_url: Some("not a url".into()),
                ..DeployRequest::default()
            },
        )
        .await;
        assert!(body.contains("error: invalid archive url"), "{body}");
        assert!(body.trim_end().ends_with("\"}"), "{body}");

        let app = app_store::get_app(&state.db, "web").await.unwrap().unwrap();
        assert_eq!(app.deploys, 0);
        let listed = list_deploys(&state, &admin(), None, 0, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].error.is_empty());
        assert!(!listed[0].can_rollback);
    }

    #[tokio::test]
    async fn unrecorded_deploy_reports_error() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;
        let prepared = prepare_deploy(
            &state,
            &admin(),
            "web",
            DeployRequest {
                archive_url: Some("http://something.tar.gz".into()),
                ..DeployRequest::default()
            },
        )
        .await
        .expect("prepare");
        let event_id = prepared.event.id;
        sqlx::query("ALTER TABLE deploys RENAME TO deploys_elsewhere")
            .execute(&state.db)
            .await
            .unwrap();

        let (out, rx) = streaming::channel();
        let run = run_deploy(state.clone(), prepared, out, PreventUnlock::default());
        let (_, body) = tokio::join!(run, drain(rx));
        assert!(!body.ends_with("OK\n"), "{body}");
        assert!(
            body.contains("error: image paas/app-web:v1 was built but the deploy could not be"),
            "{body}"
        );
        assert!(body.trim_end().ends_with("\"}"), "{body}");

        let event = crate::persistence::events::get_event(&state.db, event_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!event.running);
        assert!(event.error.contains("could not be recorded"), "{}", event.error);

        let app = app_store::get_app(&state.db, "web").await.unwrap().unwrap();
        assert_eq!(app.deploys, 0);
        assert!(!app.lock_locked);
    }

    #[tokio::test]
    async fn build_only_leaves_no_row() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;

        let body = deploy(
            &state,
            "web",
            DeployRequest {
                file: Some(Bytes::from_static(b"archive")),
                build: true,
                ..DeployRequest::default()
            },
        )
        .await;
        assert!(body.ends_with("OK\n"), "{body}");
        assert!(list_deploys(&state, &admin(), None, 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_lock_is_a_conflict() {
        let mut state = setup_state().await;
        state.lock.wait_ms = 20;
        seed_app(&state, "web", "blue").await;
        let _held = lock::acquire(&state.db, &state.lock, "web", "POST /apps/web/env", "ops")
            .await
            .unwrap();

        let err = prepare_deploy(&state, &admin(), "web", DeployRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, "conflict");
        assert!(err.message.contains("running POST /apps/web/env"));
    }

    #[tokio::test]
    async fn prevent_unlock_keeps_lock() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;
        let prepared = prepare_deploy(&state, &admin(), "web", DeployRequest::default())
            .await
            .unwrap();
        let flag = PreventUnlock::default();
        flag.set();
        let (out, rx) = streaming::channel();
        tokio::join!(run_deploy(state.clone(), prepared, out, flag.clone()), drain(rx));

        let app = app_store::get_app(&state.db, "web").await.unwrap().unwrap();
        assert!(app.lock_locked);
    }

    #[tokio::test]
    async fn rollback_resolves_short_tags() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;
        for _ in 0..2 {
            deploy(
                &state,
                "web",
                DeployRequest {
                    archive_url: Some("http://x/app.tar.gz".into()),
                    ..DeployRequest::default()
                },
            )
            .await;
        }

        let prepared = prepare_rollback(
            &state,
            &admin(),
            "web",
            RollbackRequest {
                image: "v1".into(),
                origin: None,
            },
        )
        .await
        .unwrap();
        let (out, rx) = streaming::channel();
        let (_, body) = tokio::join!(
            run_rollback(state.clone(), prepared, out, PreventUnlock::default()),
            drain(rx)
        );
        assert!(body.starts_with("{\"Message\":\"Rollback deploy called\"}\n"), "{body}");

        let app = app_store::get_app(&state.db, "web").await.unwrap().unwrap();
        assert_eq!(app.current_image, "paas/app-web:v1");
        assert_eq!(app.deploys, 3);

        let prepared = prepare_rollback(
            &state,
            &admin(),
            "web",
            RollbackRequest {
                image: "v9".into(),
                origin: None,
            },
        )
        .await
        .unwrap();
        let (out, rx) = streaming::channel();
        let (_, body) = tokio::join!(
            run_rollback(state.clone(), prepared, out, PreventUnlock::default()),
            drain(rx)
        );
        assert!(body.contains("{\"Error\":\"Invalid version: v9\"}"), "{body}");
    }

    #[tokio::test]
    async fn diff_targets_latest_deploy() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;
        let err = save_diff(&state, &admin(), "web", "+line").await.unwrap_err();
        assert_eq!(err.message, DEPLOY_NOT_FOUND);

        deploy(&state, "web", DeployRequest::default()).await;
        save_diff(&state, &admin(), "web", "+line").await.unwrap();
        let listed = list_deploys(&state, &admin(), None, 0, None).await.unwrap();
        let fetched = get_deploy(&state, &admin(), listed[0].id).await.unwrap();
        assert_eq!(fetched.diff, "+line");
    }

    #[tokio::test]
    async fn hidden_deploys_are_not_found() {
        let state = setup_state().await;
        seed_app(&state, "web", "blue").await;
        deploy(&state, "web", DeployRequest::default()).await;
        let id = list_deploys(&state, &admin(), None, 0, None).await.unwrap()[0].id;

        let outsider = Principal::user(
            "dev@example.com",
            vec![Permission::new(schemes::APP, PermissionContext::team("red"))],
        );
        assert!(list_deploys(&state, &outsider, None, 0, None).await.unwrap().is_empty());
        assert!(get_deploy(&state, &outsider, id).await.unwrap_err().is_not_found());
    }
}
