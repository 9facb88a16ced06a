use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::LockConfig,
    error::{ApiResult, AppError},
    persistence::{AppRecord, Db, apps},
    telemetry,
};

/// Request-scoped flag telling the lock holder to keep the lock on exit.
#[derive(Debug, Clone, Default)]
pub struct PreventUnlock(Arc<AtomicBool>);

impl PreventUnlock {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A held app lock.
///
/// While the guard lives a background task refreshes the lock every
/// `lock.heartbeat_secs`. Dropping the guard releases the lock unless its
/// [`PreventUnlock`] flag is set; [`AppLockGuard::release`] does the same and
/// waits for the write.
#[must_use = "dropping the guard releases the app lock"]
#[derive(Debug)]
pub struct AppLockGuard {
    db: Db,
    app: String,
    prevent: PreventUnlock,
    heartbeat: Option<JoinHandle<()>>,
}

impl AppLockGuard {
    fn new(db: &Db, app: &str, acquired_at: DateTime<Utc>, every: Duration) -> Self {
        let heartbeat = tokio::spawn(refresh_loop(
            db.clone(),
            app.to_string(),
            acquired_at,
            every,
        ));
        Self {
            db: db.clone(),
            app: app.to_string(),
            prevent: PreventUnlock::default(),
            heartbeat: Some(heartbeat),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Keep the lock after release when `prevent` is set.
    pub fn keep_when(&mut self, prevent: PreventUnlock) {
        self.prevent = prevent;
    }

    pub async fn release(mut self) {
        self.stop_heartbeat();
        let app = std::mem::take(&mut self.app);
        if self.prevent.is_set() {
            debug!(app = %app, "keeping app lock");
            return;
        }
        release(&self.db, &app).await;
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

impl Drop for AppLockGuard {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.app.is_empty() {
            return;
        }
        if self.prevent.is_set() {
            debug!(app = %self.app, "keeping app lock");
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(app = %self.app, "no runtime to release app lock; it will expire");
            return;
        };
        let db = self.db.clone();
        let app = std::mem::take(&mut self.app);
        handle.spawn(async move { release(&db, &app).await });
    }
}

async fn refresh_loop(db: Db, app: String, acquired_at: DateTime<Utc>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match apps::touch_lock(&db, &app, acquired_at, Utc::now()).await {
            Ok(0) => {
                warn!(app = %app, "app lock is no longer held; stopping refresh");
                return;
            }
            Ok(_) => {}
            Err(err) => warn!(?err, app = %app, "failed to refresh app lock"),
        }
    }
}

/// Lets a handler move the lock taken by the middleware into the task that
/// does the work, so the lock outlives the response body.
#[derive(Debug, Clone, Default)]
pub struct LockHandoff(Arc<Mutex<Option<AppLockGuard>>>);

impl LockHandoff {
    pub fn new(guard: AppLockGuard) -> Self {
        Self(Arc::new(Mutex::new(Some(guard))))
    }

    pub fn take(&self) -> Option<AppLockGuard> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

pub(crate) fn stale_before(cfg: &LockConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let expire = i64::try_from(cfg.expire_secs).unwrap_or(i64::MAX).min(i64::from(i32::MAX));
    now - chrono::Duration::seconds(expire)
}

/// Take the app lock, polling with capped backoff for at most `cfg.wait_ms`.
///
/// A lock that has not been refreshed for `cfg.expire_secs` is taken over.
pub async fn acquire(
    db: &Db,
    cfg: &LockConfig,
    app: &str,
    reason: &str,
    owner: &str,
) -> ApiResult<AppLockGuard> {
    let deadline = Instant::now() + cfg.wait_window();
    let mut backoff = Duration::from_millis(cfg.poll_min_ms.max(1));
    let max_backoff = Duration::from_millis(cfg.poll_max_ms.max(cfg.poll_min_ms).max(1));

    loop {
        let previous = apps::get_app(db, app).await?;
        let Some(previous) = previous else {
            return Err(AppError::not_found("App not found."));
        };

        let now = Utc::now();
        if apps::try_lock(db, app, reason, owner, now, stale_before(cfg, now)).await? == 1 {
            if previous.lock_locked {
                telemetry::record_lock_expired("app");
                warn!(
                    app,
                    previous_owner = %previous.lock_owner,
                    previous_reason = %previous.lock_reason,
                    "took over expired app lock"
                );
            }
            debug!(app, reason, owner, "app lock acquired");
            return Ok(AppLockGuard::new(db, app, now, cfg.heartbeat_interval()));
        }

        let Some(record) = apps::get_app(db, app).await? else {
            return Err(AppError::not_found("App not found."));
        };

        let waited = Instant::now();
        if waited >= deadline {
            telemetry::record_lock_conflict();
            return Err(AppError::conflict(locked_message(&record)));
        }

        let remaining = deadline - waited;
        tokio::time::sleep(backoff.min(remaining)).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

/// Unconditional release. Failures are logged.
pub async fn release(db: &Db, app: &str) {
    match apps::unlock(db, app).await {
        Ok(_) => debug!(app, "app lock released"),
        Err(err) => warn!(?err, app, "failed to release app lock"),
    }
}

pub fn locked_message(record: &AppRecord) -> String {
    let acquired = record
        .lock_acquired_at
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();
    format!(
        "App locked by {}, running {}. Acquired in {}",
        record.lock_owner, record.lock_reason, acquired
    )
}
