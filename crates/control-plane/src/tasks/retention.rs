use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::Result;
use crate::config::EventsConfig;
use crate::persistence::{self as db, deploys, events, tokens};

/// Rows removed by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub events: u64,
    pub deploys: u64,
    pub tokens: u64,
}

impl RetentionReport {
    fn is_empty(&self) -> bool {
        self.events == 0 && self.deploys == 0 && self.tokens == 0
    }
}

pub async fn retention_loop(db: db::Db, cfg: EventsConfig) {
    let mut interval = tokio::time::interval(cfg.sweep_interval());

    loop {
        interval.tick().await;

        match run_retention_sweep(&db, &cfg, Utc::now()).await {
            Ok(report) if report.is_empty() => {}
            Ok(report) => info!(
                events = report.events,
                deploys = report.deploys,
                tokens = report.tokens,
                "retention sweep pruned rows"
            ),
            Err(err) => warn!(?err, "retention sweep failed"),
        }
    }
}

/// Expired tokens always go. Ended events and removed deploys go once they are
/// older than `retention_secs`; a zero window keeps them forever.
pub async fn run_retention_sweep(
    db: &db::Db,
    cfg: &EventsConfig,
    now: DateTime<Utc>,
) -> Result<RetentionReport> {
    let mut report = RetentionReport {
        tokens: tokens::prune_expired(db, now).await?,
        ..RetentionReport::default()
    };
    if cfg.retention_secs == 0 {
        return Ok(report);
    }

    let cutoff = now - ChronoDuration::seconds(cfg.retention_secs.min(i64::MAX as u64) as i64);
    report.events = events::prune_ended(db, cutoff).await?;
    report.deploys = deploys::prune_removed(db, cutoff).await?;
    Ok(report)
}
