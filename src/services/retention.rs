//! History retention
//!
//! Deletes event and notification history older than `max_age_days`, from
//! the store and from the history log. Current records are kept regardless
//! of age.

use crate::domain::types::epoch_seconds;
use crate::infra::metrics::Metrics;
use crate::io::history_log::HistoryLog;
use crate::services::store::DoorStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSummary {
    pub cutoff_seconds: i64,
    pub dry_run: bool,
    pub events_deleted: usize,
    pub notifications_deleted: usize,
    pub log_lines_deleted: usize,
}

pub struct RetentionJob {
    store: Arc<dyn DoorStore>,
    metrics: Arc<Metrics>,
    enabled: bool,
    dry_run: bool,
    max_age_days: u64,
    history: Option<HistoryLog>,
}

impl RetentionJob {
    pub fn new(
        store: Arc<dyn DoorStore>,
        metrics: Arc<Metrics>,
        enabled: bool,
        dry_run: bool,
        max_age_days: u64,
    ) -> Self {
        Self { store, metrics, enabled, dry_run, max_age_days, history: None }
    }

    pub fn with_history_log(mut self, history: HistoryLog) -> Self {
        self.history = Some(history);
        self
    }

    pub fn cutoff_seconds(&self, now_seconds: i64) -> i64 {
        let max_age = i64::try_from(self.max_age_days).unwrap_or(i64::MAX / SECONDS_PER_DAY);
        now_seconds.saturating_sub(max_age.saturating_mul(SECONDS_PER_DAY))
    }

    /// Returns `None` when retention is disabled.
    ///
    /// `dry_run_requested` forces a dry run even if the job is configured to delete.
    pub fn run_once(
        &self,
        now_seconds: i64,
        dry_run_requested: bool,
    ) -> anyhow::Result<Option<RetentionSummary>> {
        if !self.enabled {
            return Ok(None);
        }
        let dry_run = self.dry_run || dry_run_requested;
        let cutoff_seconds = self.cutoff_seconds(now_seconds);

        let events_deleted = self.store.delete_events_before(cutoff_seconds, dry_run)?;
        let notifications_deleted = self.store.delete_notifications_before(cutoff_seconds, dry_run)?;
        let log_lines_deleted = match self.history {
            Some(ref history) => history.delete_before(cutoff_seconds, dry_run)?,
            None => 0,
        };
        if !dry_run {
            self.metrics.record_history_deleted((events_deleted + notifications_deleted) as u64);
        }

        info!(
            cutoff = %cutoff_seconds,
            dry_run = %dry_run,
            events = %events_deleted,
            notifications = %notifications_deleted,
            log_lines = %log_lines_deleted,
            "retention_complete"
        );
        Ok(Some(RetentionSummary {
            cutoff_seconds,
            dry_run,
            events_deleted,
            notifications_deleted,
            log_lines_deleted,
        }))
    }

    pub async fn run(self, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            info!("retention_disabled");
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        info!(max_age_days = %self.max_age_days, dry_run = %self.dry_run, "retention_started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("retention_shutdown");
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(epoch_seconds(), false) {
                        error!(error = %format!("{e:#}"), "retention_failed");
                    }
                }
            }
        }
    }
}
