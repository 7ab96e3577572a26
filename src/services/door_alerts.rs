//! Door-not-closed alerts
//!
//! Periodically checks every known device. When the current event is old
//! (not closed for over 15 minutes) one alert is sent per event; a snooze on
//! that event withholds it until the snooze expires.
//!
//! Snooze requests arrive over MQTT as [`SnoozeCommand`]s and are applied on
//! the same task as the checks.

use crate::domain::notification::{door_not_closed_notification, is_event_old, DoorNotification};
use crate::domain::snooze::{snooze_status, SnoozeRequest, SnoozeStatus};
use crate::domain::types::{epoch_seconds, BuildTimestamp};
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressSender;
use crate::io::history_log::HistoryLog;
use crate::services::store::{DoorStore, NotificationRecord};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Client request to silence the alert for one event
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnoozeCommand {
    pub build_timestamp: BuildTimestamp,
    pub event_timestamp_seconds: i64,
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertOutcome {
    NoEvent,
    NotOld,
    /// Old event in a state that never alerts
    NoNotification,
    /// An alert for this event was already sent
    AlreadySent,
    Snoozed,
    Sent(DoorNotification),
}

pub struct DoorAlertChecker {
    store: Arc<dyn DoorStore>,
    metrics: Arc<Metrics>,
    egress: Option<EgressSender>,
    history: Option<HistoryLog>,
    snooze_enabled: bool,
}

impl DoorAlertChecker {
    pub fn new(store: Arc<dyn DoorStore>, metrics: Arc<Metrics>, snooze_enabled: bool) -> Self {
        Self { store, metrics, egress: None, history: None, snooze_enabled }
    }

    pub fn with_egress(mut self, egress: EgressSender) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn with_history_log(mut self, history: HistoryLog) -> Self {
        self.history = Some(history);
        self
    }

    pub fn check_device(
        &self,
        build_timestamp: &BuildTimestamp,
        now_seconds: i64,
    ) -> anyhow::Result<AlertOutcome> {
        let Some(current) = self.store.current_event(build_timestamp)? else {
            return Ok(AlertOutcome::NoEvent);
        };
        let event = current.current_event;
        if !is_event_old(&event, now_seconds) {
            return Ok(AlertOutcome::NotOld);
        }
        let Some(notification) = door_not_closed_notification(build_timestamp, &event, now_seconds)
        else {
            return Ok(AlertOutcome::NoNotification);
        };

        if let Some(last) = self.store.last_notification(build_timestamp)? {
            if last.notified_event.timestamp_seconds == event.timestamp_seconds {
                self.metrics.record_notification_suppressed();
                return Ok(AlertOutcome::AlreadySent);
            }
        }

        if self.snooze_enabled {
            let snooze = self.store.snooze(build_timestamp)?;
            if snooze_status(snooze.as_ref(), Some(&event), now_seconds) == SnoozeStatus::Active {
                self.metrics.record_notification_suppressed();
                debug!(build_timestamp = %build_timestamp, state = %event.state, "door_alert_snoozed");
                return Ok(AlertOutcome::Snoozed);
            }
        }

        let record = NotificationRecord {
            build_timestamp: build_timestamp.clone(),
            notified_event: event,
            notification: notification.clone(),
        };
        self.store.save_notification(record.clone(), now_seconds)?;
        if let Some(ref history) = self.history {
            history.write_notification(&record, now_seconds);
        }
        if let Some(ref egress) = self.egress {
            egress.send_notification(build_timestamp, notification.clone());
        }

        self.metrics.record_notification_sent();
        info!(
            build_timestamp = %build_timestamp,
            state = %record.notified_event.state,
            title = %notification.title,
            body = %notification.body,
            "door_alert_sent"
        );
        Ok(AlertOutcome::Sent(notification))
    }

    /// Check every device; a failing device does not stop the others
    pub fn check_all(&self, now_seconds: i64) -> anyhow::Result<Vec<(BuildTimestamp, AlertOutcome)>> {
        let devices = self.store.devices()?;
        let mut outcomes = Vec::with_capacity(devices.len());
        for build_timestamp in devices {
            match self.check_device(&build_timestamp, now_seconds) {
                Ok(outcome) => outcomes.push((build_timestamp, outcome)),
                Err(e) => {
                    error!(
                        build_timestamp = %build_timestamp,
                        error = %format!("{e:#}"),
                        "door_alert_check_failed"
                    );
                }
            }
        }
        Ok(outcomes)
    }

    /// Record a client snooze for the device's current event
    pub fn snooze(
        &self,
        build_timestamp: &BuildTimestamp,
        event_timestamp_seconds: i64,
        duration: &str,
        now_seconds: i64,
    ) -> anyhow::Result<SnoozeRequest> {
        let current = self.store.current_event(build_timestamp)?;
        let request = SnoozeRequest::submit(
            current.as_ref().map(|record| &record.current_event),
            event_timestamp_seconds,
            duration,
            now_seconds,
        )?;
        self.store.save_snooze(build_timestamp, request.clone(), now_seconds)?;
        info!(
            build_timestamp = %build_timestamp,
            duration = %request.snooze_duration,
            until = %request.snooze_end_time_seconds,
            "door_alert_snooze_saved"
        );
        Ok(request)
    }

    /// Apply a snooze received from a client. Failures are logged and
    /// returned as `None`.
    pub fn apply_snooze(&self, command: &SnoozeCommand, now_seconds: i64) -> Option<SnoozeRequest> {
        match self.snooze(
            &command.build_timestamp,
            command.event_timestamp_seconds,
            &command.duration,
            now_seconds,
        ) {
            Ok(request) => Some(request),
            Err(e) => {
                warn!(
                    build_timestamp = %command.build_timestamp,
                    event_timestamp = %command.event_timestamp_seconds,
                    duration = %command.duration,
                    error = %format!("{e:#}"),
                    "door_alert_snooze_rejected"
                );
                None
            }
        }
    }

    pub async fn run(
        self,
        interval_secs: u64,
        mut snooze_rx: mpsc::Receiver<SnoozeCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        let mut snooze_open = true;
        info!(interval_secs = %interval_secs, snooze = %self.snooze_enabled, "door_alerts_started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("door_alerts_shutdown");
                        return;
                    }
                }
                command = snooze_rx.recv(), if snooze_open => {
                    match command {
                        Some(command) => {
                            self.apply_snooze(&command, epoch_seconds());
                        }
                        None => snooze_open = false,
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.check_all(epoch_seconds()) {
                        error!(error = %format!("{e:#}"), "door_alerts_failed");
                    }
                }
            }
        }
    }
}
