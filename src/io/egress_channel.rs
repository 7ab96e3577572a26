//! Typed channel for egress messages
//!
//! Provides a non-blocking way to hand event updates and alerts to the
//! MQTT publisher. Uses a bounded mpsc channel to prevent unbounded memory growth.

use crate::domain::notification::{DoorNotification, EventDataMessage};
use crate::domain::types::BuildTimestamp;
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Messages that can be sent to the publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Silent data update after the current event was saved or checked in
    EventUpdate(EventUpdatePayload),
    /// User-visible door-not-closed alert
    Notification(NotificationPayload),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUpdatePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub build_timestamp: BuildTimestamp,
    #[serde(flatten)]
    pub message: EventDataMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub build_timestamp: BuildTimestamp,
    #[serde(flatten)]
    pub notification: DoorNotification,
}

impl EgressMessage {
    /// Device topic the message is addressed to
    pub fn topic(&self) -> &str {
        match self {
            EgressMessage::EventUpdate(payload) => &payload.message.topic,
            EgressMessage::Notification(payload) => &payload.notification.topic,
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped and counted.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    /// Queue a data update. Injects site_id into the payload
    pub fn send_event_update(&self, build_timestamp: &BuildTimestamp, message: EventDataMessage) {
        self.send(EgressMessage::EventUpdate(EventUpdatePayload {
            site: Some(self.site_id.clone()),
            build_timestamp: build_timestamp.clone(),
            message,
        }));
    }

    /// Queue an alert. Injects site_id into the payload
    pub fn send_notification(
        &self,
        build_timestamp: &BuildTimestamp,
        notification: DoorNotification,
    ) {
        self.send(EgressMessage::Notification(NotificationPayload {
            site: Some(self.site_id.clone()),
            build_timestamp: build_timestamp.clone(),
            notification,
        }));
    }

    fn send(&self, msg: EgressMessage) {
        // Use try_send to avoid blocking - drop if channel full
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                self.metrics.record_egress_dropped();
                warn!(topic = %msg.topic(), "egress_dropped_channel_full");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_egress_dropped();
            }
        }
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// site_id is included in every payload for downstream consumers.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id, metrics), rx)
}
