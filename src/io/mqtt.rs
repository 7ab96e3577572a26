//! MQTT client for receiving door sensor pings

use crate::domain::types::{
    epoch_seconds, BuildTimestamp, SensorPing, SensorSnapshot, TimestampValue,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::door_alerts::SnoozeCommand;
use crate::services::event_updater::IngestEvent;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Start the MQTT client and send parsed pings to the channel
///
/// Pings are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped pings are counted in metrics and logged (rate-limited).
/// With `snooze_tx` set, client snooze requests on `<prefix>/snooze/#` are
/// forwarded the same way.
pub async fn start_mqtt_client(
    config: &Config,
    ping_tx: mpsc::Sender<IngestEvent>,
    snooze_tx: Option<mpsc::Sender<SnoozeCommand>>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_id = format!("{}-ingest", config.site_id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_topic(), QoS::AtLeastOnce).await?;

    info!(topic = %config.mqtt_topic(), host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_subscribed");

    let snooze_filter = config.snooze_topic_filter();
    if snooze_tx.is_some() {
        client.subscribe(snooze_filter.as_str(), QoS::AtLeastOnce).await?;
        info!(topic = %snooze_filter, "mqtt_snooze_subscribed");
    }

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(json_str) = std::str::from_utf8(&publish.payload) else {
                            metrics.record_ping_ignored();
                            warn!(topic = %publish.topic, "ping_invalid_utf8");
                            continue;
                        };

                        if let Some(ref tx) = snooze_tx {
                            if is_snooze_topic(&publish.topic, &snooze_filter) {
                                if let Some(command) = parse_snooze_request(json_str) {
                                    if tx.try_send(command).is_err() {
                                        warn!(topic = %publish.topic, "snooze_request_dropped");
                                    }
                                }
                                continue;
                            }
                        }

                        let Some(ping) = parse_ping(json_str, epoch_seconds()) else {
                            metrics.record_ping_ignored();
                            continue;
                        };

                        debug!(
                            build_timestamp = %ping.build_timestamp,
                            closed = %ping.snapshot.closed.as_str(),
                            open = %ping.snapshot.open.as_str(),
                            "ping_received"
                        );
                        if !forward_ping(&ping_tx, ping, &metrics, &mut last_drop_warn) {
                            return Ok(());
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// Hand a ping to the updater. Each ping is counted once: received when
/// queued, ignored when the queue is full. Returns false once the channel is
/// closed.
fn forward_ping(
    ping_tx: &mpsc::Sender<IngestEvent>,
    ping: IngestEvent,
    metrics: &Metrics,
    last_drop_warn: &mut Instant,
) -> bool {
    match ping_tx.try_send(ping) {
        Ok(()) => {
            metrics.record_ping_received();
            true
        }
        Err(TrySendError::Full(_)) => {
            metrics.record_ping_ignored();
            if last_drop_warn.elapsed() > Duration::from_secs(1) {
                warn!("ping_dropped_channel_full");
                *last_drop_warn = Instant::now();
            }
            true
        }
        Err(TrySendError::Closed(_)) => {
            warn!("ping_channel_closed");
            false
        }
    }
}

fn is_snooze_topic(topic: &str, filter: &str) -> bool {
    filter.strip_suffix('#').is_some_and(|prefix| topic.starts_with(prefix))
}

/// Parse a snooze request: `{buildTimestamp, eventTimestampSeconds, duration}`
pub fn parse_snooze_request(json_str: &str) -> Option<SnoozeCommand> {
    match serde_json::from_str::<SnoozeCommand>(json_str) {
        Ok(command) if !command.build_timestamp.as_str().is_empty() => Some(command),
        Ok(_) => {
            warn!("snooze_ignored_missing_build_timestamp");
            None
        }
        Err(e) => {
            warn!(error = %e, "snooze_parse_failed");
            None
        }
    }
}

/// Parse a ping payload.
///
/// Events are always stamped with `received_at_seconds`. A device clock may
/// lag or be unset, and an event must never start before the one it follows.
/// The device's own timestamp is only logged.
pub fn parse_ping(json_str: &str, received_at_seconds: i64) -> Option<IngestEvent> {
    let ping: SensorPing = match serde_json::from_str(json_str) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "ping_parse_failed");
            return None;
        }
    };

    let Some(build_timestamp) = ping.build_timestamp.filter(|bt| !bt.is_empty()) else {
        warn!("ping_ignored_missing_build_timestamp");
        return None;
    };

    if let Some(device_seconds) = timestamp_to_epoch_seconds(&ping.timestamp_seconds) {
        debug!(
            build_timestamp = %build_timestamp,
            device_timestamp = %device_seconds,
            skew_seconds = %(received_at_seconds - device_seconds),
            "ping_device_timestamp"
        );
    }

    let snapshot = SensorSnapshot::from_raw(
        ping.sensor_a.as_deref().unwrap_or(""),
        ping.sensor_b.as_deref().unwrap_or(""),
        received_at_seconds,
    );

    Some(IngestEvent { build_timestamp: BuildTimestamp::new(build_timestamp), snapshot })
}

/// Parse an RFC 3339 timestamp to epoch seconds
fn parse_iso_time(time_str: &str) -> Option<i64> {
    OffsetDateTime::parse(time_str, &Rfc3339).ok().map(|dt| dt.unix_timestamp())
}

fn timestamp_to_epoch_seconds(ts: &TimestampValue) -> Option<i64> {
    match ts {
        TimestampValue::EpochSeconds(seconds) => Some(*seconds),
        TimestampValue::IsoString(s) => parse_iso_time(s),
        TimestampValue::None => None,
    }
}
