//! MQTT publisher for egress messages
//!
//! Publishes to per-device topics for the mobile clients and any bridge
//! forwarding to a push service:
//! - `<prefix>/events/<device topic>` - current event data (QoS 1, retained)
//! - `<prefix>/notifications/<device topic>` - door-not-closed alerts (QoS 1)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub fn event_topic(prefix: &str, device_topic: &str) -> String {
    format!("{prefix}/events/{device_topic}")
}

pub fn notification_topic(prefix: &str, device_topic: &str) -> String {
    format!("{prefix}/notifications/{device_topic}")
}

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    topic_prefix: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("{}-egress-{}", config.site_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic_prefix: config.mqtt_egress_topic_prefix().to_string() }
    }

    /// Run the publisher loop until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.topic_prefix, "mqtt_egress_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                Some(msg) = self.rx.recv() => {
                    self.publish_message(msg).await;
                }
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        let (topic, retain, json) = match &msg {
            EgressMessage::EventUpdate(payload) => (
                event_topic(&self.topic_prefix, &payload.message.topic),
                // Late subscribers get the current state
                true,
                serde_json::to_string(payload),
            ),
            EgressMessage::Notification(payload) => (
                notification_topic(&self.topic_prefix, &payload.notification.topic),
                false,
                serde_json::to_string(payload),
            ),
        };

        let json = match json {
            Ok(json) => json,
            Err(e) => {
                error!(topic = %topic, error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };

        if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, retain, json.into_bytes()).await {
            error!(topic = %topic, error = %e, "mqtt_egress_publish_failed");
        } else {
            debug!(topic = %topic, "mqtt_egress_published");
        }
    }
}
