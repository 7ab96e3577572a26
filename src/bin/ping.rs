//! Door ping publisher
//!
//! Publishes door sensor pings the way the firmware does, for bench testing.
//!
//! Usage:
//!   cargo run --bin garage-ping -- --closed 0 --open 1            # door closed
//!   cargo run --bin garage-ping -- --closed 1 --open 1 --count 5  # moving, 5 pings

use anyhow::Context;
use clap::Parser;
use garage_monitor::domain::types::epoch_seconds;
use garage_monitor::infra::Config;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "garage-ping")]
#[command(about = "Publish door sensor pings to the monitor's MQTT topic")]
struct Args {
    /// Path to TOML configuration file (broker and topic)
    #[arg(short, long)]
    config: Option<String>,

    /// Device key sent as `buildTimestamp`
    #[arg(short, long, default_value = "Sat Mar 13 14:45:00 2021")]
    build_timestamp: String,

    /// Closed-position sensor (`sensorA`): "0" confirmed, "1" not
    #[arg(long, default_value = "0")]
    closed: String,

    /// Open-position sensor (`sensorB`): "0" confirmed, "1" not
    #[arg(long, default_value = "1")]
    open: String,

    /// Publish topic, defaults to the configured ingest topic
    #[arg(short, long)]
    topic: Option<String>,

    /// Include `timestampSeconds` in the ping instead of letting the monitor stamp it
    #[arg(long)]
    stamp: bool,

    /// Number of pings to send
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Delay between pings
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()));

    let topic = args.topic.clone().unwrap_or_else(|| config.mqtt_topic().to_string());
    if topic.contains(['+', '#']) {
        anyhow::bail!("configured topic {topic:?} is a filter, pass --topic");
    }

    let client_id = format!("garage-ping-{}", std::process::id());
    let mut mqtt_options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqtt_options.set_keep_alive(Duration::from_secs(10));
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqtt_options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

    for i in 0..args.count {
        let mut ping = json!({
            "buildTimestamp": args.build_timestamp,
            "sensorA": args.closed,
            "sensorB": args.open,
        });
        if args.stamp {
            ping["timestampSeconds"] = json!(epoch_seconds());
        }
        client
            .publish(&topic, QoS::AtLeastOnce, false, ping.to_string())
            .await
            .context("failed to queue ping")?;

        wait_for_puback(&mut eventloop).await?;
        info!(topic = %topic, seq = %(i + 1), payload = %ping, "ping_published");

        if i + 1 < args.count {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    client.disconnect().await.ok();
    Ok(())
}

async fn wait_for_puback(eventloop: &mut rumqttc::EventLoop) -> anyhow::Result<()> {
    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt_error");
                    return Err(anyhow::Error::new(e).context("broker connection failed"));
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .context("timed out waiting for broker acknowledgement")?
}
