//! MQTT subscriber – forwards door sensor messages to the event worker.
//!
//! The subscription is re-issued on every connection acknowledgement, so a
//! broker restart with a clean session does not silently drop the feed.
//! Reconnecting is left to `rumqttc`: polling the event loop again after
//! an error starts a new connection attempt.

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use doorcap_common::config::Config;
use doorcap_common::signal::DoorSignal;

/// Pause between reconnection attempts.
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(&config.mqtt_client_id, &config.mqtt_host, config.mqtt_port);
    options.set_keep_alive(Duration::from_secs(60));
    if let (Some(user), Some(pass)) = (&config.mqtt_username, &config.mqtt_password) {
        options.set_credentials(user, pass);
    }
    options
}

/// Decode a publish received under the `filter` subscription.
fn door_signal(filter: &str, publish: &Publish) -> Option<DoorSignal> {
    if !rumqttc::matches(&publish.topic, filter) {
        debug!("Ignoring message on unrelated topic {}", publish.topic);
        return None;
    }
    let signal = DoorSignal::from_payload(&publish.payload);
    if signal.is_none() {
        debug!(
            "Ignoring payload {:?} on {}",
            String::from_utf8_lossy(&publish.payload),
            publish.topic
        );
    }
    signal
}

/// Connect to the broker and feed door signals into `signals`.
///
/// Returns once the worker side of `signals` has gone away.
pub async fn run(config: &Config, signals: mpsc::Sender<DoorSignal>) -> Result<()> {
    info!(
        "Starting to connect to {}:{} (topic {})",
        config.mqtt_host, config.mqtt_port, config.mqtt_topic
    );
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), 10);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT with result code {:?}", ack.code);
                client
                    .subscribe(&config.mqtt_topic, QoS::AtLeastOnce)
                    .await
                    .with_context(|| format!("Cannot subscribe to {}", config.mqtt_topic))?;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(signal) = door_signal(&config.mqtt_topic, &publish) else {
                    continue;
                };
                debug!("Received {signal} on {}", publish.topic);
                if signals.send(signal).await.is_err() {
                    info!("Event worker stopped, leaving MQTT loop");
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {e}; retrying in {}s", RECONNECT_PAUSE.as_secs());
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
}
