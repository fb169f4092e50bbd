use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::state::Snapshot;

use super::RemoteCommand;

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: Config,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(std::time::Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        // LWT so the server's `online` flag drops when the bridge dies.
        let lwt = rumqttc::LastWill::new(
            config.status_topic(),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            config: config.clone(),
        }
    }

    /// Run the MQTT event loop. Subscribes to the control topics on connect,
    /// forwards parsed remote commands through command_tx, and publishes the
    /// state snapshots received from snapshot_rx. Publishing is best-effort:
    /// a failed or unparseable message is logged and dropped, never retried,
    /// since the next snapshot supersedes it anyway.
    pub async fn run(
        mut self,
        command_tx: mpsc::Sender<RemoteCommand>,
        mut snapshot_rx: mpsc::Receiver<Snapshot>,
    ) {
        let data_topic = self.config.data_topic();
        let control_filter = self.config.control_topic_filter();
        let prefix = self.config.mqtt.topic_prefix.clone();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");

                            if let Err(e) = self
                                .client
                                .publish(self.config.status_topic(), QoS::AtLeastOnce, true, "online")
                                .await
                            {
                                error!("Failed to publish online status: {}", e);
                            }
                            if let Err(e) = self
                                .client
                                .subscribe(&control_filter, QoS::AtLeastOnce)
                                .await
                            {
                                error!("Failed to subscribe to {}: {}", control_filter, e);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let payload = String::from_utf8_lossy(&publish.payload);
                            match parse_command(&publish.topic, &payload, &prefix) {
                                Some(cmd) => {
                                    info!("Remote command: {:?}", cmd);
                                    if command_tx.send(cmd).await.is_err() {
                                        warn!("Command channel closed");
                                    }
                                }
                                None => {
                                    warn!("Ignoring message on {}: {}", publish.topic, payload);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(snapshot) = snapshot_rx.recv() => {
                    let payload = match serde_json::to_string(&snapshot) {
                        Ok(p) => p,
                        Err(e) => {
                            error!("Failed to serialize snapshot: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self
                        .client
                        .publish(&data_topic, QoS::AtMostOnce, false, payload)
                        .await
                    {
                        warn!("Dropping telemetry tick: {}", e);
                    }
                }
            }
        }
    }
}

/// Parse a control topic + payload into a remote command.
/// Expected topics: {prefix}/control/{door|led2|security}
pub fn parse_command(topic: &str, payload: &str, prefix: &str) -> Option<RemoteCommand> {
    let target = topic
        .strip_prefix(prefix)?
        .strip_prefix('/')?
        .strip_prefix("control/")?;

    let payload = payload.trim();
    match target {
        "door" => match payload.to_ascii_uppercase().as_str() {
            "OPEN" => Some(RemoteCommand::Door(true)),
            "CLOSE" => Some(RemoteCommand::Door(false)),
            _ => None,
        },
        "led2" => switch_state(payload).map(RemoteCommand::LedButton),
        "security" => switch_state(payload).map(RemoteCommand::SecurityMode),
        _ => None,
    }
}

fn switch_state(payload: &str) -> Option<bool> {
    match payload.to_ascii_uppercase().as_str() {
        "ON" | "TRUE" | "1" => Some(true),
        "OFF" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}
