mod bus;
mod config;
mod mqtt;
mod policy;
mod state;

use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use bus::client::{BusClient, RetryPolicy};
use bus::{BusEvent, CommandMessage, I2cTransport};
use mqtt::RemoteCommand;
use policy::{AccessControlPolicy, SafetyPolicy};
use state::StateAggregator;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting uno-to-mqtt bridge (mqtt={}:{}, bus={}, {} allowed cards)",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.bus.device,
        config.control.allow_list.len(),
    );
    if config.control.allow_list.is_empty() {
        warn!("Card allow-list is empty; door control is buttons and remote only");
    }

    let i2c = match linux_embedded_hal::I2cdev::new(&config.bus.device) {
        Ok(dev) => dev,
        Err(e) => {
            error!("Failed to open bus device {}: {}", config.bus.device, e);
            std::process::exit(1);
        }
    };

    // Channels
    let (bus_event_tx, mut bus_event_rx) = mpsc::channel::<BusEvent>(100);
    let (bus_cmd_tx, bus_cmd_rx) = mpsc::channel::<CommandMessage>(50);
    let (remote_tx, mut remote_rx) = mpsc::channel::<RemoteCommand>(50);
    let (snapshot_tx, snapshot_rx) = mpsc::channel::<state::Snapshot>(8);

    // MQTT event loop task (telemetry out, remote commands in)
    let mqtt_client = mqtt::client::MqttClient::new(&config);
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(remote_tx, snapshot_rx).await;
    });

    // Bus task: sole owner of the I2C transport
    let retry = RetryPolicy {
        transact_timeout: config.bus.transact_timeout,
        retries: config.bus.retries,
        backoff: config.bus.retry_backoff,
    };
    let bus_client = BusClient::new(I2cTransport::new(i2c), retry);
    let poll_interval = config.bus.poll_interval;
    let bus_handle = tokio::spawn(async move {
        bus_client.run(bus_event_tx, bus_cmd_rx, poll_interval).await;
    });

    let mut aggregator = StateAggregator::new(
        AccessControlPolicy::new(config.control.allow_list.clone()),
        SafetyPolicy::new(
            config.control.motion_timeout,
            config.control.distance_threshold_cm,
        ),
        config.control.angles,
    );

    // Telemetry runs on its own clock, independent of the sampling cadence.
    // A missed tick is dropped, not replayed: state is resent fresh anyway.
    let mut telemetry = tokio::time::interval(config.control.telemetry_interval);
    telemetry.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Control loop: merge bus events and remote commands into the aggregator,
    // forward the resulting board commands + handle shutdown.
    loop {
        tokio::select! {
            Some(event) = bus_event_rx.recv() => {
                for cmd in aggregator.apply_event(event, Instant::now()) {
                    if bus_cmd_tx.send(cmd).await.is_err() {
                        warn!("Bus command channel closed");
                    }
                }
            }
            Some(remote) = remote_rx.recv() => {
                for cmd in aggregator.apply_remote(remote) {
                    if bus_cmd_tx.send(cmd).await.is_err() {
                        warn!("Bus command channel closed");
                    }
                }
            }
            _ = telemetry.tick() => {
                // a full channel means the uplink is stalled; never block on it
                if snapshot_tx.try_send(aggregator.snapshot()).is_err() {
                    warn!("Telemetry channel full, dropping snapshot");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    bus_handle.abort();
    mqtt_handle.abort();
    info!("uno-to-mqtt bridge stopped");
}
