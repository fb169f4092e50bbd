use std::collections::HashSet;
use std::env;
use std::time::Duration;

use tracing::warn;

use crate::policy::access::CardUid;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub bus: BusConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// I2C character device of the master, e.g. /dev/i2c-1.
    pub device: String,
    pub poll_interval: Duration,
    pub transact_timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
}

/// Thresholds and intervals for the policy layer. Everything here is fixed
/// for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub allow_list: HashSet<CardUid>,
    pub motion_timeout: Duration,
    pub distance_threshold_cm: f32,
    pub telemetry_interval: Duration,
    pub angles: DoorAngles,
}

#[derive(Debug, Clone, Copy)]
pub struct DoorAngles {
    pub closed: u8,
    pub open: u8,
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} environment variable is required"))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or_default(key, env::var(key).ok(), default)
}

fn parse_or_default<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring unparseable {}='{}', using the default", key, raw);
                default
            }
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let allow_list =
            parse_allow_list(&env_or_default("CARD_ALLOW_LIST", "DE:AD:BE:EF".to_string()))?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "iot".to_string()),
                client_id: env_or_default("MQTT_CLIENT_ID", "uno-to-mqtt".to_string()),
            },
            bus: BusConfig {
                device: env_or_default("BUS_DEVICE", "/dev/i2c-1".to_string()),
                poll_interval: Duration::from_millis(env_or_default("BUS_POLL_INTERVAL_MS", 250)),
                transact_timeout: Duration::from_millis(env_or_default(
                    "BUS_TRANSACT_TIMEOUT_MS",
                    100,
                )),
                retries: env_or_default("BUS_RETRIES", 2),
                retry_backoff: Duration::from_millis(env_or_default("BUS_RETRY_BACKOFF_MS", 25)),
            },
            control: ControlConfig {
                allow_list,
                motion_timeout: Duration::from_millis(env_or_default("PIR_TIMEOUT_MS", 7000)),
                distance_threshold_cm: env_or_default("INTRUDER_DISTANCE_CM", 50.0),
                telemetry_interval: Duration::from_millis(env_or_default(
                    "TELEMETRY_INTERVAL_MS",
                    2000,
                )),
                angles: DoorAngles {
                    closed: env_or_default("DOOR_CLOSED_ANGLE", 0),
                    open: env_or_default("DOOR_OPEN_ANGLE", 90),
                },
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup-only validation. Running with broken safety thresholds is worse
    /// than not running, so everything here is fatal.
    pub fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.bus.poll_interval.is_zero() {
            return Err("BUS_POLL_INTERVAL_MS must be > 0".into());
        }
        if self.bus.transact_timeout.is_zero() {
            return Err("BUS_TRANSACT_TIMEOUT_MS must be > 0".into());
        }
        if self.control.telemetry_interval.is_zero() {
            return Err("TELEMETRY_INTERVAL_MS must be > 0".into());
        }
        if self.control.motion_timeout.is_zero() {
            return Err("PIR_TIMEOUT_MS must be > 0".into());
        }
        if !(self.control.distance_threshold_cm > 0.0)
            || !self.control.distance_threshold_cm.is_finite()
        {
            return Err("INTRUDER_DISTANCE_CM must be a positive number".into());
        }
        let DoorAngles { closed, open } = self.control.angles;
        if closed > 180 || open > 180 {
            return Err("Door angles must be within 0..=180 degrees".into());
        }
        if closed == open {
            return Err("DOOR_CLOSED_ANGLE and DOOR_OPEN_ANGLE must differ".into());
        }
        Ok(())
    }

    pub fn data_topic(&self) -> String {
        format!("{}/sensors/data", self.mqtt.topic_prefix)
    }

    pub fn control_topic_filter(&self) -> String {
        format!("{}/control/#", self.mqtt.topic_prefix)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/bridge/status", self.mqtt.topic_prefix)
    }
}

/// Parse a comma-separated list of 4-byte UIDs, hex with optional colon
/// separators: "DE:AD:BE:EF" or "deadbeef". A malformed entry is fatal.
pub fn parse_allow_list(raw: &str) -> Result<HashSet<CardUid>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_uid)
        .collect()
}

fn parse_uid(entry: &str) -> Result<CardUid, String> {
    let hex: String = entry.chars().filter(|c| *c != ':').collect();
    if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("Card UID '{entry}' must be 8 hex digits (4 bytes)"));
    }
    let mut uid = [0u8; 4];
    for (i, byte) in uid.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| format!("Card UID '{entry}' contains invalid hex"))?;
    }
    Ok(uid)
}
