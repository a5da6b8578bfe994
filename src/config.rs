use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::camera::FrameValidation;
use crate::error::{Error, Result};
use crate::mqtt::topics::{RelaySentinels, TopicBindings};

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub telemetry: TelemetryConfig,
    /// `None` when `CAMERA_URL` is unset.
    pub camera: Option<CameraConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: BrokerAddress,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub topic_prefix: String,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub relay_on_sentinels: Vec<String>,
    pub relay_off_sentinels: Vec<String>,
    /// Firmware that reports tenths of a degree / percent uses 10.
    pub sensor_scale_divisor: f64,
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub url: String,
    pub read_timeout: Duration,
    pub retry_delay: Duration,
    pub queue_depth: usize,
    pub max_frame_bytes: usize,
    pub validation: FrameValidation,
}

impl CameraConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            read_timeout: Duration::from_secs(20),
            retry_delay: Duration::from_secs(5),
            queue_depth: 2,
            max_frame_bytes: 4 * 1024 * 1024,
            validation: FrameValidation::Header,
        }
    }
}

fn env_required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::Config(format!("{key} environment variable is required")))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or_default(key, default))
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env_optional(key) {
        Some(v) => split_list(&v),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let camera = match env_optional("CAMERA_URL") {
            Some(url) => Some(CameraConfig {
                url,
                read_timeout: env_secs("CAMERA_READ_TIMEOUT_SECS", 20),
                retry_delay: env_secs("CAMERA_RETRY_SECS", 5),
                queue_depth: env_or_default("CAMERA_QUEUE_DEPTH", 2),
                max_frame_bytes: env_or_default("CAMERA_MAX_FRAME_BYTES", 4 * 1024 * 1024),
                validation: match env_optional("CAMERA_VALIDATION") {
                    Some(v) => v.parse()?,
                    None => FrameValidation::Header,
                },
            }),
            None => None,
        };

        let config = Self {
            mqtt: MqttConfig {
                broker: BrokerAddress {
                    host: env_required("MQTT_BROKER_HOST")?,
                    port: env_or_default("MQTT_BROKER_PORT", 1883),
                },
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                client_id: env_or_default("MQTT_CLIENT_ID", "dashlink".to_string()),
                keep_alive: env_secs("MQTT_KEEP_ALIVE_SECS", 60),
                connect_timeout: env_secs("MQTT_CONNECT_TIMEOUT_SECS", 10),
                reconnect_delay: env_secs("MQTT_RECONNECT_SECS", 5),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "arduino".to_string()),
            },
            telemetry: TelemetryConfig {
                relay_on_sentinels: env_list("RELAY_ON_SENTINELS", &["on", "post 3200 on"]),
                relay_off_sentinels: env_list("RELAY_OFF_SENTINELS", &["off", "post 3200 off"]),
                sensor_scale_divisor: env_or_default("SENSOR_SCALE_DIVISOR", 1.0),
            },
            camera,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> { Err(Error::Config(msg.to_string())) };

        if self.mqtt.broker.host.is_empty() {
            return invalid("MQTT_BROKER_HOST must not be empty");
        }
        if self.mqtt.keep_alive < Duration::from_secs(1) {
            return invalid("MQTT_KEEP_ALIVE_SECS must be >= 1");
        }
        if self.mqtt.connect_timeout.is_zero() {
            return invalid("MQTT_CONNECT_TIMEOUT_SECS must be > 0");
        }
        if self.mqtt.reconnect_delay.is_zero() {
            return invalid("MQTT_RECONNECT_SECS must be > 0");
        }
        if self.mqtt.topic_prefix.trim_matches('/').is_empty() {
            return invalid("MQTT_TOPIC_PREFIX must not be empty");
        }
        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            return invalid("MQTT_USERNAME and MQTT_PASSWORD must be set together");
        }
        if self.telemetry.relay_on_sentinels.is_empty() {
            return invalid("RELAY_ON_SENTINELS must list at least one value");
        }
        let divisor = self.telemetry.sensor_scale_divisor;
        if !divisor.is_finite() || divisor == 0.0 {
            return invalid("SENSOR_SCALE_DIVISOR must be a finite, non-zero number");
        }
        if let Some(camera) = &self.camera {
            camera.validate()?;
        }
        Ok(())
    }

    /// The topic table shared by the ingest and command paths.
    pub fn topic_bindings(&self) -> TopicBindings {
        TopicBindings::new(
            &self.mqtt.topic_prefix,
            RelaySentinels::new(
                &self.telemetry.relay_on_sentinels,
                &self.telemetry.relay_off_sentinels,
            ),
            self.telemetry.sensor_scale_divisor,
        )
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(Error::Config(msg)) };

        match reqwest::Url::parse(&self.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => return invalid(format!("CAMERA_URL scheme {} is not http(s)", url.scheme())),
            Err(e) => return invalid(format!("CAMERA_URL is not a valid URL: {e}")),
        }
        if self.read_timeout.is_zero() {
            return invalid("CAMERA_READ_TIMEOUT_SECS must be > 0".into());
        }
        if self.retry_delay.is_zero() {
            return invalid("CAMERA_RETRY_SECS must be > 0".into());
        }
        if !(1..=16).contains(&self.queue_depth) {
            return invalid(format!("CAMERA_QUEUE_DEPTH must be 1..=16, got {}", self.queue_depth));
        }
        if self.max_frame_bytes < 1024 {
            return invalid("CAMERA_MAX_FRAME_BYTES must be >= 1024".into());
        }
        Ok(())
    }
}
