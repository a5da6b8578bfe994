use std::collections::HashMap;

use rumqttc::{QoS, SubscribeFilter};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::SyncError;
use crate::telemetry::{LED_COUNT, SensorReading, StateUpdate};

/// What a topic feeds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicBinding {
    /// JSON document with `temp`, `humi`, `pot` and optionally `relay`.
    Sensors,
    /// Short text sentinel for the relay.
    RelayStatus,
    /// `"1"` / anything else for LED `index`.
    Led(usize),
}

/// Accepted spellings of the relay "on" and "off" sentinels. Matching is
/// case-insensitive and ignores surrounding whitespace.
#[derive(Debug, Clone)]
pub struct RelaySentinels {
    on: Vec<String>,
    off: Vec<String>,
}

impl Default for RelaySentinels {
    fn default() -> Self {
        Self::new(["on", "post 3200 on"], ["off", "post 3200 off"])
    }
}

impl RelaySentinels {
    pub fn new<I, J, S, T>(on: I, off: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            on: normalize_all(on),
            off: normalize_all(off),
        }
    }

    pub fn is_on(&self, payload: &str) -> bool {
        let p = payload.trim().to_lowercase();
        self.on.iter().any(|s| *s == p)
    }

    pub fn is_known(&self, payload: &str) -> bool {
        let p = payload.trim().to_lowercase();
        self.on.iter().chain(self.off.iter()).any(|s| *s == p)
    }

    pub fn on_forms(&self) -> &[String] {
        &self.on
    }
}

fn normalize_all<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// The static topic table. Ingest and command paths both resolve topic
/// names through this one table so they cannot drift apart.
#[derive(Debug, Clone)]
pub struct TopicBindings {
    sensor_topic: String,
    relay_topic: String,
    led_topics: [String; LED_COUNT],
    routes: HashMap<String, TopicBinding>,
    sentinels: RelaySentinels,
    scale_divisor: f64,
}

impl TopicBindings {
    /// `{prefix}/input`, `{prefix}/output` and `{prefix}/led1`..`{prefix}/led8`.
    pub fn new(prefix: &str, sentinels: RelaySentinels, scale_divisor: f64) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let sensor_topic = format!("{prefix}/input");
        let relay_topic = format!("{prefix}/output");
        let led_topics: [String; LED_COUNT] =
            std::array::from_fn(|i| format!("{prefix}/led{}", i + 1));

        let mut routes = HashMap::new();
        routes.insert(sensor_topic.clone(), TopicBinding::Sensors);
        routes.insert(relay_topic.clone(), TopicBinding::RelayStatus);
        for (i, topic) in led_topics.iter().enumerate() {
            routes.insert(topic.clone(), TopicBinding::Led(i));
        }

        Self {
            sensor_topic,
            relay_topic,
            led_topics,
            routes,
            sentinels,
            scale_divisor,
        }
    }

    pub fn route(&self, topic: &str) -> Option<TopicBinding> {
        self.routes.get(topic).copied()
    }

    pub fn led_topic(&self, index: usize) -> Option<&str> {
        self.led_topics.get(index).map(String::as_str)
    }

    pub fn sensor_topic(&self) -> &str {
        &self.sensor_topic
    }

    pub fn relay_topic(&self) -> &str {
        &self.relay_topic
    }

    /// Every bound topic, for one SUBSCRIBE request.
    pub fn subscriptions(&self, qos: QoS) -> Vec<SubscribeFilter> {
        std::iter::once(&self.sensor_topic)
            .chain(std::iter::once(&self.relay_topic))
            .chain(self.led_topics.iter())
            .map(|t| SubscribeFilter::new(t.clone(), qos))
            .collect()
    }

    /// Decode a payload according to its topic's binding. `Ok(None)` means
    /// the topic is not bound and the message should be ignored.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<StateUpdate>, SyncError> {
        let Some(binding) = self.route(topic) else {
            return Ok(None);
        };
        let update = match binding {
            TopicBinding::Sensors => {
                StateUpdate::Sensors(decode_sensor_document(topic, payload, self.scale_divisor)?)
            }
            TopicBinding::RelayStatus => {
                let text = String::from_utf8_lossy(payload);
                if !self.sentinels.is_known(&text) {
                    warn!(
                        "Unrecognized relay sentinel {:?} on {} (accepted on-forms: {:?}); treating as off",
                        text.trim(),
                        topic,
                        self.sentinels.on_forms()
                    );
                }
                StateUpdate::Relay(self.sentinels.is_on(&text))
            }
            TopicBinding::Led(index) => StateUpdate::Led {
                index,
                on: led_flag(payload),
            },
        };
        Ok(Some(update))
    }
}

pub fn led_payload(on: bool) -> &'static str {
    if on { "1" } else { "0" }
}

fn led_flag(payload: &[u8]) -> bool {
    payload.trim_ascii() == b"1"
}

/// Parse a sensor document. Any malformed field rejects the whole document
/// so that a bad message never half-applies.
fn decode_sensor_document(
    topic: &str,
    payload: &[u8],
    scale_divisor: f64,
) -> Result<SensorReading, SyncError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| SyncError::decode(topic, e))?;
    let Value::Object(doc) = value else {
        return Err(SyncError::decode(topic, "expected a JSON object"));
    };

    let field = |name: &str| doc.get(name).filter(|v| !v.is_null());

    let temperature = field("temp")
        .map(|v| number_field(topic, "temp", v))
        .transpose()?
        .map(|t| t / scale_divisor);
    let humidity = field("humi")
        .map(|v| number_field(topic, "humi", v))
        .transpose()?
        .map(|h| h / scale_divisor);
    let potentiometer = pot_field(topic, &doc)?;
    let relay = field("relay").map(|v| bool_field(topic, v)).transpose()?;

    Ok(SensorReading {
        temperature,
        humidity,
        potentiometer,
        relay,
    })
}

fn pot_field(topic: &str, doc: &Map<String, Value>) -> Result<Option<i64>, SyncError> {
    let Some((name, v)) = ["pot", "rotary"]
        .into_iter()
        .find_map(|name| doc.get(name).filter(|v| !v.is_null()).map(|v| (name, v)))
    else {
        return Ok(None);
    };
    if let Some(n) = v.as_i64() {
        return Ok(Some(n));
    }
    number_field(topic, name, v).map(|f| Some(f as i64))
}

fn number_field(topic: &str, name: &str, v: &Value) -> Result<f64, SyncError> {
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|f| f.is_finite())
        .ok_or_else(|| SyncError::decode(topic, format!("field {name} is not a number: {v}")))
}

fn bool_field(topic: &str, v: &Value) -> Result<bool, SyncError> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        other => Err(SyncError::decode(
            topic,
            format!("field relay is not a boolean: {other}"),
        )),
    }
}
