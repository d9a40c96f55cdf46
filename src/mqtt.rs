// MIT License - Copyright (c) 2021 TJForc
// MQTT topics, payloads and publishing

use std::collections::HashSet;

use rumqttc::{AsyncClient, ClientError, QoS};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::attribute::{AttributeState, AttributeValue, ValueKind};
use crate::config::Attribute;
use crate::constants::MANUFACTURER;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

const DISCOVERY_PREFIX: &str = "homeassistant";
const ORIGIN_NAME: &str = "Tesira2MQTT";
const LEVEL_STEP: f64 = 0.1;
const LEVEL_UNIT: &str = "dB";

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub fn availability_topic(base: &str) -> String {
    format!("{base}/availability")
}

pub fn state_topic(base: &str, identifier: &str) -> String {
    format!("{base}/{identifier}/state")
}

pub fn attributes_topic(base: &str, identifier: &str) -> String {
    format!("{base}/{identifier}/attributes")
}

pub fn command_topic(base: &str, identifier: &str) -> String {
    format!("{base}/{identifier}/set")
}

/// Filter matching every command topic under `base`.
pub fn command_filter(base: &str) -> String {
    format!("{base}/+/set")
}

/// Extract the identifier from `{base}/{identifier}/set`.
pub fn identifier_from_command_topic<'a>(base: &str, topic: &'a str) -> Option<&'a str> {
    let identifier = topic
        .strip_prefix(base)?
        .strip_prefix('/')?
        .strip_suffix("/set")?;
    if identifier.is_empty() || identifier.contains('/') {
        return None;
    }
    Some(identifier)
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Availability<'a> {
    pub state: &'a str,
}

/// Full attribute record published next to the state.
#[derive(Debug, Serialize)]
pub struct MqttAttributes<'a> {
    instance_tag: &'a str,
    attribute: &'a Attribute,
    index: u32,
    state: &'a AttributeValue,
    variable_type: ValueKind,
    device_id: &'a str,
    unique_id: &'a str,
    name: &'a str,
    device_name: &'a str,
    identifier: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_level: Option<f64>,
}

impl<'a> From<&'a AttributeState> for MqttAttributes<'a> {
    fn from(state: &'a AttributeState) -> Self {
        Self {
            instance_tag: &state.instance_tag,
            attribute: &state.attribute,
            index: state.index,
            state: &state.value,
            variable_type: state.kind(),
            device_id: &state.device_id,
            unique_id: &state.unique_id,
            name: &state.name,
            device_name: &state.device_name,
            identifier: &state.identifier,
            min_level: state.bounds.map(|b| b.min_level),
            max_level: state.bounds.map(|b| b.max_level),
        }
    }
}

#[derive(Debug, Serialize)]
struct DiscoveryDevice {
    ids: String,
    name: String,
    mf: &'static str,
    sn: String,
}

#[derive(Debug, Serialize)]
struct DiscoveryOrigin {
    name: &'static str,
}

#[derive(Debug, Serialize)]
struct DiscoveryAvailability {
    topic: String,
    value_template: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum DiscoveryComponent {
    Switch {
        payload_on: bool,
        payload_off: bool,
    },
    Number {
        min: f64,
        max: f64,
        step: f64,
        unit_of_measurement: &'static str,
    },
}

impl DiscoveryComponent {
    fn platform(&self) -> &'static str {
        match self {
            Self::Switch { .. } => "switch",
            Self::Number { .. } => "number",
        }
    }
}

/// Home Assistant discovery config for one attribute.
#[derive(Debug, Serialize)]
pub struct Discovery {
    dev: DiscoveryDevice,
    origin: DiscoveryOrigin,
    availability: Vec<DiscoveryAvailability>,
    name: String,
    object_id: String,
    state_topic: String,
    unique_id: String,
    value_template: &'static str,
    command_topic: String,
    #[serde(flatten)]
    component: DiscoveryComponent,
}

/// Build the discovery topic and payload. `None` for attributes that are not announced:
/// text values, and levels without bounds.
pub fn discovery(state: &AttributeState, serial_number: &str, base: &str) -> Option<(String, Discovery)> {
    let component = match state.kind() {
        ValueKind::Bool => DiscoveryComponent::Switch {
            payload_on: true,
            payload_off: false,
        },
        ValueKind::Float => {
            let bounds = state.bounds?;
            DiscoveryComponent::Number {
                min: bounds.min_level,
                max: bounds.max_level,
                step: LEVEL_STEP,
                unit_of_measurement: LEVEL_UNIT,
            }
        }
        ValueKind::Text => return None,
    };

    let topic = format!(
        "{DISCOVERY_PREFIX}/{}/{}/config",
        component.platform(),
        state.unique_id
    );
    let payload = Discovery {
        dev: DiscoveryDevice {
            ids: format!("tesira2mqtt_{}", state.device_id),
            name: state.device_name.clone(),
            mf: MANUFACTURER,
            sn: serial_number.to_string(),
        },
        origin: DiscoveryOrigin { name: ORIGIN_NAME },
        availability: vec![DiscoveryAvailability {
            topic: availability_topic(base),
            value_template: "{{ value_json.state }}",
        }],
        name: state.name.clone(),
        object_id: format!("{} {}", state.device_name, state.name),
        state_topic: state_topic(base, &state.identifier),
        unique_id: state.unique_id.clone(),
        value_template: "{{ value_json }}",
        command_topic: command_topic(base, &state.identifier),
        component,
    };
    Some((topic, payload))
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publishes availability, state, attributes and discovery. Everything is retained.
pub struct MqttPublisher {
    client: AsyncClient,
    base_topic: String,
    qos: QoS,
    announced: Mutex<HashSet<String>>,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, base_topic: impl Into<String>) -> Self {
        Self {
            client,
            base_topic: base_topic.into(),
            qos: QoS::AtLeastOnce,
            announced: Mutex::new(HashSet::new()),
        }
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    pub async fn publish_status(&self, status: &str) -> Result<(), ClientError> {
        let payload = serde_json::to_string(&Availability { state: status })
            .unwrap_or_else(|_| format!("{{\"state\":\"{status}\"}}"));
        info!("Publishing availability {}", status);
        self.client
            .publish(availability_topic(&self.base_topic), self.qos, true, payload)
            .await
    }

    /// Publish state and attributes, then discovery the first time an identifier is seen.
    pub async fn publish_state(&self, state: &AttributeState, serial_number: &str) {
        let base = &self.base_topic;
        debug!(
            "Publishing state {} for {} {}",
            state.value, state.device_name, state.name
        );
        self.publish_json(&state_topic(base, &state.identifier), &state.value)
            .await;
        self.publish_json(
            &attributes_topic(base, &state.identifier),
            &MqttAttributes::from(state),
        )
        .await;

        let first_time = self
            .announced
            .lock()
            .await
            .insert(state.identifier.clone());
        if first_time {
            match discovery(state, serial_number, base) {
                Some((topic, payload)) => {
                    info!("Publishing discovery info for {}", state.identifier);
                    self.publish_json(&topic, &payload).await;
                }
                None => debug!("{} is not announced", state.identifier),
            }
        }
    }

    async fn publish_json(&self, topic: &str, payload: &impl Serialize) {
        match serde_json::to_string(payload) {
            Ok(json) => {
                if let Err(e) = self.client.publish(topic, self.qos, true, json).await {
                    error!("Failed to publish to {topic}: {e}");
                }
            }
            Err(e) => error!("Failed to serialize MQTT payload: {e}"),
        }
    }
}
