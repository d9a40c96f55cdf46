// MIT License - Copyright (c) 2021 TJForc
// Device connection and subscription configuration

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::DEFAULT_PORT;
use crate::error::{Result, TesiraError};

/// Attribute of a control block that can be subscribed to.
///
/// Only `mute` and `level` are understood; any other attribute name is carried
/// through as an opaque string value and never announced for discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attribute {
    Mute,
    Level,
    Other(String),
}

impl Attribute {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Mute => "mute",
            Self::Level => "level",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for Attribute {
    fn from(s: &str) -> Self {
        match s {
            "mute" => Self::Mute,
            "level" => Self::Level,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Attribute {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Attribute {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Attribute::from(s.as_str()))
    }
}

/// A configured subscription to one attribute of one control block.
///
/// Equality is structural over all five fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Subscription {
    pub instance_tag: String,
    pub attribute: Attribute,
    pub index: u32,
    /// Display name used on the bus.
    pub name: String,
    pub device_name: String,
}

impl Subscription {
    pub fn new(
        instance_tag: impl Into<String>,
        attribute: Attribute,
        index: u32,
        name: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            instance_tag: instance_tag.into(),
            attribute,
            index,
            name: name.into(),
            device_name: device_name.into(),
        }
    }

    /// Subscription identifier: `{instance_tag}_{attribute}_{index}`.
    ///
    /// Used as the subscription table key and as the device-side publish token.
    pub fn identifier(&self) -> String {
        format!("{}_{}_{}", self.instance_tag, self.attribute, self.index)
    }
}

/// Validated, deduplicated set of subscriptions in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    /// Deduplicates structurally identical entries and rejects distinct entries
    /// that collide on the same identifier.
    pub fn new(subscriptions: impl IntoIterator<Item = Subscription>) -> Result<Self> {
        let mut seen: HashSet<Subscription> = HashSet::new();
        let mut identifiers: HashSet<String> = HashSet::new();
        let mut unique = Vec::new();

        for subscription in subscriptions {
            if seen.contains(&subscription) {
                continue;
            }
            if subscription.index == 0 {
                return Err(TesiraError::InvalidSubscription {
                    reason: format!("index must be positive for {}", subscription.identifier()),
                });
            }
            if subscription.instance_tag.is_empty()
                || subscription.instance_tag.contains(char::is_whitespace)
            {
                return Err(TesiraError::InvalidSubscription {
                    reason: format!("invalid instance tag {:?}", subscription.instance_tag),
                });
            }
            let identifier = subscription.identifier();
            if !identifiers.insert(identifier.clone()) {
                return Err(TesiraError::DuplicateSubscription { identifier });
            }
            seen.insert(subscription.clone());
            unique.push(subscription);
        }

        Ok(Self {
            subscriptions: unique,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn as_slice(&self) -> &[Subscription] {
        &self.subscriptions
    }
}

/// Configuration for connecting to a Tesira device.
#[derive(Debug, Clone)]
pub struct TesiraConfig {
    /// Device host name or IP address
    pub host: String,
    /// Tesira Text Protocol port (default: 23)
    pub port: u16,
    /// Timeout for connecting, reading the banner and reading a reply line
    pub response_timeout_ms: u64,
    /// Pause between writing a command and reading its reply
    pub settle_delay_ms: u64,
    /// Pause between two subscriptions in a subscribe-all cycle
    pub subscribe_pause_ms: u64,
    /// Interval of the periodic resubscription cycle
    pub resubscription_interval_secs: u64,
    /// How long the event drain waits for a push before looping
    pub drain_timeout_ms: u64,
    /// Base delay for reconnection backoff
    pub reconnect_delay_ms: u64,
}

impl Default for TesiraConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.50".to_string(),
            port: DEFAULT_PORT,
            response_timeout_ms: 10_000,
            settle_delay_ms: 1_000,
            subscribe_pause_ms: 1_000,
            resubscription_interval_secs: 60,
            drain_timeout_ms: 10_000,
            reconnect_delay_ms: 10_000,
        }
    }
}

impl TesiraConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> TesiraConfigBuilder {
        TesiraConfigBuilder::default()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn subscribe_pause(&self) -> Duration {
        Duration::from_millis(self.subscribe_pause_ms)
    }

    pub fn resubscription_interval(&self) -> Duration {
        Duration::from_secs(self.resubscription_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Backoff before reconnection attempt `attempt` (1-based), capped at 16x the base delay.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(4);
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(factor))
    }
}

/// Builder for TesiraConfig.
#[derive(Debug, Clone, Default)]
pub struct TesiraConfigBuilder {
    config: TesiraConfig,
}

impl TesiraConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn response_timeout_ms(mut self, ms: u64) -> Self {
        self.config.response_timeout_ms = ms;
        self
    }

    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.settle_delay_ms = ms;
        self
    }

    pub fn subscribe_pause_ms(mut self, ms: u64) -> Self {
        self.config.subscribe_pause_ms = ms;
        self
    }

    pub fn resubscription_interval_secs(mut self, secs: u64) -> Self {
        self.config.resubscription_interval_secs = secs;
        self
    }

    pub fn drain_timeout_ms(mut self, ms: u64) -> Self {
        self.config.drain_timeout_ms = ms;
        self
    }

    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    pub fn build(self) -> TesiraConfig {
        self.config
    }
}
