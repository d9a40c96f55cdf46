// MIT License - Copyright (c) 2021 TJForc
// Attribute state and the subscription table

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{Attribute, Subscription};
use crate::error::{Result, TesiraError};
use crate::protocol::PublishToken;

/// Kind of value an attribute carries, decided once from the attribute name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Float,
    #[serde(rename = "str")]
    Text,
}

impl ValueKind {
    pub fn for_attribute(attribute: &Attribute) -> Self {
        match attribute {
            Attribute::Mute => Self::Bool,
            Attribute::Level => Self::Float,
            Attribute::Other(_) => Self::Text,
        }
    }

    /// Coerce raw device text into a typed value of this kind.
    pub fn coerce(&self, raw: &str) -> Result<AttributeValue> {
        let raw = raw.trim().trim_matches('"');
        match self {
            Self::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" | "yes" => Ok(AttributeValue::Bool(true)),
                "false" | "0" | "off" | "no" => Ok(AttributeValue::Bool(false)),
                _ => Err(TesiraError::InvalidResponse {
                    details: format!("expected a boolean, got {raw:?}"),
                }),
            },
            Self::Float => raw
                .parse::<f64>()
                .map(AttributeValue::Float)
                .map_err(|_| TesiraError::InvalidResponse {
                    details: format!("expected a number, got {raw:?}"),
                }),
            Self::Text => Ok(AttributeValue::Text(raw.to_string())),
        }
    }
}

/// Typed attribute value. Serializes as a bare JSON value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Range of a level control, fetched once per subscribe cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelBounds {
    pub min_level: f64,
    pub max_level: f64,
}

/// Runtime state of one subscribed attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeState {
    pub instance_tag: String,
    pub attribute: Attribute,
    pub index: u32,
    pub value: AttributeValue,
    /// `{serial}_{instance_tag}`
    pub device_id: String,
    /// `{serial}_{identifier}`
    pub unique_id: String,
    pub name: String,
    pub device_name: String,
    pub identifier: String,
    pub bounds: Option<LevelBounds>,
}

impl AttributeState {
    pub fn new(
        subscription: &Subscription,
        serial_number: &str,
        value: AttributeValue,
        bounds: Option<LevelBounds>,
    ) -> Self {
        let identifier = subscription.identifier();
        Self {
            instance_tag: subscription.instance_tag.clone(),
            attribute: subscription.attribute.clone(),
            index: subscription.index,
            value,
            device_id: format!("{serial_number}_{}", subscription.instance_tag),
            unique_id: format!("{serial_number}_{identifier}"),
            name: subscription.name.clone(),
            device_name: subscription.device_name.clone(),
            identifier,
            bounds,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }
}

/// Attribute state keyed by subscription identifier.
///
/// Entries are created by the first completed subscription and then only overwritten.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTable {
    entries: Arc<RwLock<HashMap<String, AttributeState>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, identifier: &str) -> Option<AttributeState> {
        self.entries.read().await.get(identifier).cloned()
    }

    pub async fn contains(&self, identifier: &str) -> bool {
        self.entries.read().await.contains_key(identifier)
    }

    pub async fn insert(&self, state: AttributeState) {
        self.entries
            .write()
            .await
            .insert(state.identifier.clone(), state);
    }

    /// Apply a push notification to the stored entry, coercing to its stored kind.
    ///
    /// Returns the updated state.
    pub async fn apply(&self, token: &PublishToken) -> Result<AttributeState> {
        let mut entries = self.entries.write().await;
        let state = entries.get_mut(&token.identifier).ok_or_else(|| {
            TesiraError::UnknownSubscription {
                identifier: token.identifier.clone(),
            }
        })?;
        state.value = state.kind().coerce(&token.value)?;
        Ok(state.clone())
    }

    /// Snapshot of all entries, sorted by identifier.
    pub async fn snapshot(&self) -> Vec<AttributeState> {
        let entries = self.entries.read().await;
        let mut states: Vec<AttributeState> = entries.values().cloned().collect();
        states.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        states
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
