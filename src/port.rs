//! Port Indices and Attributes
//!
//! Ports are addressed by plain indices that are validated once when a
//! connection is created and never renumbered afterwards. Attributes are the
//! user-editable values of a module; the numeric ones (`AudioParam`) double as
//! modulation inputs on native modules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of an input or output port on a module
pub type PortIndex = u32;

/// Destination side of a logical connection
///
/// Persisted as a plain integer where `-1` selects the enclosing audio
/// destination. That sentinel is only legal on an `Output` proxy in the root
/// patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum InputIndex {
    /// A regular input port
    Port(PortIndex),
    /// The backend's root destination
    RootDestination,
}

impl InputIndex {
    /// Wire value of [`InputIndex::RootDestination`]
    pub const ROOT_DESTINATION: i64 = -1;

    /// The port index, if this is a regular port
    pub fn port(self) -> Option<PortIndex> {
        match self {
            InputIndex::Port(index) => Some(index),
            InputIndex::RootDestination => None,
        }
    }

    pub fn is_root_destination(self) -> bool {
        matches!(self, InputIndex::RootDestination)
    }
}

impl From<PortIndex> for InputIndex {
    fn from(index: PortIndex) -> Self {
        InputIndex::Port(index)
    }
}

impl From<InputIndex> for i64 {
    fn from(index: InputIndex) -> Self {
        match index {
            InputIndex::Port(port) => i64::from(port),
            InputIndex::RootDestination => InputIndex::ROOT_DESTINATION,
        }
    }
}

impl TryFrom<i64> for InputIndex {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value == InputIndex::ROOT_DESTINATION {
            return Ok(InputIndex::RootDestination);
        }
        PortIndex::try_from(value)
            .map(InputIndex::Port)
            .map_err(|_| format!("invalid input index: {}", value))
    }
}

impl fmt::Display for InputIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i64::from(*self))
    }
}

/// Current value of an attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(value) => Some(*value),
            AttributeValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(value) => Some(value),
            AttributeValue::Number(_) => None,
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Number(value) => write!(f, "{}", value),
            AttributeValue::Text(value) => write!(f, "{}", value),
        }
    }
}

/// What kind of value an attribute holds and how the backend receives it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AttributeKind {
    /// Numeric parameter, also exposed as a modulation input port
    AudioParam { default: f64, min: f64, max: f64 },

    /// One of a fixed set of string options (waveform, filter type)
    Choice {
        options: Vec<String>,
        default: String,
    },

    /// Sample buffer; not implemented, setting it only logs a diagnostic
    Buffer,
}

/// Definition of a single attribute on a module type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub id: String,
    pub label: String,
    pub kind: AttributeKind,
}

impl AttributeSpec {
    pub fn audio_param(id: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind: AttributeKind::AudioParam { default, min, max },
        }
    }

    pub fn choice(id: impl Into<String>, options: &[&str], default: &str) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind: AttributeKind::Choice {
                options: options.iter().map(|o| o.to_string()).collect(),
                default: default.to_string(),
            },
        }
    }

    pub fn buffer(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind: AttributeKind::Buffer,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_audio_param(&self) -> bool {
        matches!(self.kind, AttributeKind::AudioParam { .. })
    }

    /// Whether values of this kind can be stored and pushed to a backend
    pub fn is_implemented(&self) -> bool {
        !matches!(self.kind, AttributeKind::Buffer)
    }

    /// Initial value for a fresh module, `None` for unimplemented kinds
    pub fn default_value(&self) -> Option<AttributeValue> {
        match &self.kind {
            AttributeKind::AudioParam { default, .. } => Some(AttributeValue::Number(*default)),
            AttributeKind::Choice { default, .. } => Some(AttributeValue::Text(default.clone())),
            AttributeKind::Buffer => None,
        }
    }

    /// Bring a value into this attribute's domain
    ///
    /// Numbers are clamped to the parameter range; choices must name one of
    /// the options. Returns `None` when the value cannot be accepted.
    pub fn coerce(&self, value: AttributeValue) -> Option<AttributeValue> {
        match (&self.kind, value) {
            (AttributeKind::AudioParam { min, max, .. }, AttributeValue::Number(v)) => {
                if v.is_nan() {
                    return None;
                }
                // Definitions can be registered with the bounds swapped
                let (low, high) = if min <= max {
                    (*min, *max)
                } else {
                    (*max, *min)
                };
                Some(AttributeValue::Number(v.max(low).min(high)))
            }
            (AttributeKind::Choice { options, .. }, AttributeValue::Text(v)) => {
                options.contains(&v).then_some(AttributeValue::Text(v))
            }
            _ => None,
        }
    }
}
