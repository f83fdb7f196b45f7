//! Control messages exchanged between sibling controllers

use serde::{Deserialize, Serialize};

/// Signal broadcast on the pool bus by `pause()` and `close()`
///
/// Wire shape: `{"type":"pause","origin":"...","payload":true}` and
/// `{"type":"close","origin":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Pause { origin: String, payload: bool },
    Close { origin: String },
}

impl ControlMessage {
    /// Identity of the controller that raised the signal
    pub fn origin(&self) -> &str {
        match self {
            Self::Pause { origin, .. } | Self::Close { origin } => origin,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        // String and bool fields only; serialization cannot fail
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Parse a bus message; anything that is not a control signal yields `None`
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
