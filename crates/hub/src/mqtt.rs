use serde::Deserialize;
use std::collections::HashMap;

use crate::actuator::Actuator;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Telemetry published by the grow-room controller on `tele/<device>/state`.
#[derive(Debug, Deserialize)]
pub(crate) struct StateMsg {
    pub(crate) ts: i64,
    pub(crate) states: HashMap<String, serde_json::Value>,
}

impl StateMsg {
    /// Flatten JSON values into raw state strings. `null` entries are
    /// dropped, which the sensor source reports as unavailable.
    pub(crate) fn into_states(self) -> HashMap<String, String> {
        self.states
            .into_iter()
            .filter_map(|(k, v)| {
                let raw = match v {
                    serde_json::Value::Null => return None,
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Bool(b) => if b { "on" } else { "off" }.to_string(),
                    other => other.to_string(),
                };
                Some((k, raw))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract device_id from "tele/<device_id>/state".
pub(crate) fn extract_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "state" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

pub(crate) fn telemetry_topic(device_id: &str) -> String {
    format!("tele/{device_id}/state")
}

/// "switch/<device_id>/<actuator>/set"
pub(crate) fn switch_topic(device_id: &str, actuator: Actuator) -> String {
    format!("switch/{device_id}/{actuator}/set")
}

// ===========================================================================
// Tests
// ===========================================================================
