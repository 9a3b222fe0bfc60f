//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                       | Key Methods           |
// |---------------|---------------------------------------------------|-----------------------|
// | Envelope      | One telemetry event read off the firehose         | new, with_tag         |
// | EventType     | Kind of telemetry wrapped by an envelope          |                       |
//--------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of telemetry carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    HttpStartStop,
    LogMessage,
    ValueMetric,
    CounterEvent,
    Error,
    ContainerMetric,
}

/// A single event as produced by the platform firehose.
///
/// The nozzle never looks inside an envelope; it only moves it from the
/// event source to the event router, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Component that emitted the event
    pub origin: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Event body, kept as-is
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(origin: impl Into<String>, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            origin: origin.into(),
            event_type,
            timestamp: Utc::now(),
            deployment: None,
            job: None,
            index: None,
            ip: None,
            tags: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
