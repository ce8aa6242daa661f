//! Event pipeline: `track` validation and the bounded delivery queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::telemetry::Telemetry;
use crate::types::{Event, PropertyValue};

static EVENT_TYPE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][-_.:a-zA-Z0-9]{0,79}$").expect("event type pattern is valid")
});

const MAX_PROPERTIES: usize = 300;
const MAX_PROPERTIES_BYTES: usize = 32 * 1024;
const MAX_KEY_LENGTH: usize = 250;

/// Validate track inputs and assemble the event, or explain the rejection.
pub(crate) fn build_event(
    key: &str,
    traffic_type: &str,
    event_type: &str,
    value: Option<f64>,
    properties: Option<HashMap<String, JsonValue>>,
    timestamp: i64,
) -> Option<Event> {
    if key.trim().is_empty() || key.len() > MAX_KEY_LENGTH {
        tracing::warn!("track: key must be a non-empty string of at most 250 characters");
        return None;
    }
    if traffic_type.trim().is_empty() {
        tracing::warn!("track: traffic type must not be empty");
        return None;
    }
    if !EVENT_TYPE_PATTERN.is_match(event_type) {
        tracing::warn!(
            %event_type,
            "track: event type must start alphanumeric and contain only [-_.:a-zA-Z0-9], max 80 chars"
        );
        return None;
    }
    let traffic_type = if traffic_type.chars().any(|c| c.is_ascii_uppercase()) {
        tracing::warn!(%traffic_type, "track: traffic type should be all lowercase, converting");
        traffic_type.to_ascii_lowercase()
    } else {
        traffic_type.to_string()
    };

    let properties = match properties {
        None => None,
        Some(raw) => {
            if raw.len() > MAX_PROPERTIES {
                tracing::warn!(count = raw.len(), "track: more than 300 properties, rejecting event");
                return None;
            }
            let mut converted = HashMap::with_capacity(raw.len());
            for (name, value) in raw {
                let value = match value {
                    JsonValue::Null => PropertyValue::Null,
                    JsonValue::Bool(b) => PropertyValue::Bool(b),
                    JsonValue::Number(n) => match n.as_f64() {
                        Some(f) => PropertyValue::Number(f),
                        None => {
                            tracing::warn!(property = %name, "track: non-finite numeric property, rejecting event");
                            return None;
                        }
                    },
                    JsonValue::String(s) => PropertyValue::String(s),
                    JsonValue::Array(_) | JsonValue::Object(_) => {
                        tracing::warn!(
                            property = %name,
                            "track: property values must be strings, numbers, booleans or null, rejecting event"
                        );
                        return None;
                    }
                };
                converted.insert(name, value);
            }
            let serialized = serde_json::to_string(&converted).unwrap_or_default();
            if serialized.len() > MAX_PROPERTIES_BYTES {
                tracing::warn!(
                    bytes = serialized.len(),
                    "track: properties exceed 32 KiB serialized, rejecting event"
                );
                return None;
            }
            Some(converted)
        }
    };

    Some(Event {
        key: key.to_string(),
        traffic_type_name: traffic_type,
        event_type_id: event_type.to_string(),
        value,
        timestamp,
        properties,
    })
}

/// Bounded event queue with drop-oldest overflow.
pub(crate) struct EventsManager {
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    telemetry: Arc<Telemetry>,
}

impl EventsManager {
    pub(crate) fn new(capacity: usize, telemetry: Arc<Telemetry>) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            telemetry,
        }
    }

    pub(crate) fn push(&self, event: Event) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            queue.pop_front();
            Telemetry::bump(&self.telemetry.events_dropped);
        }
        queue.push_back(event);
        Telemetry::bump(&self.telemetry.events_queued);
    }

    /// Take everything queued, preserving insertion order.
    pub(crate) fn drain(&self) -> Vec<Event> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }
}
