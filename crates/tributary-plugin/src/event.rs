//! Analytics events as they flow through the plugin pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event name reserved for session-recording snapshots.
pub const SNAPSHOT_EVENT: &str = "$snapshot";

/// Event properties: string keys to JSON values (string, number, bool,
/// null, nested object or list).
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Which fan-out handler an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Normal,
    Snapshot,
}

/// A captured analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub distinct_id: String,
    pub event: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl PluginEvent {
    pub fn new(event: impl Into<String>, distinct_id: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            distinct_id: distinct_id.into(),
            event: event.into(),
            properties: Properties::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> EventKind {
        if self.event == SNAPSHOT_EVENT {
            EventKind::Snapshot
        } else {
            EventKind::Normal
        }
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(PluginEvent::new("$pageview", "u1").kind(), EventKind::Normal);
        assert_eq!(
            PluginEvent::new(SNAPSHOT_EVENT, "u1").kind(),
            EventKind::Snapshot
        );
    }

    #[test]
    fn test_with_property() {
        let event = PluginEvent::new("signup", "u1")
            .with_property("plan", "pro")
            .with_property("seats", 3);
        assert_eq!(event.property("plan"), Some(&serde_json::json!("pro")));
        assert_eq!(event.property("seats"), Some(&serde_json::json!(3)));
        assert!(event.property("missing").is_none());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let event: PluginEvent =
            serde_json::from_str(r#"{"distinct_id":"u1","event":"click"}"#).unwrap();
        assert_eq!(event.event, "click");
        assert!(event.properties.is_empty());
        assert!(!event.uuid.is_nil());
    }

    #[test]
    fn test_nested_properties_survive_json() {
        let json = serde_json::json!({
            "distinct_id": "u1",
            "event": "purchase",
            "properties": {
                "items": [{"sku": "a", "qty": 2}],
                "coupon": null,
                "total": 19.5,
                "gift": false
            }
        });
        let event: PluginEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.properties["items"][0]["qty"], 2);
        assert!(event.properties["coupon"].is_null());
        assert_eq!(event.properties["gift"], false);
    }
}
