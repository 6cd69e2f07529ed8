//! Message data model
//!
//! A `Message` is the unit that flows through every stage of a `Flow`. It is
//! immutable-after-construction except for the fields a stage is explicitly
//! allowed to set (`destination_topic`, and whatever a `MessageProcessor`
//! chooses to replace wholesale by returning a new `Message`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Opaque, broker-native value carried alongside a message for ack
/// correlation (partition, offset, delivery tag, ...). The core never
/// interprets these; they are pass-through for the adapter that produced
/// the message and, eventually, the adapter that acks it.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Json(serde_json::Value),
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// A message flowing through a `Flow`.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub source_topic: String,
    pub destination_topic: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, MetadataValue>,
}

impl Message {
    /// Creates a new message captured "now", with empty headers/metadata.
    pub fn new(source_topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            headers: HashMap::new(),
            source_topic: source_topic.into(),
            destination_topic: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_destination_topic(mut self, topic: impl Into<String>) -> Self {
        self.destination_topic = Some(topic.into());
        self
    }

    /// Size of the payload in bytes, used for byte-throughput metrics.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Returns the payload decoded as a UTF-8 string, if valid.
    pub fn payload_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Parses the payload as a top-level JSON object and looks up `key`,
    /// coercing the value to a string the way the Fan resolver needs.
    pub fn payload_json_field(&self, key: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.payload).ok()?;
        let field = value.get(key)?;
        match field {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_message_with_headers_and_metadata() {
        let msg = Message::new("orders", b"hello".to_vec())
            .with_header("destination_topic", "orders-out")
            .with_metadata("offset", 42i64);

        assert_eq!(msg.source_topic, "orders");
        assert_eq!(msg.headers.get("destination_topic").unwrap(), "orders-out");
        assert_eq!(msg.metadata.get("offset"), Some(&MetadataValue::Int(42)));
        assert_eq!(msg.payload_as_str(), Some("hello"));
    }

    #[test]
    fn extracts_json_payload_field() {
        let msg = Message::new("metrics", br#"{"routing_key":"metrics","data":"cpu"}"#.to_vec());
        assert_eq!(msg.payload_json_field("routing_key"), Some("metrics".to_string()));
        assert_eq!(msg.payload_json_field("missing"), None);
    }
}
