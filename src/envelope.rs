// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope
//!
//! Every event travelling through the bus is wrapped in the same envelope:
//!
//! ```json
//! {
//!   "id": "0b5c0b3e-5f0e-4c7b-9b53-5d8f1c6f3a10",
//!   "service": "users",
//!   "type": "user.created",
//!   "timestamp": "2025-03-01T12:00:00Z",
//!   "data": { "id": "u1" }
//! }
//! ```
//!
//! `id` is the idempotency key consumers deduplicate on, and `type` doubles as
//! the routing key on the topic exchange.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failure to encode envelope: {0}")]
    Encode(String),

    #[error("failure to decode envelope: {0}")]
    Decode(String),
}

/// Canonical event shape shared by all producers and consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T = Value> {
    pub id: Uuid,
    pub service: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

impl<T> EventEnvelope<T> {
    /// Wraps `data` with a fresh id and the current time.
    pub fn new(service: &str, event_type: &str, data: T) -> EventEnvelope<T> {
        EventEnvelope {
            id: Uuid::new_v4(),
            service: service.to_owned(),
            event_type: event_type.to_owned(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// The routing key this event is published under.
    pub fn routing_key(&self) -> &str {
        &self.event_type
    }
}

impl<T: Serialize> EventEnvelope<T> {
    pub fn to_value(&self) -> Result<Value, EnvelopeError> {
        serde_json::to_value(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    pub fn from_value(value: Value) -> Result<EventEnvelope<T>, EnvelopeError> {
        serde_json::from_value(value).map_err(|err| EnvelopeError::Decode(err.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<EventEnvelope<T>, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|err| EnvelopeError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Transfer {
        amount: u64,
        currency: String,
    }

    #[test]
    fn new_assigns_identity_and_time() {
        let before = Utc::now();
        let first = EventEnvelope::new("users", "user.created", json!({"id": "u1"}));
        let second = EventEnvelope::new("users", "user.created", json!({"id": "u1"}));

        assert_ne!(first.id, second.id);
        assert_eq!(first.id.get_version_num(), 4);
        assert!(first.timestamp >= before);
        assert_eq!(first.routing_key(), "user.created");
    }

    #[test]
    fn wire_shape_uses_type_field() {
        let envelope = EventEnvelope::new("users", "user.created", json!({"id": "u1"}));
        let value = envelope.to_value().unwrap();

        assert_eq!(value["service"], "users");
        assert_eq!(value["type"], "user.created");
        assert_eq!(value["data"], json!({"id": "u1"}));
        assert!(value.get("event_type").is_none());

        let id = value["id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());

        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn decodes_typed_payload() {
        let envelope = EventEnvelope::new(
            "transactions",
            "transaction.completed",
            Transfer {
                amount: 100,
                currency: "USD".to_owned(),
            },
        );
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let decoded = EventEnvelope::<Transfer>::from_slice(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn rejects_payload_without_envelope_fields() {
        let err = EventEnvelope::<Value>::from_value(json!({"event": "account.test"}));
        assert!(matches!(err, Err(EnvelopeError::Decode(_))));
    }
}
