// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The callback boundary between the messaging core and business code. A
//! handler returning `Ok` gets its message acknowledged; any error (or panic)
//! is treated as retryable until the consumer's retry budget is spent.
//!
//! Delivery is at-least-once, so handlers must be idempotent with respect to
//! the envelope `id`.

use crate::envelope::{EnvelopeError, EventEnvelope};
use async_trait::async_trait;
use lapin::BasicProperties;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{error::Error, future::Future, sync::Arc};

/// Error type handlers report failures with.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// A parsed delivery handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    /// Value of the retry header on this copy, 0 for the first attempt
    pub retry_count: u32,
    pub redelivered: bool,
    pub payload: Value,
    pub properties: BasicProperties,
}

impl ConsumerMessage {
    /// Decodes the payload as an event envelope with a typed `data` field.
    pub fn envelope<T: DeserializeOwned>(&self) -> Result<EventEnvelope<T>, EnvelopeError> {
        EventEnvelope::from_value(self.payload.clone())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    /// The envelope `type`, when the payload carries one.
    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure as a [`ConsumerHandler`].
///
/// ```ignore
/// let handler = handler_fn(|msg: ConsumerMessage| async move {
///     let event = msg.envelope::<UserCreated>()?;
///     notify(event.data).await?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.f)(msg.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct UserCreated {
        id: String,
    }

    fn message(payload: Value) -> ConsumerMessage {
        ConsumerMessage {
            queue: "user.events".to_owned(),
            exchange: "xnl_events".to_owned(),
            routing_key: "user.created".to_owned(),
            retry_count: 0,
            redelivered: false,
            payload,
            properties: BasicProperties::default().with_message_id(ShortString::from("m-1")),
        }
    }

    #[test]
    fn typed_envelope_access() {
        let envelope = EventEnvelope::new("users", "user.created", json!({"id": "u1"}));
        let msg = message(envelope.to_value().unwrap());

        let decoded = msg.envelope::<UserCreated>().unwrap();
        assert_eq!(decoded.data, UserCreated { id: "u1".to_owned() });
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(msg.event_type(), Some("user.created"));
        assert_eq!(msg.message_id(), Some("m-1"));
    }

    #[tokio::test]
    async fn closure_handlers_forward_results() {
        let ok = handler_fn(|_msg: ConsumerMessage| async { Ok(()) });
        let failing = handler_fn(|msg: ConsumerMessage| async move {
            Err::<(), HandlerError>(format!("cannot handle {}", msg.routing_key).into())
        });

        let ctx = Context::new();
        let msg = message(json!({}));

        assert!(ok.exec(&ctx, &msg).await.is_ok());
        assert_eq!(
            failing.exec(&ctx, &msg).await.unwrap_err().to_string(),
            "cannot handle user.created"
        );
    }
}
