// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes JSON messages to the client's topic exchange. Messages are
//! persistent, carry a `messageId` and a timestamp, and propagate the current
//! OpenTelemetry context in their headers.
//!
//! A negative confirm or a transport error is retried with exponential
//! backoff. Once the attempts are exhausted the failure is logged and surfaced
//! as `false`; the publisher never returns an error to the caller.

use crate::{
    client::BrokerClient,
    envelope::EventEnvelope,
    errors::AmqpError,
    otel,
    retry::publish_retry_delay,
};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Retry policy of a single publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Attempts made after the first one fails
    pub retries: u32,
    /// Delay after the first failed attempt; doubles after each further one
    pub retry_delay: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl PublishOptions {
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message` under `routing_key`. Returns whether the broker
    /// accepted it within the retry budget.
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        message: &Value,
        options: &PublishOptions,
    ) -> bool;
}

/// Publisher bound to one exchange of a [`BrokerClient`].
#[derive(Clone)]
pub struct RabbitMQPublisher {
    client: BrokerClient,
    exchange: String,
}

impl RabbitMQPublisher {
    pub fn new(client: BrokerClient, exchange: &str) -> RabbitMQPublisher {
        RabbitMQPublisher {
            client,
            exchange: exchange.to_owned(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Serializes any `Serialize` value and publishes it.
    pub async fn publish_serialized<T>(&self, routing_key: &str, message: &T, options: &PublishOptions) -> bool
    where
        T: Serialize + Sync,
    {
        match serde_json::to_value(message) {
            Ok(value) => self.publish(&Context::current(), routing_key, &value, options).await,
            Err(err) => {
                error!(error = err.to_string(), routing_key, "failure to serialize message");
                false
            }
        }
    }

    /// Wraps `data` in a fresh envelope and publishes it under its event type.
    ///
    /// # Parameters
    /// * `service` - Name of the emitting service
    /// * `event_type` - Event type, also used as routing key
    /// * `data` - Event payload
    /// * `options` - Retry policy of this publish
    ///
    /// # Returns
    /// `true` once the broker confirmed the message, `false` when every
    /// attempt failed
    pub async fn publish_event<T>(&self, service: &str, event_type: &str, data: T, options: &PublishOptions) -> bool
    where
        T: Serialize + Send + Sync,
    {
        let envelope = EventEnvelope::new(service, event_type, data);
        match envelope.to_value() {
            Ok(value) => {
                self.publish(&Context::current(), envelope.routing_key(), &value, options)
                    .await
            }
            Err(err) => {
                error!(error = err.to_string(), event_type, "failure to build envelope");
                false
            }
        }
    }

    async fn try_publish(&self, routing_key: &str, payload: &[u8], properties: BasicProperties) -> Result<bool, AmqpError> {
        let channel = self.client.channel().await?;
        channel
            .publish(&self.exchange, routing_key, payload, properties)
            .await
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        message: &Value,
        options: &PublishOptions,
    ) -> bool {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), routing_key, "failure to serialize message");
                return false;
            }
        };

        let properties = message_properties(ctx, message);
        let attempts = options.retries.saturating_add(1);

        for attempt in 1..=attempts {
            match self.try_publish(routing_key, &payload, properties.clone()).await {
                Ok(true) => {
                    debug!(exchange = %self.exchange, routing_key, attempt, "message published");
                    return true;
                }
                Ok(false) => warn!(routing_key, attempt, "broker rejected publish"),
                Err(err) => warn!(error = err.to_string(), routing_key, attempt, "error publishing message"),
            }

            if attempt < attempts {
                tokio::time::sleep(publish_retry_delay(attempt, options.retry_delay)).await;
            }
        }

        error!(
            exchange = %self.exchange,
            routing_key,
            attempts,
            "failure to publish message, giving up"
        );
        false
    }
}

/// Persistent JSON properties; `messageId` is the message's own `id` when it
/// has one.
fn message_properties(ctx: &Context, message: &Value) -> BasicProperties {
    let message_id = match message.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(id @ Value::Number(_)) => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };

    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject_context(ctx, &mut headers);

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(message_id))
        .with_timestamp(Utc::now().timestamp().max(0) as u64)
        .with_headers(FieldTable::from(headers))
}
