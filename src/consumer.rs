// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Core of the consumption pipeline: every delivery ends either acknowledged
//! after a successful handler run, republished for a later retry, or parked on
//! the dead-letter exchange. Nothing is dropped.
//!
//! | Condition                         | Action                                   |
//! |-----------------------------------|------------------------------------------|
//! | handler succeeds                  | ack                                      |
//! | handler fails, retries remain     | republish with retry count + 1, then ack |
//! | handler fails, retries exhausted  | publish to `dead.letter.<queue>`, ack    |
//! | body is not JSON                  | publish to `dead.letter.<queue>.malformed`, ack |

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    publisher::PERSISTENT_DELIVERY_MODE,
    retry,
    transport::{BrokerChannel, Delivery},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::Value;
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Prefix of every routing key on the dead-letter exchange
pub const DEAD_LETTER_ROUTING_PREFIX: &str = "dead.letter";

/// Per-consumer retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Handler failures tolerated before a message is dead-lettered
    pub max_retries: u32,
    /// Delay before the first retry; doubles with every further retry
    pub retry_base_delay: Duration,
    /// Upper bound for the retry delay
    pub max_retry_delay: Duration,
    /// Delay before retrying a consumer registration that failed
    pub setup_retry_interval: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            setup_retry_interval: Duration::from_secs(5),
        }
    }
}

impl ConsumeOptions {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.max_retry_delay = max;
        self
    }

    pub fn setup_retry_interval(mut self, interval: Duration) -> Self {
        self.setup_retry_interval = interval;
        self
    }
}

/// `dead.letter.<queue>`
pub fn dead_letter_routing_key(queue: &str) -> String {
    format!("{DEAD_LETTER_ROUTING_PREFIX}.{queue}")
}

/// `dead.letter.<queue>.malformed`
pub fn malformed_routing_key(queue: &str) -> String {
    format!("{DEAD_LETTER_ROUTING_PREFIX}.{queue}.malformed")
}

/// Everything needed to settle deliveries from one queue.
#[derive(Clone)]
pub(crate) struct ConsumerContext {
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) options: ConsumeOptions,
    pub(crate) dead_letter_exchange: String,
    pub(crate) channel: Arc<dyn BrokerChannel>,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    Acked,
    RetryScheduled { retry_count: u32, delay: Duration },
    DeadLettered,
    Malformed,
}

/// Runs the handler for one delivery and settles it.
///
/// Retries are republished from a separate task after their backoff delay, so
/// the caller can move on to the next delivery right away.
pub(crate) async fn handle_delivery(
    tracer: &BoxedTracer,
    delivery: Delivery,
    cx: &ConsumerContext,
) -> Result<Disposition, AmqpError> {
    let payload: Value = match serde_json::from_slice(&delivery.data) {
        Ok(payload) => payload,
        Err(err) => return dead_letter_malformed(cx, &delivery, &err.to_string()).await,
    };

    let retry_count = retry::retry_count(&delivery.properties);
    let span_name = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(&delivery.routing_key)
        .to_owned();
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &span_name);

    debug!(
        queue = %cx.queue,
        routing_key = %delivery.routing_key,
        retry_count,
        "received message"
    );

    let msg = ConsumerMessage {
        queue: cx.queue.clone(),
        exchange: delivery.exchange.clone(),
        routing_key: delivery.routing_key.clone(),
        retry_count,
        redelivered: delivery.redelivered,
        payload,
        properties: delivery.properties.clone(),
    };

    let outcome = AssertUnwindSafe(cx.handler.exec(&ctx, &msg))
        .catch_unwind()
        .await;

    let error_message = match outcome {
        Ok(Ok(())) => {
            debug!("message successfully processed");
            return match cx.channel.ack(delivery.delivery_tag).await {
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(Disposition::Acked)
                }
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
            };
        }
        Ok(Err(err)) => err.to_string(),
        Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
    };

    span.set_status(Status::Error {
        description: Cow::from(error_message.clone()),
    });

    if retry_count < cx.options.max_retries {
        let delay = retry::handler_retry_delay(
            retry_count,
            cx.options.retry_base_delay,
            cx.options.max_retry_delay,
        );
        schedule_retry(cx, delivery, retry_count + 1, error_message, delay);
        return Ok(Disposition::RetryScheduled {
            retry_count: retry_count + 1,
            delay,
        });
    }

    dead_letter_exhausted(cx, &delivery, retry_count, &error_message).await
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

fn schedule_retry(
    cx: &ConsumerContext,
    delivery: Delivery,
    next_count: u32,
    error_message: String,
    delay: Duration,
) {
    warn!(
        queue = %cx.queue,
        error = %error_message,
        retry = next_count,
        max_retries = cx.options.max_retries,
        delay_ms = delay.as_millis() as u64,
        "error whiling handling msg, republishing for retry"
    );

    let channel = cx.channel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        match republish(channel.as_ref(), &delivery, next_count, &error_message).await {
            Ok(()) => {
                if let Err(err) = channel.ack(delivery.delivery_tag).await {
                    error!(error = err.to_string(), "error whiling ack republished msg");
                }
            }
            Err(err) => {
                error!(error = err.to_string(), "error whiling republishing msg, requeuing");
                if let Err(err) = channel.nack(delivery.delivery_tag, true).await {
                    error!(error = err.to_string(), "error whiling requeuing msg");
                }
            }
        }
    });
}

/// Publishes the original bytes back to the original exchange and routing key
/// with the incremented retry header.
async fn republish(
    channel: &dyn BrokerChannel,
    delivery: &Delivery,
    next_count: u32,
    error_message: &str,
) -> Result<(), AmqpError> {
    let properties = delivery
        .properties
        .clone()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(retry::retry_headers(delivery, next_count, error_message));

    match channel
        .publish(
            &delivery.exchange,
            &delivery.routing_key,
            &delivery.data,
            properties,
        )
        .await
    {
        Ok(true) => {
            debug!(retry = next_count, "republished message for retry");
            Ok(())
        }
        Ok(false) => Err(AmqpError::RequeuingMessageError),
        Err(err) => Err(err),
    }
}

async fn dead_letter_exhausted(
    cx: &ConsumerContext,
    delivery: &Delivery,
    retry_count: u32,
    error_message: &str,
) -> Result<Disposition, AmqpError> {
    error!(
        queue = %cx.queue,
        error = %error_message,
        retry_count,
        "too many attempts, sending to dlq"
    );

    let properties = delivery
        .properties
        .clone()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(retry::dead_letter_headers(delivery, error_message));

    park(
        cx,
        delivery,
        &dead_letter_routing_key(&cx.queue),
        properties,
    )
    .await?;
    Ok(Disposition::DeadLettered)
}

async fn dead_letter_malformed(
    cx: &ConsumerContext,
    delivery: &Delivery,
    error_message: &str,
) -> Result<Disposition, AmqpError> {
    warn!(
        queue = %cx.queue,
        error = %error_message,
        "unparsable message body, sending to dlq"
    );

    let properties = lapin::BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(retry::malformed_headers(error_message));

    park(cx, delivery, &malformed_routing_key(&cx.queue), properties).await?;
    Ok(Disposition::Malformed)
}

/// Publishes to the dead-letter exchange, then acks the original. When the
/// dead-letter publish fails the original is requeued instead.
async fn park(
    cx: &ConsumerContext,
    delivery: &Delivery,
    routing_key: &str,
    properties: lapin::BasicProperties,
) -> Result<(), AmqpError> {
    let published = cx
        .channel
        .publish(&cx.dead_letter_exchange, routing_key, &delivery.data, properties)
        .await;

    if !matches!(published, Ok(true)) {
        error!(routing_key, "error whiling sending to dlq, requeuing");
        if let Err(err) = cx.channel.nack(delivery.delivery_tag, true).await {
            error!(error = err.to_string(), "error whiling requeuing msg");
        }
        return Err(AmqpError::PublishingToDLQError);
    }

    cx.channel.ack(delivery.delivery_tag).await.map_err(|err| {
        error!(error = err.to_string(), "error whiling ack msg to default queue");
        err
    })
}
