// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Metadata
//!
//! Retry state travels with the message in AMQP headers rather than in a side
//! store: the consumer engine reads `x-retry-count` from each delivery and
//! writes the incremented value on the republished copy. Dead-lettered copies
//! additionally carry where they came from, why they failed and when.

use crate::transport::Delivery;
use chrono::{DateTime, SecondsFormat, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use std::time::Duration;

/// Number of times the message has already been handed back for retry
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Exchange the message was first published to
pub const AMQP_HEADERS_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Routing key the message was first published with
pub const AMQP_HEADERS_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Last handler or parse error
pub const AMQP_HEADERS_ERROR_MESSAGE: &str = "x-error-message";
/// ISO-8601 instant the message was dead-lettered
pub const AMQP_HEADERS_FAILED_AT: &str = "x-failed-at";

/// Reads the retry counter, treating a missing or unreadable header as 0.
pub fn retry_count(props: &BasicProperties) -> u32 {
    props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(AMQP_HEADERS_RETRY_COUNT))
        .and_then(as_integer)
        .map(|count| count.clamp(0, u32::MAX as i64) as u32)
        .unwrap_or_default()
}

/// Delay before the `retry_count`-th handler retry: `base * 2^retry_count`,
/// never longer than `max`.
pub fn handler_retry_delay(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Delay before publish attempt `attempt + 1` (attempt is 1-based):
/// `base * 2^(attempt - 1)`.
pub fn publish_retry_delay(attempt: u32, base: Duration) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

pub(crate) fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Headers for a republished retry: the original headers plus the
/// incremented counter and the failure context.
pub(crate) fn retry_headers(delivery: &Delivery, next_count: u32, error_message: &str) -> FieldTable {
    let mut headers = delivery.properties.headers().clone().unwrap_or_default();
    let (exchange, routing_key) = original_route(delivery);

    headers.insert(
        ShortString::from(AMQP_HEADERS_RETRY_COUNT),
        AMQPValue::LongLongInt(LongLongInt::from(next_count)),
    );
    insert_str(&mut headers, AMQP_HEADERS_ORIGINAL_EXCHANGE, &exchange);
    insert_str(&mut headers, AMQP_HEADERS_ORIGINAL_ROUTING_KEY, &routing_key);
    insert_str(&mut headers, AMQP_HEADERS_ERROR_MESSAGE, error_message);
    headers
}

/// Headers for a message whose retries are exhausted.
pub(crate) fn dead_letter_headers(delivery: &Delivery, error_message: &str) -> FieldTable {
    let mut headers = delivery.properties.headers().clone().unwrap_or_default();
    let (exchange, routing_key) = original_route(delivery);

    insert_str(&mut headers, AMQP_HEADERS_ORIGINAL_EXCHANGE, &exchange);
    insert_str(&mut headers, AMQP_HEADERS_ORIGINAL_ROUTING_KEY, &routing_key);
    insert_str(&mut headers, AMQP_HEADERS_ERROR_MESSAGE, error_message);
    insert_str(&mut headers, AMQP_HEADERS_FAILED_AT, &now_iso8601());
    headers
}

/// Headers for a body that could not be parsed; nothing else is trusted.
pub(crate) fn malformed_headers(error_message: &str) -> FieldTable {
    let mut headers = FieldTable::default();
    insert_str(&mut headers, AMQP_HEADERS_ERROR_MESSAGE, error_message);
    insert_str(&mut headers, AMQP_HEADERS_FAILED_AT, &now_iso8601());
    headers
}

/// Route recorded by an earlier retry, else the route of this delivery.
fn original_route(delivery: &Delivery) -> (String, String) {
    let headers = delivery.properties.headers().as_ref();
    let exchange = headers
        .and_then(|h| header_str(h, AMQP_HEADERS_ORIGINAL_EXCHANGE))
        .unwrap_or_else(|| delivery.exchange.clone());
    let routing_key = headers
        .and_then(|h| header_str(h, AMQP_HEADERS_ORIGINAL_ROUTING_KEY))
        .unwrap_or_else(|| delivery.routing_key.clone());
    (exchange, routing_key)
}

fn insert_str(headers: &mut FieldTable, key: &str, value: &str) {
    headers.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value)),
    );
}

pub(crate) fn header_str(headers: &FieldTable, key: &str) -> Option<String> {
    match headers.inner().get(key)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_owned()),
        _ => None,
    }
}

fn as_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).trim().parse().ok(),
        AMQPValue::ShortString(v) => v.as_str().trim().parse().ok(),
        _ => None,
    }
}

/// A dead-lettered message decoded for inspection or manual replay.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    /// Routing key on the dead-letter exchange, e.g. `dead.letter.user.events`
    pub routing_key: String,
    pub original_exchange: Option<String>,
    pub original_routing_key: Option<String>,
    pub error_message: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub message_id: Option<String>,
    /// Message body exactly as it was received
    pub data: Vec<u8>,
}

impl DeadLetterRecord {
    pub fn from_delivery(delivery: &Delivery) -> DeadLetterRecord {
        let headers = delivery.properties.headers().clone().unwrap_or_default();

        DeadLetterRecord {
            routing_key: delivery.routing_key.clone(),
            original_exchange: header_str(&headers, AMQP_HEADERS_ORIGINAL_EXCHANGE),
            original_routing_key: header_str(&headers, AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
            error_message: header_str(&headers, AMQP_HEADERS_ERROR_MESSAGE),
            failed_at: header_str(&headers, AMQP_HEADERS_FAILED_AT)
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|ts| ts.with_timezone(&Utc)),
            retry_count: retry_count(&delivery.properties),
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_owned()),
            data: delivery.data.clone(),
        }
    }

    /// Whether the message was parked because its body was not valid JSON.
    pub fn is_malformed(&self) -> bool {
        self.routing_key.ends_with(".malformed")
    }
}
