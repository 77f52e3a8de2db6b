// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The connection manager, publisher and consumer engine only talk to the broker
//! through the two traits defined here. `channel` implements them on top of
//! lapin; `memory` implements them in-process for tests and local development.

use crate::{
    config::BrokerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a consumer; it ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A message handed to a consumer, not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Delivery {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Out-of-band notification that an open connection stopped working. A
/// close initiated by the broker is reported by lapin as an error, too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectionError(String),
    ChannelError(String),
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::ConnectionError(err) => write!(f, "connection error: {err}"),
            ConnectionEvent::ChannelError(err) => write!(f, "channel error: {err}"),
        }
    }
}

/// Opens a connection plus a single channel on it.
///
/// Failures that happen after `connect` returned must be reported on `events`;
/// the connection manager reconnects on the first event it receives.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &BrokerConfig,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// The channel operations the messaging core needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Asserts an exchange: creates it if absent, validates its kind otherwise.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes one message. `Ok(false)` means the broker refused it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<bool, AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Closes the channel, then the connection it belongs to.
    async fn close(&self) -> Result<(), AmqpError>;
}
