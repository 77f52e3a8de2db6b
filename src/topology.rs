// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module describes and installs the broker-side entities a service relies
//! on: one durable topic exchange, the durable queues bound to it by routing-key
//! patterns, and the dead-letter exchange/queue pair.
//!
//! A topology is plain data. The connection manager installs it after every
//! successful connect, so a broker restart that lost non-persisted entities is
//! repaired transparently. Every declaration uses assert semantics and is safe
//! to repeat.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Ordered exchanges, queues and bindings
//! - Presets for the services of the platform

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use async_trait::async_trait;
use tracing::debug;

/// Pattern binding the dead-letter queue to every dead-letter routing key
pub const DEAD_LETTER_BINDING_PATTERN: &str = "#";

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares everything on the broker through `channel`.
    async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError>;
}

/// Exchanges, queues and bindings, declared in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Durable topic dead-letter exchange and a durable queue catching every
    /// routing key published to it.
    pub fn dead_letter(exchange: &str, queue: &str) -> AmqpTopology {
        AmqpTopology::new()
            .exchange(ExchangeDefinition::durable_topic(exchange))
            .queue(QueueDefinition::new(queue).durable())
            .queue_binding(
                QueueBinding::new(queue)
                    .exchange(exchange)
                    .routing_key(DEAD_LETTER_BINDING_PATTERN),
            )
    }

    /// Declares `queue` durable (once) and binds it to `exchange` with `pattern`.
    ///
    /// # Parameters
    /// * `queue` - Queue to declare and bind
    /// * `exchange` - Exchange the queue receives messages from
    /// * `pattern` - Topic pattern, `*` for one word and `#` for zero or more
    ///
    /// # Returns
    /// The extended topology
    pub fn bind(self, queue: &str, exchange: &str, pattern: &str) -> AmqpTopology {
        let topology = if self.queues.iter().any(|q| q.name == queue) {
            self
        } else {
            self.queue(QueueDefinition::new(queue).durable())
        };

        topology.queue_binding(QueueBinding::new(queue).exchange(exchange).routing_key(pattern))
    }

    /// Appends everything `other` declares that this topology does not yet.
    pub fn merge(mut self, other: AmqpTopology) -> AmqpTopology {
        for exchange in other.exchanges {
            if !self.exchanges.iter().any(|e| e.name == exchange.name) {
                self.exchanges.push(exchange);
            }
        }
        for queue in other.queues {
            if !self.queues.iter().any(|q| q.name == queue.name) {
                self.queues.push(queue);
            }
        }
        for binding in other.queues_binding {
            if !self.queues_binding.contains(&binding) {
                self.queues_binding.push(binding);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.queues_binding.is_empty()
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|q| q.name.as_str())
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares everything on `channel`: exchanges first, then queues, then
    /// bindings. Safe to repeat on every connect since each declaration is an
    /// assertion.
    ///
    /// # Errors
    /// The first declaration the broker refuses, e.g. an exchange that
    /// already exists with another kind
    async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            channel.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            channel.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// Topologies of the platform's services.
pub mod presets {
    use super::AmqpTopology;
    use crate::exchange::ExchangeDefinition;
    use crate::topology::Topology;

    pub const NOTIFICATION_QUEUE: &str = "notification.queue";
    pub const USER_EVENT_QUEUE: &str = "user.events.notification";
    pub const TRANSACTION_EVENT_QUEUE: &str = "transaction.events.notification";
    pub const ACCOUNT_EVENT_QUEUE: &str = "account.events.notification";

    pub const TRANSACTION_QUEUE: &str = "transaction.queue";
    pub const ACCOUNT_SERVICE_QUEUE: &str = "account.service.queue";
    pub const NOTIFICATION_SERVICE_QUEUE: &str = "notification.service.queue";

    /// The notification service listens to every domain's events.
    pub fn notification_service(exchange: &str) -> AmqpTopology {
        AmqpTopology::new()
            .exchange(ExchangeDefinition::durable_topic(exchange))
            .bind(NOTIFICATION_QUEUE, exchange, "notification.#")
            .bind(USER_EVENT_QUEUE, exchange, "user.#")
            .bind(TRANSACTION_EVENT_QUEUE, exchange, "transaction.#")
            .bind(ACCOUNT_EVENT_QUEUE, exchange, "account.#")
    }

    pub fn transaction_service(exchange: &str) -> AmqpTopology {
        AmqpTopology::new()
            .exchange(ExchangeDefinition::durable_topic(exchange))
            .bind(TRANSACTION_QUEUE, exchange, "transaction.#")
            .bind(ACCOUNT_SERVICE_QUEUE, exchange, "account.#")
            .bind(NOTIFICATION_SERVICE_QUEUE, exchange, "notification.#")
    }
}
