// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker implementing the transport seam with AMQP topic
//! semantics: asserted exchanges and queues, pattern bindings, per-queue FIFO,
//! consumer acknowledgements and requeue of unacknowledged messages when a
//! connection goes away. Faults can be injected to exercise the reconnect and
//! retry paths without a running RabbitMQ.

use crate::{
    config::BrokerConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    transport::{BrokerChannel, ConnectionEvent, Connector, Delivery, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

/// Matches an AMQP topic routing key against a binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect()
    };

    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: BasicProperties,
    data: Vec<u8>,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
            data: self.data.clone(),
        }
    }
}

struct ConsumerSlot {
    connection: u64,
    sender: UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    dead_letter: Option<(String, String)>,
}

struct Unacked {
    connection: u64,
    queue: String,
    message: StoredMessage,
}

struct BrokerState {
    online: bool,
    next_connection: u64,
    next_tag: u64,
    connect_attempts: u32,
    publish_attempts: u32,
    failing_publishes: u32,
    acked: usize,
    connections: HashMap<u64, UnboundedSender<ConnectionEvent>>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
    unacked: HashMap<u64, Unacked>,
}

impl Default for BrokerState {
    fn default() -> Self {
        BrokerState {
            online: true,
            next_connection: 0,
            next_tag: 0,
            connect_attempts: 0,
            publish_attempts: 0,
            failing_publishes: 0,
            acked: 0,
            connections: HashMap::default(),
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: vec![],
            unacked: HashMap::default(),
        }
    }
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(kind) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError(format!(
                "no exchange `{exchange}`"
            )));
        };

        let mut queues: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match kind {
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Headers => false,
            };

            if matched && !queues.contains(&binding.queue_name) {
                queues.push(binding.queue_name.clone());
            }
        }

        Ok(queues)
    }

    fn enqueue(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<(), AmqpError> {
        for queue in self.route(exchange, routing_key)? {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_back(message.clone());
            }
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            queue.consumers.retain(|c| !c.sender.is_closed());
            if queue.consumers.is_empty() {
                break;
            }

            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);

            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer = &queue.consumers[idx];

            if consumer.sender.send(Ok(message.to_delivery(tag))).is_ok() {
                self.unacked.insert(
                    tag,
                    Unacked {
                        connection: consumer.connection,
                        queue: queue_name.to_owned(),
                        message,
                    },
                );
            } else {
                queue.ready.push_front(message);
            }
        }
    }

    /// Puts a message back at the head of its queue, flagged as redelivered.
    fn requeue(&mut self, unacked: Unacked) {
        let mut message = unacked.message;
        message.redelivered = true;

        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push_front(message);
        }
    }

    fn drop_connection(&mut self, connection: u64, event: Option<ConnectionEvent>) {
        let Some(events) = self.connections.remove(&connection) else {
            return;
        };

        if let Some(event) = event {
            let _ = events.send(event);
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.connection != connection);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so the oldest delivery ends up at the head.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }
}

/// Shared handle to an in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Connector opening connections against this broker.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While offline every connection attempt fails.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// The next `count` publishes get a negative confirm.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failing_publishes = count;
    }

    /// Drops every open connection as if the broker restarted: consumers are
    /// cancelled, unacknowledged messages are requeued and each connection's
    /// owner is notified.
    pub fn force_disconnect(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.drop_connection(
                id,
                Some(ConnectionEvent::ConnectionError(
                    "connection reset by broker".to_owned(),
                )),
            );
        }
    }

    /// Publishes raw bytes as an external producer would, bypassing clients.
    pub fn inject(&self, exchange: &str, routing_key: &str, data: &[u8]) -> Result<(), AmqpError> {
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: data.to_vec(),
        };
        self.lock().enqueue(exchange, routing_key, message)
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages waiting in `queue`, oldest first, without consuming them.
    pub fn ready_messages(&self, queue: &str) -> Vec<Delivery> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.to_delivery(0)).collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| {
            q.consumers.iter().filter(|c| !c.sender.is_closed()).count()
        })
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, pattern: &str) -> bool {
        self.lock().bindings.iter().any(|b| {
            b.queue_name == queue && b.exchange_name == exchange && b.routing_key == pattern
        })
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn publish_attempts(&self) -> u32 {
        self.lock().publish_attempts
    }

    pub fn acked_count(&self) -> usize {
        self.lock().acked
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _config: &BrokerConfig,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.lock();
        state.connect_attempts += 1;

        if !state.online {
            return Err(AmqpError::ConnectionError("broker unavailable".to_owned()));
        }

        state.next_connection += 1;
        let connection = state.next_connection;
        state.connections.insert(connection, events);
        debug!(connection, "memory broker connection opened");

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection,
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.lock();
        if state.connections.contains_key(&self.connection) {
            Ok(state)
        } else {
            Err(AmqpError::ChannelError("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        match state.exchanges.get(&def.name) {
            Some(kind) if *kind != def.kind => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.kind.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if state.queues.contains_key(&def.name) {
            return Ok(());
        }
        if def.passive {
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }

        let dead_letter = def.dead_letter_exchange.clone().map(|exchange| {
            let key = def
                .dead_letter_routing_key
                .clone()
                .unwrap_or_else(|| def.name.clone());
            (exchange, key)
        });

        state.queues.insert(
            def.name.clone(),
            MemoryQueue {
                dead_letter,
                ..MemoryQueue::default()
            },
        );
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<bool, AmqpError> {
        let mut state = self.broker.lock();
        state.publish_attempts += 1;

        if !state.connections.contains_key(&self.connection) {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Ok(false);
        }

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties,
            data: payload.to_vec(),
        };
        state.enqueue(exchange, routing_key, message)?;
        Ok(true)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        q.consumers.push(ConsumerSlot {
            connection: self.connection,
            sender,
        });
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        match state.unacked.get(&delivery_tag) {
            Some(u) if u.connection == self.connection => {
                state.unacked.remove(&delivery_tag);
                state.acked += 1;
                Ok(())
            }
            _ => Err(AmqpError::AckMessageError),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        let owned = state
            .unacked
            .get(&delivery_tag)
            .is_some_and(|u| u.connection == self.connection);
        let Some(unacked) = owned
            .then(|| state.unacked.remove(&delivery_tag))
            .flatten()
        else {
            return Err(AmqpError::NackMessageError);
        };

        let queue = unacked.queue.clone();
        if requeue {
            state.requeue(unacked);
            state.dispatch(&queue);
            return Ok(());
        }

        let dead_letter = state.queues.get(&queue).and_then(|q| q.dead_letter.clone());
        if let Some((exchange, routing_key)) = dead_letter {
            let mut message = unacked.message;
            message.exchange = exchange.clone();
            message.routing_key = routing_key.clone();
            state.enqueue(&exchange, &routing_key, message)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().drop_connection(self.connection, None);
        Ok(())
    }
}
