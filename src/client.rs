// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client
//!
//! Owns the one connection and channel a process keeps to the broker. The
//! client installs the topology on every successful connect, re-subscribes the
//! registered consumers, and reconnects after a fixed interval whenever the
//! connection fails or cannot be opened. Broker unavailability is never fatal
//! to the caller: `connect` and `consume` log and keep retrying in the
//! background.
//!
//! ```ignore
//! let client = BrokerClient::new(BrokerConfig::from_env()?, presets::transaction_service("xnl_events"));
//! client.connect().await;
//!
//! client
//!     .consume("transaction.queue", handler_fn(|msg| async move { settle(msg).await }), ConsumeOptions::default())
//!     .await;
//!
//! client.publish_event("transactions", "transaction.completed", &transfer).await;
//! ```

use crate::{
    channel::AmqpConnector,
    config::BrokerConfig,
    consumer::ConsumeOptions,
    dispatcher::{consumer_tag, spawn_consumer, Subscription},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerHandler,
    publisher::{PublishOptions, Publisher, RabbitMQPublisher},
    topology::{AmqpTopology, Topology},
    transport::{BrokerChannel, ConnectionEvent, Connector, DeliveryStream},
};
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver},
    watch,
};
use tracing::{debug, error, info, warn};

/// Lifecycle of the client's broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Closed on purpose; only an explicit `connect` reopens it
    Closed,
}

#[derive(Clone)]
struct Session {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

struct ClientInner {
    config: BrokerConfig,
    connector: Arc<dyn Connector>,
    topology: AmqpTopology,
    session: RwLock<Option<Session>>,
    state: watch::Sender<ConnectionState>,
    connecting: AtomicBool,
    reconnect_pending: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
}

impl ClientInner {
    fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_session(&self) -> Option<Session> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_registered(&self, sub: &Arc<Subscription>) -> bool {
        self.subscriptions()
            .get(&sub.queue)
            .is_some_and(|registered| Arc::ptr_eq(registered, sub))
    }

    fn current_generation(&self) -> Option<u64> {
        self.session().map(|s| s.generation)
    }
}

/// Cheaply cloneable handle to the process's broker connection.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl BrokerClient {
    /// Client connecting to RabbitMQ with lapin.
    ///
    /// `topology` is installed on every connect, together with the configured
    /// exchange and the dead-letter exchange/queue pair.
    pub fn new(config: BrokerConfig, topology: AmqpTopology) -> BrokerClient {
        Self::with_connector(config, topology, Arc::new(AmqpConnector))
    }

    /// Client using `connector` to reach the broker.
    ///
    /// # Parameters
    /// * `config` - Connection settings and exchange names
    /// * `topology` - Queues and bindings declared on every connect
    /// * `connector` - Transport, e.g. a `MemoryBroker` connector in tests
    ///
    /// # Returns
    /// A disconnected client; nothing is opened until first use
    pub fn with_connector(config: BrokerConfig, topology: AmqpTopology, connector: Arc<dyn Connector>) -> BrokerClient {
        let topology = AmqpTopology::new()
            .exchange(ExchangeDefinition::durable_topic(&config.exchange))
            .merge(topology)
            .merge(AmqpTopology::dead_letter(
                &config.dead_letter_exchange,
                &config.dead_letter_queue,
            ));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        BrokerClient {
            inner: Arc::new(ClientInner {
                config,
                connector,
                topology,
                session: RwLock::new(None),
                state,
                connecting: AtomicBool::new(false),
                reconnect_pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Opens the connection and installs the topology. A no-op while connected
    /// or connecting. On failure a reconnect is scheduled; this never errors.
    pub async fn connect(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
        connect(self.inner.clone()).await;
    }

    /// Closes the channel, then the connection. Stops reconnecting and drops
    /// every consumer registration.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.subscriptions().clear();

        if let Some(session) = self.inner.take_session() {
            match session.channel.close().await {
                Ok(()) => info!("broker connection closed"),
                Err(err) => warn!(error = err.to_string(), "error closing broker connection"),
            }
        }

        self.inner.set_state(ConnectionState::Closed);
    }

    /// The open channel, connecting first when needed.
    pub(crate) async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        ensure_session(&self.inner)
            .await
            .map(|session| session.channel)
            .ok_or(AmqpError::NotConnected)
    }

    /// Publisher on the configured exchange.
    pub fn publisher(&self) -> RabbitMQPublisher {
        RabbitMQPublisher::new(self.clone(), &self.inner.config.exchange)
    }

    pub async fn publish(&self, routing_key: &str, message: &Value, options: &PublishOptions) -> bool {
        self.publisher()
            .publish(&Context::current(), routing_key, message, options)
            .await
    }

    /// Publishes `data` as a new event envelope routed by `event_type`.
    pub async fn publish_event<T>(&self, service: &str, event_type: &str, data: T) -> bool
    where
        T: Serialize + Send + Sync,
    {
        self.publisher()
            .publish_event(service, event_type, data, &PublishOptions::default())
            .await
    }

    /// Registers `handler` for `queue` and starts consuming. Registering a
    /// queue again replaces its handler. When the broker is unreachable the
    /// setup is retried in the background.
    ///
    /// # Parameters
    /// * `queue` - Name of a queue declared by the client's topology
    /// * `handler` - Invoked once per delivery; an error schedules a retry
    /// * `options` - Retry budget, backoff and setup retry interval
    ///
    /// The registration survives reconnects until [`BrokerClient::close`].
    pub async fn consume(&self, queue: &str, handler: Arc<dyn ConsumerHandler>, options: ConsumeOptions) {
        let sub = {
            let mut subscriptions = self.inner.subscriptions();
            match subscriptions.get(queue) {
                Some(existing) => {
                    debug!(queue, "replacing consumer handler");
                    existing.replace(handler, options);
                    existing.clone()
                }
                None => {
                    let sub = Arc::new(Subscription::new(queue, handler, options));
                    subscriptions.insert(queue.to_owned(), sub.clone());
                    sub
                }
            }
        };

        start_consumer(self.inner.clone(), sub).await;
    }
}

fn connect_boxed(inner: Arc<ClientInner>) -> BoxFuture<'static, ()> {
    Box::pin(connect(inner))
}

fn start_consumer_on_boxed(inner: Arc<ClientInner>, session: Session, sub: Arc<Subscription>) -> BoxFuture<'static, ()> {
    Box::pin(start_consumer_on(inner, session, sub))
}

async fn connect(inner: Arc<ClientInner>) {
    if inner.is_closed() || inner.session().is_some() {
        return;
    }
    if inner.connecting.swap(true, Ordering::SeqCst) {
        debug!("connection attempt already in flight");
        return;
    }

    inner.set_state(ConnectionState::Connecting);
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    debug!(connection_name = %inner.config.connection_name, generation, "connecting to broker");
    let result = match inner.connector.connect(&inner.config, events_tx).await {
        Ok(channel) => match inner.topology.install(channel.as_ref()).await {
            Ok(()) => Ok(channel),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        },
        Err(err) => Err(err),
    };

    match result {
        Ok(channel) if inner.is_closed() => {
            // close() ran while the connection was being opened.
            let _ = channel.close().await;
            inner.connecting.store(false, Ordering::SeqCst);
        }
        Ok(channel) => {
            let session = Session { channel, generation };
            *inner.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
            inner.connecting.store(false, Ordering::SeqCst);
            inner.set_state(ConnectionState::Connected);
            info!(generation, "connected to broker");

            watch_connection(inner.clone(), events_rx, generation);

            let subscriptions: Vec<Arc<Subscription>> =
                inner.subscriptions().values().cloned().collect();
            for sub in subscriptions {
                tokio::spawn(start_consumer_on_boxed(inner.clone(), session.clone(), sub));
            }
        }
        Err(err) => {
            inner.connecting.store(false, Ordering::SeqCst);
            error!(error = err.to_string(), "failure to connect to broker");
            if !inner.is_closed() {
                inner.set_state(ConnectionState::Disconnected);
            }
            schedule_reconnect(&inner);
        }
    }
}

/// Waits for the first failure reported for connection `generation`.
fn watch_connection(inner: Arc<ClientInner>, mut events: UnboundedReceiver<ConnectionEvent>, generation: u64) {
    tokio::spawn(async move {
        let Some(event) = events.recv().await else {
            return;
        };
        connection_lost(&inner, generation, &event);
    });
}

fn connection_lost(inner: &Arc<ClientInner>, generation: u64, event: &ConnectionEvent) {
    let stale = {
        let mut session = inner.session.write().unwrap_or_else(PoisonError::into_inner);
        if session.as_ref().map(|s| s.generation) != Some(generation) {
            debug!(generation, %event, "ignoring event of a previous connection");
            return;
        }
        session.take()
    };

    warn!(generation, error = %event, "broker connection lost");

    // A channel error leaves the connection itself open.
    if let Some(stale) = stale {
        tokio::spawn(async move {
            if let Err(err) = stale.channel.close().await {
                debug!(error = err.to_string(), generation, "error closing lost connection");
            }
        });
    }

    if !inner.is_closed() {
        inner.set_state(ConnectionState::Disconnected);
    }
    schedule_reconnect(inner);
}

/// Schedules a single reconnect after the configured interval.
fn schedule_reconnect(inner: &Arc<ClientInner>) {
    if inner.is_closed() {
        return;
    }
    if inner.reconnect_pending.swap(true, Ordering::SeqCst) {
        debug!("reconnect already scheduled");
        return;
    }

    let delay = inner.config.reconnect_interval;
    warn!(delay_ms = delay.as_millis() as u64, "scheduling broker reconnect");

    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        inner.reconnect_pending.store(false, Ordering::SeqCst);
        connect_boxed(inner).await;
    });
}

async fn ensure_session(inner: &Arc<ClientInner>) -> Option<Session> {
    if let Some(session) = inner.session() {
        return Some(session);
    }
    connect_boxed(inner.clone()).await;
    inner.session()
}

/// Starts `sub`, connecting first when the client has no connection yet.
async fn start_consumer(inner: Arc<ClientInner>, sub: Arc<Subscription>) {
    if !inner.is_registered(&sub) {
        return;
    }

    let Some(session) = ensure_session(&inner).await else {
        warn!(queue = %sub.queue, "broker unavailable, consumer setup will retry");
        schedule_consumer_retry(&inner, sub);
        return;
    };

    start_consumer_on(inner, session, sub).await;
}

/// Starts `sub` on `session` only. Never opens a connection: once `session`
/// is gone the reconnect that replaces it resubscribes everything.
async fn start_consumer_on(inner: Arc<ClientInner>, session: Session, sub: Arc<Subscription>) {
    if !inner.is_registered(&sub) {
        return;
    }
    if inner.current_generation() != Some(session.generation) {
        debug!(queue = %sub.queue, generation = session.generation, "connection gone, consumer waits for reconnect");
        return;
    }

    if !sub.claim(session.generation) {
        debug!(queue = %sub.queue, "consumer already running");
        return;
    }

    match open_consumer(&inner, &session, &sub.queue).await {
        Ok(deliveries) => {
            info!(queue = %sub.queue, generation = session.generation, "consumer started");

            let generation = session.generation;
            let on_end = {
                let inner = inner.clone();
                let sub = sub.clone();
                move || {
                    // Cancelled while the connection stayed up.
                    if inner.current_generation() == Some(generation) {
                        schedule_consumer_retry(&inner, sub);
                    }
                }
            };

            spawn_consumer(
                deliveries,
                session.channel.clone(),
                inner.config.dead_letter_exchange.clone(),
                sub,
                generation,
                on_end,
            );
        }
        Err(err) => {
            sub.release(session.generation);
            error!(error = err.to_string(), queue = %sub.queue, "error to create the consumer");
            schedule_consumer_retry(&inner, sub);
        }
    }
}

async fn open_consumer(inner: &ClientInner, session: &Session, queue: &str) -> Result<DeliveryStream, AmqpError> {
    AmqpTopology::dead_letter(&inner.config.dead_letter_exchange, &inner.config.dead_letter_queue)
        .install(session.channel.as_ref())
        .await?;

    session.channel.consume(queue, &consumer_tag(queue)).await
}

fn schedule_consumer_retry(inner: &Arc<ClientInner>, sub: Arc<Subscription>) {
    if inner.is_closed() || !sub.take_retry_slot() {
        return;
    }

    let delay = sub.options().setup_retry_interval;
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        sub.clear_retry_slot();

        match inner.session() {
            Some(session) => start_consumer_on_boxed(inner, session, sub).await,
            None => debug!(queue = %sub.queue, "no connection, consumer resumes on reconnect"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::EventEnvelope,
        handler::{handler_fn, ConsumerMessage, HandlerError},
        memory::MemoryBroker,
        retry::DeadLetterRecord,
        transport::{MockBrokerChannel, MockConnector},
    };
    use serde_json::json;
    use std::{
        sync::atomic::AtomicU32,
        time::Duration,
    };
    use tokio::{sync::mpsc::UnboundedSender, time::sleep};

    const USER_QUEUE: &str = "user.events";

    fn topology() -> AmqpTopology {
        AmqpTopology::new().bind(USER_QUEUE, "xnl_events", "user.#")
    }

    fn client(broker: &MemoryBroker) -> BrokerClient {
        BrokerClient::with_connector(BrokerConfig::default(), topology(), broker.connector())
    }

    /// Handler recording every message it sees and failing the first
    /// `failures` invocations.
    fn recording(failures: u32) -> (Arc<dyn ConsumerHandler>, Arc<Mutex<Vec<ConsumerMessage>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let calls = Arc::new(AtomicU32::new(0));
        let log = seen.clone();

        let handler: Arc<dyn ConsumerHandler> = handler_fn(move |msg: ConsumerMessage| {
            let log = log.clone();
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                log.lock().unwrap().push(msg);
                if call < failures {
                    return Err::<(), HandlerError>("boom".into());
                }
                Ok(())
            }
        });

        (handler, seen)
    }

    fn dead_letters(broker: &MemoryBroker) -> Vec<DeadLetterRecord> {
        broker
            .ready_messages("dead.letter.queue")
            .iter()
            .map(DeadLetterRecord::from_delivery)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_installs_topology() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.connect().await;
        client.connect().await;

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 1);
        assert!(broker.has_exchange("xnl_events"));
        assert!(broker.has_binding(USER_QUEUE, "xnl_events", "user.#"));
        assert!(broker.has_exchange("dead.letter.exchange"));
        assert!(broker.has_binding("dead.letter.queue", "dead.letter.exchange", "#"));
    }

    #[tokio::test(start_paused = true)]
    async fn user_created_is_consumed_once() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        client.connect().await;

        let (handler, seen) = recording(0);
        client.consume(USER_QUEUE, handler, ConsumeOptions::default()).await;

        let published = client
            .publish(
                "user.created",
                &json!({"service": "users", "type": "user.created", "data": {"id": "u1"}}),
                &PublishOptions::default(),
            )
            .await;
        assert!(published);

        sleep(Duration::from_secs(1)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload["data"]["id"], "u1");
        assert_eq!(seen[0].routing_key, "user.created");
        assert_eq!(broker.acked_count(), 1);
        assert_eq!(broker.queue_depth(USER_QUEUE), 0);
        assert!(dead_letters(&broker).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn envelope_survives_the_broker() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let (handler, seen) = recording(0);
        client.consume(USER_QUEUE, handler, ConsumeOptions::default()).await;

        let inputs = [
            ("users", "user.created", json!({"id": "u1"})),
            ("users", "user.profile.updated", json!({"id": "u1", "fields": ["email"]})),
            ("accounts", "user.linked", json!(null)),
        ];
        for (service, event_type, data) in &inputs {
            assert!(client.publish_event(service, event_type, data).await);
        }

        sleep(Duration::from_secs(1)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), inputs.len());
        for ((service, event_type, data), msg) in inputs.iter().zip(seen.iter()) {
            let envelope = msg.envelope::<Value>().unwrap();
            assert_eq!(envelope.service, *service);
            assert_eq!(envelope.event_type, *event_type);
            assert_eq!(envelope.data, *data);
            assert_eq!(envelope.id.get_version_num(), 4);
            assert_eq!(msg.message_id(), Some(envelope.id.to_string().as_str()));

            let raw = msg.payload["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(raw).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_is_retried_until_it_succeeds() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let options = ConsumeOptions::default();
        let (handler, seen) = recording(options.max_retries);
        client.consume(USER_QUEUE, handler, options.clone()).await;

        let envelope = EventEnvelope::new("users", "user.created", json!({"id": "u1"}));
        assert!(
            client
                .publish("user.created", &envelope.to_value().unwrap(), &PublishOptions::default())
                .await
        );

        // Backoff of 1s + 2s + 4s.
        sleep(Duration::from_secs(30)).await;

        let seen = seen.lock().unwrap();
        let counts: Vec<u32> = seen.iter().map(|m| m.retry_count).collect();
        assert_eq!(counts, vec![0, 1, 2, 3]);
        assert!(seen
            .iter()
            .all(|m| m.envelope::<Value>().unwrap().id == envelope.id));

        // Every in-flight copy was settled exactly once, none is left behind.
        assert_eq!(broker.acked_count(), 4);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth(USER_QUEUE), 0);
        assert!(dead_letters(&broker).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_message_lands_in_dead_letter_queue() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let (handler, seen) = recording(u32::MAX);
        client.consume(USER_QUEUE, handler, ConsumeOptions::default()).await;

        assert!(client.publish_event("users", "user.created", json!({"id": "u1"})).await);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(seen.lock().unwrap().len(), 4);

        let parked = dead_letters(&broker);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].routing_key, "dead.letter.user.events");
        assert_eq!(parked[0].original_exchange.as_deref(), Some("xnl_events"));
        assert_eq!(parked[0].original_routing_key.as_deref(), Some("user.created"));
        assert_eq!(parked[0].error_message.as_deref(), Some("boom"));
        assert!(parked[0].failed_at.is_some());
        assert!(!parked[0].is_malformed());

        // Never handed to the original queue again.
        sleep(Duration::from_secs(300)).await;
        assert_eq!(seen.lock().unwrap().len(), 4);
        assert_eq!(broker.queue_depth(USER_QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_body_is_dead_lettered_without_handler() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let (handler, seen) = recording(0);
        client.consume(USER_QUEUE, handler, ConsumeOptions::default()).await;

        broker.inject("xnl_events", "user.created", b"{not json").unwrap();
        sleep(Duration::from_secs(1)).await;

        assert!(seen.lock().unwrap().is_empty());

        let parked = dead_letters(&broker);
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].routing_key, "dead.letter.user.events.malformed");
        assert!(parked[0].is_malformed());
        assert!(parked[0].error_message.is_some());
        assert_eq!(parked[0].data, b"{not json".to_vec());
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_resume_after_connection_drop() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let (handler, seen) = recording(0);
        client.consume(USER_QUEUE, handler, ConsumeOptions::default()).await;
        assert_eq!(broker.consumer_count(USER_QUEUE), 1);

        broker.force_disconnect();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(broker.consumer_count(USER_QUEUE), 0);

        sleep(BrokerConfig::default().reconnect_interval + Duration::from_secs(1)).await;

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.consumer_count(USER_QUEUE), 1);

        assert!(client.publish_event("users", "user.created", json!({"id": "u2"})).await);
        sleep(Duration::from_secs(1)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload["data"]["id"], "u2");

        // The setup retry scheduled while the drop was in progress must not
        // open a second consumer.
        drop(seen);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(broker.consumer_count(USER_QUEUE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consume_setup_is_retried_until_broker_is_up() {
        let broker = MemoryBroker::new();
        broker.set_online(false);
        let client = client(&broker);

        let (handler, seen) = recording(0);
        client.consume(USER_QUEUE, handler, ConsumeOptions::default()).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        sleep(Duration::from_secs(12)).await;
        assert_eq!(broker.consumer_count(USER_QUEUE), 0);

        broker.set_online(true);
        sleep(Duration::from_secs(12)).await;

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(broker.consumer_count(USER_QUEUE), 1);

        broker.inject("xnl_events", "user.created", br#"{"id":"u3"}"#).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_replaces_the_handler() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let (first, first_seen) = recording(0);
        let (second, second_seen) = recording(0);
        client.consume(USER_QUEUE, first, ConsumeOptions::default()).await;
        client.consume(USER_QUEUE, second, ConsumeOptions::default()).await;

        assert_eq!(broker.consumer_count(USER_QUEUE), 1);

        assert!(client.publish_event("users", "user.created", json!({"id": "u1"})).await);
        sleep(Duration::from_secs(1)).await;

        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_everything_until_reconnected() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let (handler, _seen) = recording(0);
        client.consume(USER_QUEUE, handler, ConsumeOptions::default()).await;

        client.close().await;
        client.close().await;

        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(broker.connection_count(), 0);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.consumer_count(USER_QUEUE), 0);

        client.connect().await;
        assert_eq!(client.state(), ConnectionState::Connected);
        // Registrations were dropped by close.
        assert_eq!(broker.consumer_count(USER_QUEUE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_reconnect_loop_runs() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AmqpError::ConnectionError("connection refused".to_owned()))
        });

        let client = BrokerClient::with_connector(BrokerConfig::default(), topology(), Arc::new(connector));
        let mut states = client.watch_state();

        client.connect().await;
        client.connect().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    fn accepting_channel() -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel.expect_bind_queue().returning(|_| Ok(()));
        channel.expect_close().returning(|| Ok(()));
        channel
    }

    #[tokio::test(start_paused = true)]
    async fn events_of_an_old_connection_are_ignored() {
        let senders: Arc<Mutex<Vec<UnboundedSender<ConnectionEvent>>>> = Arc::new(Mutex::new(vec![]));
        let captured = senders.clone();

        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |_, events| {
            captured.lock().unwrap().push(events);
            Ok(Arc::new(accepting_channel()) as Arc<dyn BrokerChannel>)
        });

        let client = BrokerClient::with_connector(BrokerConfig::default(), topology(), Arc::new(connector));
        client.connect().await;
        client.close().await;
        client.connect().await;
        assert_eq!(senders.lock().unwrap().len(), 2);

        let first = senders.lock().unwrap()[0].clone();
        first
            .send(ConnectionEvent::ConnectionError("late".to_owned()))
            .unwrap();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(senders.lock().unwrap().len(), 2);

        let current = senders.lock().unwrap()[1].clone();
        current
            .send(ConnectionEvent::ConnectionError("reset".to_owned()))
            .unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(senders.lock().unwrap().len(), 3);
    }

    /// Connector handing out accepting channels; records each connection's
    /// event sender and how often its channel was closed.
    type Connections = Arc<Mutex<Vec<(UnboundedSender<ConnectionEvent>, Arc<AtomicU32>)>>>;

    fn tracking_connector(consume_fails: bool) -> (MockConnector, Connections) {
        let connections: Connections = Arc::new(Mutex::new(vec![]));
        let captured = connections.clone();

        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |_, events| {
            let closes = Arc::new(AtomicU32::new(0));
            let counter = closes.clone();

            let mut channel = MockBrokerChannel::new();
            channel.expect_declare_exchange().returning(|_| Ok(()));
            channel.expect_declare_queue().returning(|_| Ok(()));
            channel.expect_bind_queue().returning(|_| Ok(()));
            channel.expect_close().returning(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            if consume_fails {
                channel
                    .expect_consume()
                    .returning(|queue, _| Err(AmqpError::ConsumerDeclarationError(queue.to_owned())));
            }

            captured.lock().unwrap().push((events, closes));
            Ok(Arc::new(channel) as Arc<dyn BrokerChannel>)
        });

        (connector, connections)
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_closes_the_lost_connection() {
        let (connector, connections) = tracking_connector(false);
        let client = BrokerClient::with_connector(BrokerConfig::default(), topology(), Arc::new(connector));
        client.connect().await;

        let (events, stale_closes) = connections.lock().unwrap()[0].clone();
        events
            .send(ConnectionEvent::ChannelError("404 NOT_FOUND".to_owned()))
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(stale_closes.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(6)).await;

        assert_eq!(client.state(), ConnectionState::Connected);
        let connections = connections.lock().unwrap();
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].1.load(Ordering::SeqCst), 1);
        assert_eq!(connections[1].1.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_retry_waits_for_the_reconnect_interval() {
        let (connector, connections) = tracking_connector(true);
        let client = BrokerClient::with_connector(BrokerConfig::default(), topology(), Arc::new(connector));

        // Setup fails, a retry is due at 5s.
        let (handler, _seen) = recording(0);
        client.consume(USER_QUEUE, handler, ConsumeOptions::default()).await;
        assert_eq!(client.state(), ConnectionState::Connected);

        // Connection drops at 1s, the reconnect is due at 6s.
        sleep(Duration::from_secs(1)).await;
        let events = connections.lock().unwrap()[0].0.clone();
        events
            .send(ConnectionEvent::ConnectionError("reset".to_owned()))
            .unwrap();

        sleep(Duration::from_millis(4500)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(connections.lock().unwrap().len(), 1);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(connections.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_topology_install_closes_and_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut channel = MockBrokerChannel::new();
            channel
                .expect_declare_exchange()
                .returning(|def| Err(AmqpError::DeclareExchangeError(def.name.clone())));
            channel.expect_close().times(1).returning(|| Ok(()));
            Ok(Arc::new(channel) as Arc<dyn BrokerChannel>)
        });

        let client = BrokerClient::with_connector(BrokerConfig::default(), topology(), Arc::new(connector));
        client.connect().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
