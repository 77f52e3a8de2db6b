// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Consumer registrations and the task that drains one queue's delivery stream.
//! Each subscription runs as a dedicated task that awaits every handler
//! invocation before pulling the next delivery, which keeps per-queue FIFO.
//!
//! A registration outlives the connection it was started on: the connection
//! manager starts it again on every new connection, and a re-registration for
//! the same queue swaps the handler of the running consumer in place.

use crate::{
    consumer::{handle_delivery, ConsumeOptions, ConsumerContext},
    handler::ConsumerHandler,
    otel::CONSUMER_TRACER,
    transport::{BrokerChannel, DeliveryStream},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn ConsumerHandler>,
    options: ConsumeOptions,
}

/// A handler registered for a queue, kept across reconnects.
pub(crate) struct Subscription {
    pub(crate) queue: String,
    registration: RwLock<Registration>,
    /// Connection generation the running consumer belongs to
    active: Mutex<Option<u64>>,
    /// Set while a setup retry is scheduled
    retry_pending: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(queue: &str, handler: Arc<dyn ConsumerHandler>, options: ConsumeOptions) -> Subscription {
        Subscription {
            queue: queue.to_owned(),
            registration: RwLock::new(Registration { handler, options }),
            active: Mutex::new(None),
            retry_pending: AtomicBool::new(false),
        }
    }

    /// Swaps the handler; deliveries already being handled finish with the old one.
    pub(crate) fn replace(&self, handler: Arc<dyn ConsumerHandler>, options: ConsumeOptions) {
        *self
            .registration
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Registration { handler, options };
    }

    pub(crate) fn options(&self) -> ConsumeOptions {
        self.registration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .options
            .clone()
    }

    /// Settlement context for the next delivery on `channel`.
    pub(crate) fn context(&self, channel: Arc<dyn BrokerChannel>, dead_letter_exchange: &str) -> ConsumerContext {
        let registration = self
            .registration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        ConsumerContext {
            queue: self.queue.clone(),
            handler: registration.handler,
            options: registration.options,
            dead_letter_exchange: dead_letter_exchange.to_owned(),
            channel,
        }
    }

    /// Marks the subscription as started on `generation`. Returns false when a
    /// consumer is already running on that connection.
    pub(crate) fn claim(&self, generation: u64) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if *active == Some(generation) {
            return false;
        }
        *active = Some(generation);
        true
    }

    /// Undoes a claim, unless a newer connection has claimed it since.
    pub(crate) fn release(&self, generation: u64) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if *active == Some(generation) {
            *active = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Reserves the single pending setup retry. False if one is already scheduled.
    pub(crate) fn take_retry_slot(&self) -> bool {
        !self.retry_pending.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_retry_slot(&self) {
        self.retry_pending.store(false, Ordering::SeqCst);
    }
}

/// Unique consumer tag for `queue`.
pub(crate) fn consumer_tag(queue: &str) -> String {
    format!("{queue}-{}", Uuid::new_v4())
}

/// Spawns the task draining `deliveries` through the consumer engine.
///
/// The stream ends when the channel goes away; the subscription is then
/// released so the next connection can start it again, and `on_end` runs.
pub(crate) fn spawn_consumer<F>(
    mut deliveries: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    dead_letter_exchange: String,
    subscription: Arc<Subscription>,
    generation: u64,
    on_end: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let tracer = global::tracer(CONSUMER_TRACER);

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    let cx = subscription.context(channel.clone(), &dead_letter_exchange);
                    if let Err(err) = handle_delivery(&tracer, delivery, &cx).await {
                        error!(error = err.to_string(), queue = %subscription.queue, "error consume msg");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), queue = %subscription.queue, "errors consume msg")
                }
            }
        }

        subscription.release(generation);
        warn!(queue = %subscription.queue, generation, "consumer stream ended");
        on_end();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::{handler_fn, ConsumerMessage},
        transport::{Delivery, MockBrokerChannel},
    };
    use futures_util::stream;
    use lapin::BasicProperties;
    use std::sync::atomic::AtomicU32;

    fn subscription() -> Arc<Subscription> {
        Arc::new(Subscription::new(
            "user.events",
            handler_fn(|_msg: ConsumerMessage| async { Ok(()) }),
            ConsumeOptions::default(),
        ))
    }

    fn delivery(tag: u64, routing_key: &str) -> Result<Delivery, crate::errors::AmqpError> {
        Ok(Delivery {
            delivery_tag: tag,
            exchange: "xnl_events".to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: b"{}".to_vec(),
        })
    }

    #[test]
    fn claims_once_per_generation() {
        let sub = subscription();

        assert!(sub.claim(1));
        assert!(!sub.claim(1));
        assert!(sub.is_active());

        // A newer connection takes over; releasing the old one is a no-op.
        assert!(sub.claim(2));
        sub.release(1);
        assert!(sub.is_active());

        sub.release(2);
        assert!(!sub.is_active());
    }

    #[test]
    fn single_retry_slot() {
        let sub = subscription();

        assert!(sub.take_retry_slot());
        assert!(!sub.take_retry_slot());
        sub.clear_retry_slot();
        assert!(sub.take_retry_slot());
    }

    #[test]
    fn replace_swaps_options() {
        let sub = subscription();
        sub.replace(
            handler_fn(|_msg: ConsumerMessage| async { Ok(()) }),
            ConsumeOptions::default().max_retries(7),
        );

        assert_eq!(sub.options().max_retries, 7);
    }

    #[test]
    fn tags_are_unique() {
        let a = consumer_tag("user.events");
        let b = consumer_tag("user.events");

        assert!(a.starts_with("user.events-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn drains_stream_in_order_then_releases() {
        let order = Arc::new(Mutex::new(vec![]));
        let seen = order.clone();

        let handler = handler_fn(move |msg: ConsumerMessage| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(msg.routing_key);
                Ok(())
            }
        });
        let sub = Arc::new(Subscription::new("user.events", handler, ConsumeOptions::default()));
        assert!(sub.claim(3));

        let mut channel = MockBrokerChannel::new();
        channel.expect_ack().times(2).returning(|_| Ok(()));

        let ended = Arc::new(AtomicU32::new(0));
        let flag = ended.clone();

        spawn_consumer(
            stream::iter(vec![delivery(1, "user.created"), delivery(2, "user.updated")]).boxed(),
            Arc::new(channel),
            "dead.letter.exchange".to_owned(),
            sub.clone(),
            3,
            move || {
                flag.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["user.created", "user.updated"]);
        assert!(!sub.is_active());
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }
}
