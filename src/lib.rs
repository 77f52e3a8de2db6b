// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Event messaging over a RabbitMQ topic exchange: a self-healing broker
//! client, topology declaration, publishing with retry and backoff, and
//! consumers that retry failed messages before parking them on a dead-letter
//! queue.

mod dispatcher;
mod otel;

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod transport;

pub use client::{BrokerClient, ConnectionState};
pub use config::BrokerConfig;
pub use consumer::ConsumeOptions;
pub use envelope::EventEnvelope;
pub use errors::AmqpError;
pub use handler::{handler_fn, ConsumerHandler, ConsumerMessage, HandlerError};
pub use publisher::{PublishOptions, Publisher};
