// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Bus
//!
//! `AmqpError` covers every broker-side failure the messaging core can observe:
//! connection and channel setup, topology declaration, publishing, consuming and
//! message settlement. These errors stay inside the crate's recovery paths; the
//! collaborator-facing operations (`publish`, `consume`) translate them into a
//! boolean result or a scheduled retry.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The client holds no open connection
    #[error("not connected")]
    NotConnected,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error republishing a message for a later retry
    #[error("failure to requeue message")]
    RequeuingMessageError,

    /// Error publishing a message to the dead-letter exchange
    #[error("failure to publish to dlq")]
    PublishingToDLQError,

    /// Error creating a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
