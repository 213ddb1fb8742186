// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Error enums for every layer of the worker: broker transport (`AmqpError`),
//! job processing (`ProcessingError`), the distributed lock (`LockError`), the
//! job record store (`StoreError`) and configuration loading (`ConfigError`).
//!
//! Transport errors stay inside the Publisher/Topology boundary, where they are
//! logged and turned into boolean results. Processing errors drive the
//! consumer's retry and dead-letter decision.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error serializing an outgoing payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker confirmed the publish negatively
    #[error("publish was nacked by the broker")]
    PublishNackedError,

    /// A mandatory publish could not be routed to any queue
    #[error("message returned as unroutable")]
    UnroutableMessageError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),
}

/// Failure reported by a message handler.
///
/// The variant decides how the consumer settles the delivery: transient
/// failures get one redelivery before dead-lettering, permanent and malformed
/// ones are dead-lettered straight away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The message body could not be decoded into the handler's payload.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProcessingError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ProcessingError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        ProcessingError::Permanent(msg.into())
    }

    /// Whether a redelivery could succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::Transient(_))
    }
}

/// Errors raised by a lock store. Contention is not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock store connection error: {0}")]
    Connection(String),

    #[error("lock store error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            LockError::Connection(err.to_string())
        } else {
            LockError::Backend(err.to_string())
        }
    }
}

/// Errors raised by a job record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("job `{0}` not found")]
    NotFound(i64),

    #[error("store error: {0}")]
    Backend(String),
}

/// Errors raised while loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failure to parse configuration: {0}")]
    Parse(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<StoreError> for ProcessingError {
    fn from(err: StoreError) -> Self {
        ProcessingError::Transient(err.to_string())
    }
}

impl From<LockError> for ProcessingError {
    fn from(err: LockError) -> Self {
        ProcessingError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(ProcessingError::transient("timeout").is_retryable());
        assert!(!ProcessingError::permanent("bad input").is_retryable());
        assert!(!ProcessingError::Malformed("eof".into()).is_retryable());
    }

    #[test]
    fn store_and_lock_failures_map_to_transient() {
        let err: ProcessingError = StoreError::Backend("down".into()).into();
        assert_eq!(err, ProcessingError::Transient("store error: down".into()));

        let err: ProcessingError = LockError::Connection("refused".into()).into();
        assert!(err.is_retryable());
    }
}
