// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Declarative description of a queue and its dead-letter wiring. A queue with
//! DLQ support gets a direct dead-letter exchange `{name}.dlx` and a bounded
//! dead-letter queue `{name}.dlq`; the main queue's dead-letter arguments point
//! at that exchange. Those arguments only take effect at declare time, so they
//! are derived here once and never attached afterwards.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Dead-lettered messages are kept for 24 hours.
pub const DLQ_MESSAGE_TTL_MS: i32 = 24 * 60 * 60 * 1000;
/// Upper bound on the number of messages held by a dead-letter queue.
pub const DLQ_MAX_LENGTH: i32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) dlq_enabled: bool,
}

impl QueueDefinition {
    /// A transient queue without dead-lettering.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            dlq_enabled: false,
        }
    }

    /// Makes the queue survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Wires the queue to a dead-letter exchange and queue.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_enabled = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlx_name(&self) -> Option<String> {
        self.dlq_enabled.then(|| format!("{}.dlx", self.name))
    }

    pub fn dlq_name(&self) -> Option<String> {
        self.dlq_enabled.then(|| format!("{}.dlq", self.name))
    }

    /// Arguments for declaring the main queue.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(dlx) = self.dlx_name() {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(dlx)),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(self.name.clone())),
            );
        }

        FieldTable::from(args)
    }

    /// Arguments for declaring the dead-letter queue: bounded age and length.
    pub fn dlq_arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(DLQ_MESSAGE_TTL_MS)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(DLQ_MAX_LENGTH)),
        );
        FieldTable::from(args)
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// A binding whose routing key defaults to the queue name.
    pub fn new(queue: &str, exchange: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: exchange.to_owned(),
            routing_key: queue.to_owned(),
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
