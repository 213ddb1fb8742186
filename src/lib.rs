// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable RabbitMQ client and lock-coordinated job worker.
//!
//! One [`AmqpConnection`](connection::AmqpConnection) per process is shared by
//! the [`RabbitMQPublisher`](publisher::RabbitMQPublisher), the
//! [`AmqpTopology`](topology::AmqpTopology) manager and the
//! [`RabbitMQConsumer`](consumer::RabbitMQConsumer). Consumers hand decoded
//! messages to a [`ConsumerHandler`](dispatcher::ConsumerHandler); the
//! [`JobWorker`](worker::JobWorker) is the handler that serializes work per
//! resource through a [`LockCoordinator`](lock::LockCoordinator).

mod otel;

pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod job;
pub mod lock;
pub mod publisher;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod topology;
pub mod worker;
