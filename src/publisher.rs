// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes JSON messages to queues with delivery guarantees: the target queue
//! is declared (with dead-letter support) before sending, messages are
//! persistent, the `mandatory` flag makes unroutable messages come back instead
//! of vanishing, and every publish waits for the broker's confirm.
//!
//! Failures are logged and reported as `false` (or a lower batch count), never
//! raised, so call sites only need to check the result.

use crate::{
    connection::AmqpConnection,
    errors::AmqpError,
    otel,
    queue::QueueDefinition,
    topology::AmqpTopology,
};
use futures_util::future::join_all;
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::ShortString,
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message ready to be handed to the broker.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

impl Envelope {
    /// Serializes `message` and stamps it with trace context from `ctx`, a
    /// fresh message id, the JSON content type and persistent delivery.
    pub fn build<T>(ctx: &Context, exchange: &str, queue: &str, message: &T) -> Result<Envelope, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), queue = queue, "failure to serialize message");
            AmqpError::SerializePayloadError
        })?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(otel::inject(ctx));

        Ok(Envelope {
            exchange: exchange.to_owned(),
            routing_key: queue.to_owned(),
            body,
            properties,
        })
    }
}

/// Publisher over the shared AMQP connection.
pub struct RabbitMQPublisher {
    connection: Arc<AmqpConnection>,
    topology: AmqpTopology,
}

impl RabbitMQPublisher {
    /// Creates a publisher on the shared connection.
    ///
    /// # Parameters
    /// * `connection` - The process-wide AMQP connection
    ///
    /// # Returns
    /// A shareable RabbitMQPublisher instance
    pub fn new(connection: Arc<AmqpConnection>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            topology: AmqpTopology::new(connection.clone()),
            connection,
        })
    }

    /// Publishes `message` to `queue` through `exchange` (`""` for the default
    /// exchange), propagating the current trace context.
    ///
    /// # Parameters
    /// * `queue` - Destination queue, declared durable with a DLQ if missing
    /// * `message` - Serialized as the JSON body
    /// * `exchange` - Exchange to publish through
    ///
    /// # Returns
    /// `true` only when the broker confirmed and routed the message
    pub async fn publish<T>(&self, queue: &str, message: &T, exchange: &str) -> bool
    where
        T: Serialize + Sync + ?Sized,
    {
        self.publish_with_context(&Context::current(), queue, message, exchange)
            .await
    }

    /// Same as [`publish`](Self::publish) with an explicit parent context.
    pub async fn publish_with_context<T>(
        &self,
        ctx: &Context,
        queue: &str,
        message: &T,
        exchange: &str,
    ) -> bool
    where
        T: Serialize + Sync + ?Sized,
    {
        if self.declare(queue).await.is_err() {
            return false;
        }

        let Ok(envelope) = Envelope::build(ctx, exchange, queue, message) else {
            return false;
        };

        self.send(envelope).await.is_ok()
    }

    /// Publishes every message to `queue` concurrently and returns how many
    /// were confirmed.
    ///
    /// The queue is declared once and all envelopes are built before anything
    /// is sent. A count lower than `messages.len()` means some publishes
    /// failed; callers needing per-message results should loop over
    /// [`publish`](Self::publish) instead.
    ///
    /// # Returns
    /// The number of messages the broker confirmed
    pub async fn publish_batch<T>(&self, queue: &str, messages: &[T]) -> usize
    where
        T: Serialize + Sync,
    {
        if messages.is_empty() {
            return 0;
        }

        if self.declare(queue).await.is_err() {
            return 0;
        }

        let ctx = Context::current();
        let envelopes: Vec<Envelope> = messages
            .iter()
            .filter_map(|message| Envelope::build(&ctx, "", queue, message).ok())
            .collect();

        let published = join_all(envelopes.into_iter().map(|envelope| self.send(envelope)))
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();

        if published < messages.len() {
            warn!(
                queue = queue,
                requested = messages.len(),
                published = published,
                "batch publish partially failed"
            );
        }

        published
    }

    async fn declare(&self, queue: &str) -> Result<(), AmqpError> {
        self.topology
            .try_declare_queue(&QueueDefinition::new(queue).durable().with_dlq())
            .await
    }

    async fn send(&self, envelope: Envelope) -> Result<(), AmqpError> {
        let channel = self.connection.channel().await?;

        let confirm = match channel
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: true,
                },
                &envelope.body,
                envelope.properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => {
                debug!(routing_key = envelope.routing_key, "message published");
                Ok(())
            }
            Ok(Confirmation::Ack(Some(_))) => {
                error!(
                    exchange = envelope.exchange,
                    routing_key = envelope.routing_key,
                    "message returned as unroutable"
                );
                Err(AmqpError::UnroutableMessageError)
            }
            Ok(Confirmation::Nack(_)) => {
                error!(routing_key = envelope.routing_key, "publish nacked by broker");
                Err(AmqpError::PublishNackedError)
            }
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::PublishingError)
            }
        }
    }
}
