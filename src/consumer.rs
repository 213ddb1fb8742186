// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Subscribes a handler to a queue. The queue is declared with dead-letter
//! support, the broker prefetch is set, and a background task forwards
//! deliveries into a [`WorkerPool`] of `prefetch_count` handler tasks.
//!
//! Prefetch bounds how many unacknowledged messages the broker hands over;
//! the pool size bounds how many are processed at once. The task is tracked by
//! the [`AmqpConnection`], whose `disconnect` stops the subscription and waits
//! for the pool to settle every message it already received.

use crate::{
    connection::{AmqpConnection, ConsumerTask},
    dispatcher::{Acknowledger, ConsumerHandler, InboundMessage, WorkerPool},
    errors::AmqpError,
    queue::QueueDefinition,
    topology::AmqpTopology,
};
use futures_util::{Stream, StreamExt};
use lapin::{
    acker::Acker,
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use serde::de::DeserializeOwned;
use std::{fmt, future::Future, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Subscription settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Let the broker consider messages settled on delivery. Failed messages
    /// are then lost instead of retried.
    pub auto_ack: bool,
    /// Broker prefetch and handler pool size.
    pub prefetch_count: u16,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            auto_ack: false,
            prefetch_count: 1,
        }
    }
}

/// Starts subscriptions on the shared AMQP connection.
pub struct RabbitMQConsumer {
    connection: Arc<AmqpConnection>,
    topology: AmqpTopology,
}

impl RabbitMQConsumer {
    /// Creates a consumer on the shared connection.
    ///
    /// # Parameters
    /// * `connection` - The process-wide AMQP connection
    ///
    /// # Returns
    /// A new RabbitMQConsumer instance
    pub fn new(connection: Arc<AmqpConnection>) -> RabbitMQConsumer {
        RabbitMQConsumer {
            topology: AmqpTopology::new(connection.clone()),
            connection,
        }
    }

    /// Subscribes `handler` to `queue` and returns once the subscription is
    /// live. Messages are handled in the background until the connection is
    /// disconnected or the broker ends the subscription.
    ///
    /// # Parameters
    /// * `queue` - Queue to subscribe to; it is declared durable with a DLQ
    /// * `handler` - Receives every decoded message
    /// * `options` - Acknowledgement mode and prefetch, which is also the
    ///   number of concurrent handler calls
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the subscription, or the error of the
    /// declaration, qos or consume step that failed
    pub async fn consume<T, H>(
        &self,
        queue: &str,
        handler: Arc<H>,
        options: ConsumeOptions,
    ) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        H: ConsumerHandler<T> + ?Sized + 'static,
    {
        let prefetch_count = options.prefetch_count.max(1);

        self.topology
            .try_declare_queue(&QueueDefinition::new(queue).durable().with_dlq())
            .await?;

        let channel = self.connection.channel().await?;

        if let Err(err) = channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), queue = queue, "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
        }

        let consumer = match channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        info!(
            queue = queue,
            prefetch_count = prefetch_count,
            auto_ack = options.auto_ack,
            "consumer started"
        );

        let pool = WorkerPool::<T, H>::new(queue, handler, prefetch_count as usize, options.auto_ack);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_subscription(channel, consumer, pool, shutdown_rx));

        self.connection
            .track_consumer(ConsumerTask::new(queue, shutdown_tx, handle))
            .await;

        Ok(())
    }
}

/// Feeds lapin deliveries to the pool. The broker consumer is cancelled once
/// the feed stops reading and before the pool drains.
async fn run_subscription<T, H>(
    channel: Arc<Channel>,
    consumer: lapin::Consumer,
    pool: WorkerPool<T, H>,
    shutdown: watch::Receiver<bool>,
) where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + ?Sized + 'static,
{
    let tag = consumer.tag().as_str().to_owned();

    let cancel = {
        let tag = tag.clone();
        async move {
            if !channel.status().connected() {
                return;
            }
            if let Err(err) = channel
                .basic_cancel(&tag, BasicCancelOptions { nowait: false })
                .await
            {
                warn!(error = err.to_string(), consumer_tag = tag, "failure to cancel consumer");
            }
        }
    };

    let deliveries = consumer.map(|delivery| delivery.map(InboundMessage::<Acker>::from));
    feed_pool(&tag, deliveries, pool, shutdown, cancel).await;
}

/// Forwards `deliveries` to the pool until shutdown is signalled or the
/// stream ends. Then it runs `cancel`, closes the pool's feed and waits for
/// every message already handed over to be settled.
pub(crate) async fn feed_pool<T, H, A, S, E, C>(
    tag: &str,
    mut deliveries: S,
    pool: WorkerPool<T, H>,
    mut shutdown: watch::Receiver<bool>,
    cancel: C,
) where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + ?Sized + 'static,
    A: Acknowledger + 'static,
    S: Stream<Item = Result<InboundMessage<A>, E>> + Unpin,
    E: fmt::Display,
    C: Future<Output = ()>,
{
    let (tx, rx) = mpsc::channel::<InboundMessage<A>>(pool.size());
    let workers = tokio::spawn(pool.run(rx));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(consumer_tag = tag, "shutdown requested");
                    break;
                }
            }
            next = deliveries.next() => match next {
                Some(Ok(msg)) => {
                    if tx.send(msg).await.is_err() {
                        error!(consumer_tag = tag, "worker pool stopped unexpectedly");
                        break;
                    }
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), consumer_tag = tag, "errors consume msg");
                    break;
                }
                None => {
                    warn!(consumer_tag = tag, "subscription ended by broker");
                    break;
                }
            }
        }
    }

    cancel.await;

    drop(tx);
    if let Err(err) = workers.await {
        error!(error = err.to_string(), consumer_tag = tag, "worker pool failed");
    }

    info!(consumer_tag = tag, "consumer stopped");
}
