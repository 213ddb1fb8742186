// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares queues, exchanges and bindings, including the dead-letter exchange
//! and queue pair of every DLQ-enabled queue. All declarations are idempotent:
//! declaring the same thing with the same parameters twice succeeds.
//!
//! The public operations report success as a boolean and log transport
//! errors; the fallible `try_*` forms are used by the publisher and consumer.

use crate::{
    connection::AmqpConnection,
    errors::AmqpError,
    exchange::ExchangeKind,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Interface for declaring broker topology.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Declares `name`. With `dlq_enabled` the dead-letter exchange and queue
    /// are declared and bound first, and the queue is wired to them.
    async fn declare_queue(&self, name: &str, durable: bool, dlq_enabled: bool) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> bool;

    /// Binds `queue` to `exchange`. The routing key defaults to the queue name.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: Option<&str>) -> bool;
}

/// Topology manager backed by the shared AMQP connection.
#[derive(Clone)]
pub struct AmqpTopology {
    connection: Arc<AmqpConnection>,
}

impl AmqpTopology {
    /// Creates a topology manager on the shared connection.
    ///
    /// # Parameters
    /// * `connection` - The process-wide AMQP connection
    pub fn new(connection: Arc<AmqpConnection>) -> AmqpTopology {
        AmqpTopology { connection }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare_queue(&self, name: &str, durable: bool, dlq_enabled: bool) -> bool {
        let mut def = QueueDefinition::new(name);
        if durable {
            def = def.durable();
        }
        if dlq_enabled {
            def = def.with_dlq();
        }

        self.try_declare_queue(&def).await.is_ok()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> bool {
        self.try_declare_exchange(name, kind, durable).await.is_ok()
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: Option<&str>) -> bool {
        let mut binding = QueueBinding::new(queue, exchange);
        if let Some(key) = routing_key {
            binding = binding.routing_key(key);
        }

        self.try_bind_queue(&binding).await.is_ok()
    }
}

impl AmqpTopology {
    pub(crate) async fn try_declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", name);
        let channel = self.connection.channel().await?;

        match channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                kind.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", name);
                Ok(())
            }
        }
    }

    /// Declares the queue described by `def`, dead-letter topology included.
    pub(crate) async fn try_declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if def.dlq_enabled {
            self.declare_dlq(def).await?;
        }

        self.raw_declare_queue(&def.name, def.durable, def.arguments())
            .await
    }

    /// Declares `{name}.dlx` and `{name}.dlq` and binds them with the original
    /// queue name as routing key, matching the main queue's
    /// `x-dead-letter-routing-key`.
    async fn declare_dlq(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let (Some(dlx_name), Some(dlq_name)) = (def.dlx_name(), def.dlq_name()) else {
            return Ok(());
        };

        self.try_declare_exchange(&dlx_name, ExchangeKind::Direct, true)
            .await?;
        self.raw_declare_queue(&dlq_name, true, def.dlq_arguments())
            .await?;
        self.try_bind_queue(&QueueBinding::new(&dlq_name, &dlx_name).routing_key(&def.name))
            .await
    }

    async fn raw_declare_queue(
        &self,
        name: &str,
        durable: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", name);
        let channel = self.connection.channel().await?;

        match channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }

    pub(crate) async fn try_bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        let channel = self.connection.channel().await?;

        match channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");

                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::Configs;

    #[tokio::test]
    async fn declarations_report_false_when_broker_is_down() {
        let mut cfg = Configs::default();
        cfg.rabbitmq.host = "127.0.0.1".to_owned();
        cfg.rabbitmq.port = 1;
        let topology = AmqpTopology::new(AmqpConnection::new(&cfg));

        assert!(!topology.declare_queue("qa_worker", true, true).await);
        assert!(
            !topology
                .declare_exchange("jobs", ExchangeKind::Topic, true)
                .await
        );
        assert!(!topology.bind_queue("qa_worker", "jobs", None).await);
    }
}
