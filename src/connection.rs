// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! Owns the single connection and channel a worker process uses to talk to
//! RabbitMQ. The connection is opened on demand: every publisher, topology and
//! consumer operation asks for the channel, and a missing or dropped session is
//! reopened at that point. There is no background heartbeat monitor, so a
//! broken connection is only noticed by the next operation.
//!
//! Consumer tasks started on the channel are tracked here so `disconnect` can
//! stop and drain them before the channel goes away.

use crate::{configs::Configs, configs::RabbitMQConfigs, errors::AmqpError};
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;

struct Session {
    conn: Connection,
    channel: Arc<Channel>,
}

impl Session {
    fn is_connected(&self) -> bool {
        self.conn.status().connected() && self.channel.status().connected()
    }
}

/// A running consumer subscription and the switch that stops it.
pub(crate) struct ConsumerTask {
    queue: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConsumerTask {
    pub(crate) fn new(queue: &str, shutdown: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        Self {
            queue: queue.to_owned(),
            shutdown,
            handle,
        }
    }

    /// Signals the task and waits until every in-flight delivery is settled.
    async fn stop(self) {
        debug!(queue = self.queue, "stopping consumer");
        // The receiver is gone if the task already exited; joining still applies.
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            error!(error = err.to_string(), queue = self.queue, "consumer task failed");
        }
    }
}

/// Lazily connected AMQP session shared by the publisher, topology manager and
/// consumers of one process.
pub struct AmqpConnection {
    cfg: RabbitMQConfigs,
    name: String,
    session: Mutex<Option<Session>>,
    consumers: Mutex<Vec<ConsumerTask>>,
}

impl AmqpConnection {
    /// Creates an unconnected manager. Nothing touches the network until the
    /// first operation or an explicit `connect`.
    ///
    /// # Parameters
    /// * `cfg` - Application configs; the `rabbitmq` section gives the broker
    ///   address and `app.name` names the connection
    ///
    /// # Returns
    /// A shared handle for the publisher, topology manager and consumers
    pub fn new(cfg: &Configs) -> Arc<AmqpConnection> {
        Arc::new(AmqpConnection {
            cfg: cfg.rabbitmq.clone(),
            name: cfg.app.name.clone(),
            session: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
        })
    }

    /// Opens the connection and channel if they are not already open.
    ///
    /// # Returns
    /// `true` when a session is open, `false` when the broker could not be
    /// reached. Callers decide whether and when to retry.
    pub async fn connect(&self) -> bool {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(Session::is_connected) {
            return true;
        }

        match self.open().await {
            Ok(opened) => {
                *session = Some(opened);
                true
            }
            Err(_) => false,
        }
    }

    /// Whether a session is open and both its connection and channel are live.
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(Session::is_connected)
    }

    /// Returns the open channel, reconnecting first when needed.
    ///
    /// # Returns
    /// The confirm-mode channel, or `AmqpError::ConnectionError` /
    /// `AmqpError::ChannelError` when the session cannot be reopened
    pub async fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref().filter(|s| s.is_connected()) {
            return Ok(current.channel.clone());
        }

        if session.is_some() {
            warn!("amqp session lost, reconnecting");
        }

        let opened = self.open().await?;
        let channel = opened.channel.clone();
        *session = Some(opened);
        Ok(channel)
    }

    pub(crate) async fn track_consumer(&self, task: ConsumerTask) {
        self.consumers.lock().await.push(task);
    }

    /// Stops every tracked consumer, waiting for their in-flight messages,
    /// then closes the channel and the connection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let tasks = std::mem::take(&mut *self.consumers.lock().await);
        for task in tasks {
            task.stop().await;
        }

        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        if session.channel.status().connected() {
            if let Err(err) = session.channel.close(REPLY_SUCCESS, "bye").await {
                warn!(error = err.to_string(), "failure to close channel");
            }
        }

        if session.conn.status().connected() {
            if let Err(err) = session.conn.close(REPLY_SUCCESS, "bye").await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }

        info!("amqp disconnected");
    }

    async fn open(&self) -> Result<Session, AmqpError> {
        debug!("creating amqp connection...");
        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(self.name.clone()));

        let conn = match Connection::connect(&self.cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), host = self.cfg.host, "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        // Publisher confirms back the boolean result of every publish.
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }
        debug!("channel created");

        Ok(Session {
            conn,
            channel: Arc::new(channel),
        })
    }
}
