// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch and Retry Policy
//!
//! Turns inbound deliveries into handler calls and settles each one:
//!
//! 1. Trace context is extracted from the headers and a consumer span started.
//! 2. The body is decoded as JSON. A body that does not decode is rejected
//!    without requeue, so it lands in the dead-letter queue without a retry.
//! 3. The handler runs. Success acks the message.
//! 4. A retryable failure on the first delivery is requeued once. The same
//!    failure on a redelivery, or any permanent failure, rejects the message
//!    without requeue so the broker dead-letters it.
//!
//! Handlers run on a fixed-size pool of tasks reading from a bounded channel.
//! The pool size is the concurrency limit; once the channel is closed the pool
//! drains whatever it was already handed before exiting.

use crate::{errors::AmqpError, errors::ProcessingError, otel};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::FieldTable,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::{borrow::Cow, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Handles decoded messages of type `T`.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn exec(&self, ctx: &Context, payload: T) -> Result<(), ProcessingError>;
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; removed from the queue.
    Ack,
    /// Failed on first delivery; returned to the queue for one more attempt.
    Requeue,
    /// Rejected without requeue; routed to the dead-letter queue.
    DeadLetter,
    /// Consumed in auto-ack mode; the broker already removed it.
    AutoAcked,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn settle(&self, disposition: Disposition) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn settle(&self, disposition: Disposition) -> Result<(), AmqpError> {
        let (result, err) = match disposition {
            Disposition::Ack => (
                self.ack(BasicAckOptions { multiple: false }).await,
                AmqpError::AckMessageError,
            ),
            Disposition::Requeue | Disposition::DeadLetter => (
                self.nack(BasicNackOptions {
                    multiple: false,
                    requeue: disposition == Disposition::Requeue,
                })
                .await,
                AmqpError::NackMessageError,
            ),
            Disposition::AutoAcked => return Ok(()),
        };

        result.map_err(|e| {
            error!(error = e.to_string(), "failure to settle message");
            err
        })
    }
}

/// A delivery as seen by the dispatcher.
pub struct InboundMessage<A> {
    pub data: Vec<u8>,
    pub properties: AMQPProperties,
    pub redelivered: bool,
    pub acker: A,
}

impl From<Delivery> for InboundMessage<Acker> {
    fn from(delivery: Delivery) -> Self {
        InboundMessage {
            data: delivery.data,
            properties: delivery.properties,
            redelivered: delivery.redelivered,
            acker: delivery.acker,
        }
    }
}

impl<A> InboundMessage<A> {
    /// Whether the broker flagged this message as delivered before.
    ///
    /// The `x-death` history is not consulted: a message replayed from the
    /// dead-letter queue into its original queue starts a fresh retry budget.
    pub fn is_redelivery(&self) -> bool {
        self.redelivered
    }
}

/// Decision for a failed handler call.
///
/// Retryable failures get exactly one redelivery; everything else, and any
/// failure of a redelivered message, is dead-lettered.
pub fn failure_disposition(err: &ProcessingError, redelivered: bool) -> Disposition {
    if err.is_retryable() && !redelivered {
        Disposition::Requeue
    } else {
        Disposition::DeadLetter
    }
}

/// Handles one delivery end to end and returns how it was settled.
pub async fn dispatch<T, H, A>(
    tracer: &BoxedTracer,
    queue: &str,
    handler: &H,
    msg: InboundMessage<A>,
    auto_ack: bool,
) -> Disposition
where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + ?Sized,
    A: Acknowledger,
{
    let redelivered = msg.is_redelivery();
    let (ctx, mut span) = otel::consumer_span(&msg.properties, tracer, queue, redelivered);

    debug!(
        queue = queue,
        redelivered = redelivered,
        deaths = death_count(&msg.properties),
        "received message"
    );

    let disposition = match serde_json::from_slice::<T>(&msg.data) {
        Err(err) => {
            let err = ProcessingError::Malformed(err.to_string());
            warn!(error = err.to_string(), queue = queue, "dead-lettering malformed message");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("malformed message"),
            });
            Disposition::DeadLetter
        }
        Ok(payload) => match run_handler(handler, &ctx, payload).await {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Disposition::Ack
            }
            Err(err) => {
                span.record_error(&err);
                let disposition = failure_disposition(&err, redelivered);
                if disposition == Disposition::Requeue {
                    warn!(error = err.to_string(), queue = queue, "error handling msg, requeuing for later");
                    span.set_status(Status::Error {
                        description: Cow::from("requeued"),
                    });
                } else {
                    error!(error = err.to_string(), queue = queue, "error handling msg, sending to dlq");
                    span.set_status(Status::Error {
                        description: Cow::from("sent to dlq"),
                    });
                }
                disposition
            }
        },
    };

    if auto_ack {
        return Disposition::AutoAcked;
    }

    if let Err(err) = msg.acker.settle(disposition).await {
        span.record_error(&err);
    }

    disposition
}

/// Calls the handler, turning a panic into a transient failure so the
/// delivery is still settled and the calling task survives.
async fn run_handler<T, H>(handler: &H, ctx: &Context, payload: T) -> Result<(), ProcessingError>
where
    T: Send + 'static,
    H: ConsumerHandler<T> + ?Sized,
{
    // exec is called inside the guarded block so panics raised before the
    // future is returned are caught too.
    match AssertUnwindSafe(async { handler.exec(ctx, payload).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            error!(reason = reason, "handler panicked");
            Err(ProcessingError::transient(format!("handler panicked: {reason}")))
        }
    }
}

/// Fixed-size pool of handler tasks for one queue.
pub struct WorkerPool<T, H: ?Sized> {
    queue: String,
    handler: Arc<H>,
    size: usize,
    auto_ack: bool,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> WorkerPool<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: ConsumerHandler<T> + ?Sized + 'static,
{
    /// Creates a pool of handler tasks.
    ///
    /// # Parameters
    /// * `queue` - Queue name, used for spans and logs
    /// * `handler` - Shared by every task of the pool
    /// * `size` - Number of tasks, clamped to at least one
    /// * `auto_ack` - Whether deliveries were already settled by the broker
    ///
    /// # Returns
    /// A pool ready to [`run`](Self::run)
    pub fn new(queue: &str, handler: Arc<H>, size: usize, auto_ack: bool) -> Self {
        WorkerPool {
            queue: queue.to_owned(),
            handler,
            size: size.max(1),
            auto_ack,
            _payload: PhantomData,
        }
    }

    /// Number of concurrent handler calls.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs until `rx` is closed and empty. Every message received is settled
    /// before this returns.
    pub async fn run<A>(self, rx: mpsc::Receiver<InboundMessage<A>>)
    where
        A: Acknowledger + 'static,
    {
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();

        for _ in 0..self.size {
            let rx = rx.clone();
            let handler = self.handler.clone();
            let queue = self.queue.clone();
            let auto_ack = self.auto_ack;

            workers.spawn(async move {
                let tracer = global::tracer("amqp consumer");
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(msg) = next else {
                        break;
                    };
                    dispatch::<T, _, _>(&tracer, &queue, handler.as_ref(), msg, auto_ack).await;
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = err.to_string(), queue = self.queue, "consumer worker failed");
            }
        }
    }
}

/// Reads the delivery count from the first `x-death` entry, 0 when absent.
fn death_count(props: &AMQPProperties) -> i64 {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|value| value.as_long_long_int())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{
        types::{AMQPValue, FieldArray, LongLongInt, ShortString},
        BasicProperties,
    };
    use mockall::mock;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Job {
        job_id: i64,
    }

    mock! {
        Handler {}
        #[async_trait]
        impl ConsumerHandler<Job> for Handler {
            async fn exec(&self, ctx: &Context, payload: Job) -> Result<(), ProcessingError>;
        }
    }

    mock! {
        Ack {}
        #[async_trait]
        impl Acknowledger for Ack {
            async fn settle(&self, disposition: Disposition) -> Result<(), AmqpError>;
        }
    }

    fn acker_expecting(expected: Disposition) -> MockAck {
        let mut acker = MockAck::new();
        acker
            .expect_settle()
            .withf(move |d| *d == expected)
            .times(1)
            .returning(|_| Ok(()));
        acker
    }

    fn message(data: &[u8], redelivered: bool, acker: MockAck) -> InboundMessage<MockAck> {
        InboundMessage {
            data: data.to_vec(),
            properties: BasicProperties::default(),
            redelivered,
            acker,
        }
    }

    fn tracer() -> BoxedTracer {
        global::tracer("test")
    }

    #[test]
    fn retry_budget_is_one_redelivery() {
        let err = ProcessingError::transient("timeout");
        assert_eq!(failure_disposition(&err, false), Disposition::Requeue);
        assert_eq!(failure_disposition(&err, true), Disposition::DeadLetter);
    }

    #[test]
    fn permanent_failures_skip_the_retry() {
        let err = ProcessingError::permanent("unknown resource");
        assert_eq!(failure_disposition(&err, false), Disposition::DeadLetter);
    }

    fn dead_lettered_once() -> BasicProperties {
        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(1)),
        );
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );
        BasicProperties::default().with_headers(FieldTable::from(headers))
    }

    #[test]
    fn death_count_reads_first_x_death_entry() {
        assert_eq!(death_count(&dead_lettered_once()), 1);
        assert_eq!(death_count(&BasicProperties::default()), 0);
    }

    #[tokio::test]
    async fn replayed_dead_letter_gets_a_fresh_retry() {
        let mut handler = MockHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(ProcessingError::transient("timeout")));

        let msg = InboundMessage {
            data: br#"{"job_id": 3}"#.to_vec(),
            properties: dead_lettered_once(),
            redelivered: false,
            acker: acker_expecting(Disposition::Requeue),
        };
        assert!(!msg.is_redelivery());

        let disposition = dispatch::<Job, _, _>(&tracer(), "q", &handler, msg, false).await;
        assert_eq!(disposition, Disposition::Requeue);
    }

    struct Panicking;

    #[async_trait]
    impl ConsumerHandler<Job> for Panicking {
        async fn exec(&self, _ctx: &Context, _payload: Job) -> Result<(), ProcessingError> {
            panic!("index out of bounds")
        }
    }

    #[tokio::test]
    async fn handler_panic_is_settled_as_failure() {
        let handler = Panicking;

        let first = message(br#"{"job_id": 1}"#, false, acker_expecting(Disposition::Requeue));
        let disposition = dispatch::<Job, _, _>(&tracer(), "q", &handler, first, false).await;
        assert_eq!(disposition, Disposition::Requeue);

        let again = message(br#"{"job_id": 1}"#, true, acker_expecting(Disposition::DeadLetter));
        let disposition = dispatch::<Job, _, _>(&tracer(), "q", &handler, again, false).await;
        assert_eq!(disposition, Disposition::DeadLetter);
    }

    #[tokio::test]
    async fn success_is_acked() {
        let mut handler = MockHandler::new();
        handler
            .expect_exec()
            .withf(|_, job| job.job_id == 7)
            .times(1)
            .returning(|_, _| Ok(()));

        let msg = message(br#"{"job_id": 7}"#, false, acker_expecting(Disposition::Ack));
        let disposition = dispatch::<Job, _, _>(&tracer(), "q", &handler, msg, false).await;

        assert_eq!(disposition, Disposition::Ack);
    }

    #[tokio::test]
    async fn malformed_body_never_reaches_handler() {
        let mut handler = MockHandler::new();
        handler.expect_exec().never();

        let msg = message(b"not json", false, acker_expecting(Disposition::DeadLetter));
        let disposition = dispatch::<Job, _, _>(&tracer(), "q", &handler, msg, false).await;

        assert_eq!(disposition, Disposition::DeadLetter);
    }

    #[tokio::test]
    async fn auto_ack_sends_nothing_to_the_broker() {
        let mut handler = MockHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(ProcessingError::transient("boom")));
        let mut acker = MockAck::new();
        acker.expect_settle().never();

        let msg = message(br#"{"job_id": 1}"#, false, acker);
        let disposition = dispatch::<Job, _, _>(&tracer(), "q", &handler, msg, true).await;

        assert_eq!(disposition, Disposition::AutoAcked);
    }

    #[tokio::test]
    async fn settle_failure_does_not_change_the_decision() {
        let mut handler = MockHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(ProcessingError::transient("boom")));
        let mut acker = MockAck::new();
        acker
            .expect_settle()
            .times(1)
            .returning(|_| Err(AmqpError::NackMessageError));

        let msg = message(br#"{"job_id": 1}"#, false, acker);
        let disposition = dispatch::<Job, _, _>(&tracer(), "q", &handler, msg, false).await;

        assert_eq!(disposition, Disposition::Requeue);
    }
}
