// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use opentelemetry::{global, Context};
use rabbitmq_worker::{
    dispatcher::{dispatch, Acknowledger, ConsumerHandler, Disposition, InboundMessage, WorkerPool},
    errors::{AmqpError, ProcessingError},
    job::JobMessage,
};
use lapin::BasicProperties;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// Records every settlement instead of talking to a broker.
#[derive(Clone, Default)]
struct Recorder {
    settled: Arc<Mutex<Vec<Disposition>>>,
}

impl Recorder {
    fn settled(&self) -> Vec<Disposition> {
        self.settled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Acknowledger for Recorder {
    async fn settle(&self, disposition: Disposition) -> Result<(), AmqpError> {
        self.settled.lock().unwrap().push(disposition);
        Ok(())
    }
}

/// Fails the first `failures` calls, then succeeds.
struct FailsTimes {
    failures: usize,
    calls: AtomicUsize,
}

impl FailsTimes {
    fn new(failures: usize) -> Self {
        FailsTimes {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerHandler<JobMessage> for FailsTimes {
    async fn exec(&self, _ctx: &Context, _payload: JobMessage) -> Result<(), ProcessingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(ProcessingError::transient("downstream unavailable"))
        } else {
            Ok(())
        }
    }
}

fn inbound(body: &[u8], redelivered: bool, acker: Recorder) -> InboundMessage<Recorder> {
    InboundMessage {
        data: body.to_vec(),
        properties: BasicProperties::default(),
        redelivered,
        acker,
    }
}

/// Delivers `body` the way the broker would: a requeued message comes back
/// flagged as redelivered, anything else ends the exchange.
async fn deliver<H>(handler: &H, body: &[u8]) -> Vec<Disposition>
where
    H: ConsumerHandler<JobMessage>,
{
    let tracer = global::tracer("test");
    let recorder = Recorder::default();
    let mut redelivered = false;

    loop {
        let msg = inbound(body, redelivered, recorder.clone());
        let disposition = dispatch::<JobMessage, _, _>(&tracer, "qa_worker", handler, msg, false).await;
        if disposition != Disposition::Requeue {
            break;
        }
        redelivered = true;
    }

    recorder.settled()
}

const JOB: &[u8] = br#"{"job_id": 1, "resource_id": 42}"#;

#[tokio::test]
async fn one_failure_then_success_is_acked_on_redelivery() {
    let handler = FailsTimes::new(1);

    let settled = deliver(&handler, JOB).await;

    assert_eq!(settled, vec![Disposition::Requeue, Disposition::Ack]);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn repeated_failure_is_dead_lettered_once() {
    let handler = FailsTimes::new(usize::MAX);

    let settled = deliver(&handler, JOB).await;

    assert_eq!(settled, vec![Disposition::Requeue, Disposition::DeadLetter]);
    let dead_lettered = settled
        .iter()
        .filter(|d| **d == Disposition::DeadLetter)
        .count();
    assert_eq!(dead_lettered, 1);
}

#[tokio::test]
async fn malformed_body_goes_straight_to_dlq() {
    let handler = FailsTimes::new(0);

    for body in [&b"{not json"[..], &br#"{"job_id": 1}"#[..]] {
        let settled = deliver(&handler, body).await;
        assert_eq!(settled, vec![Disposition::DeadLetter]);
    }

    assert_eq!(handler.calls(), 0);
}

/// Sleeps while tracking how many calls overlap.
#[derive(Default)]
struct Slow {
    running: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl ConsumerHandler<JobMessage> for Slow {
    async fn exec(&self, _ctx: &Context, _payload: JobMessage) -> Result<(), ProcessingError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_size_bounds_concurrency_and_drains_on_close() {
    let handler = Arc::new(Slow::default());
    let recorder = Recorder::default();
    let pool = WorkerPool::<JobMessage, _>::new("qa_worker", handler.clone(), 3, false);
    let (tx, rx) = mpsc::channel(pool.size());

    let running = tokio::spawn(pool.run(rx));
    for _ in 0..10 {
        tx.send(inbound(JOB, false, recorder.clone())).await.unwrap();
    }
    drop(tx);
    running.await.unwrap();

    assert_eq!(handler.done.load(Ordering::SeqCst), 10);
    assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(recorder.settled(), vec![Disposition::Ack; 10]);
}

/// Panics on its first call only.
#[derive(Default)]
struct PanicsOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl ConsumerHandler<JobMessage> for PanicsOnce {
    async fn exec(&self, _ctx: &Context, _payload: JobMessage) -> Result<(), ProcessingError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("handler bug");
        }
        Ok(())
    }
}

#[tokio::test]
async fn panicking_handler_is_settled_and_pool_keeps_running() {
    let handler = Arc::new(PanicsOnce::default());
    let recorder = Recorder::default();
    let pool = WorkerPool::<JobMessage, _>::new("qa_worker", handler.clone(), 1, false);
    let (tx, rx) = mpsc::channel(3);

    for _ in 0..3 {
        tx.send(inbound(JOB, false, recorder.clone())).await.unwrap();
    }
    drop(tx);
    pool.run(rx).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        recorder.settled(),
        vec![Disposition::Requeue, Disposition::Ack, Disposition::Ack]
    );
}

#[tokio::test]
async fn zero_sized_pool_still_processes() {
    let handler = Arc::new(Slow::default());
    let recorder = Recorder::default();
    let pool = WorkerPool::<JobMessage, _>::new("qa_worker", handler.clone(), 0, false);
    assert_eq!(pool.size(), 1);

    let (tx, rx) = mpsc::channel(1);
    let running = tokio::spawn(pool.run(rx));
    tx.send(inbound(JOB, false, recorder.clone())).await.unwrap();
    drop(tx);
    running.await.unwrap();

    assert_eq!(recorder.settled(), vec![Disposition::Ack]);
}
