// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Runs a question-answering worker on the `qa_worker` queue and publishes a
//! few jobs to it.
//!
//! Needs a RabbitMQ broker; Redis is used for locks when reachable, otherwise
//! locks stay local to this process. Stop with Ctrl-C.

use async_trait::async_trait;
use rabbitmq_worker::{
    configs::Configs,
    connection::AmqpConnection,
    consumer::{ConsumeOptions, RabbitMQConsumer},
    errors::ProcessingError,
    job::JobMessage,
    lock::{InMemoryLockCoordinator, LockCoordinator, RedisLockCoordinator},
    publisher::RabbitMQPublisher,
    store::InMemoryJobStore,
    telemetry,
    topology::{AmqpTopology, Topology},
    worker::{JobProcessor, JobWorker},
};
use serde_json::{json, Value};
use std::{error::Error, sync::Arc, time::Duration};
use tracing::{info, warn};

const QUEUE: &str = "qa_worker";

struct QuestionAnswerer;

#[async_trait]
impl JobProcessor for QuestionAnswerer {
    fn resource_type(&self) -> &str {
        "document"
    }

    async fn process(&self, job: &JobMessage) -> Result<Value, ProcessingError> {
        let Some(question) = job.extra.get("question").and_then(Value::as_str) else {
            return Err(ProcessingError::permanent("job has no question"));
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!({ "question": question, "answer": "42" }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    telemetry::init_tracing();

    let cfg = Configs::from_env()?;
    let connection = AmqpConnection::new(&cfg);
    if !connection.connect().await {
        return Err("rabbitmq unreachable".into());
    }

    let locks: Arc<dyn LockCoordinator> = match RedisLockCoordinator::connect(&cfg.redis.url).await {
        Ok(redis) => Arc::new(redis),
        Err(err) => {
            warn!(error = err.to_string(), "redis unavailable, using in-process locks");
            Arc::new(InMemoryLockCoordinator::new())
        }
    };

    let store = Arc::new(InMemoryJobStore::new());
    let jobs: Vec<JobMessage> = (1..=3)
        .map(|job_id| JobMessage::new(job_id, 42).with_field("question", "what is the answer?"))
        .collect();
    for job in &jobs {
        store.insert_job(job.job_id, job.resource_id).await;
    }

    let worker = Arc::new(JobWorker::new(
        store,
        locks,
        Arc::new(QuestionAnswerer),
        Duration::from_secs(cfg.worker.lock_ttl_secs),
    ));

    let topology = AmqpTopology::new(connection.clone());
    if !topology.declare_queue(QUEUE, true, true).await {
        return Err("failure to declare queue".into());
    }

    RabbitMQConsumer::new(connection.clone())
        .consume::<JobMessage, _>(
            QUEUE,
            worker,
            ConsumeOptions {
                auto_ack: false,
                prefetch_count: cfg.worker.prefetch_count,
            },
        )
        .await?;

    let publisher = RabbitMQPublisher::new(connection.clone());
    let published = publisher.publish_batch(QUEUE, &jobs).await;
    info!(published = published, total = jobs.len(), "jobs published");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    connection.disconnect().await;

    Ok(())
}
