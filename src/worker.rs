// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lock-Coordinated Job Worker
//!
//! Turns at-least-once delivery into effectively-once processing. Before a job
//! touches its resource the worker takes the resource lock; inside the lock it
//! checks whether an earlier delivery already completed the resource, and only
//! then runs the processor.
//!
//! | Situation                       | Job status   | `error_message`         |
//! |---------------------------------|--------------|-------------------------|
//! | lock held by another worker     | `COMPLETED`  | [`SKIPPED_LOCKED_NOTE`] |
//! | resource already completed      | `COMPLETED`  | [`ALREADY_COMPLETED_NOTE`] |
//! | processor succeeded             | `COMPLETED`  | none                    |
//! | processor failed                | `FAILED`     | the error               |
//!
//! A failure is returned to the consumer after the lock is released, so the
//! consumer's retry and dead-letter policy decides what happens to the message.

use crate::{
    dispatcher::ConsumerHandler,
    errors::ProcessingError,
    job::{JobMessage, JobStatus},
    lock::{resource_key, LockCoordinator},
    store::JobStore,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// Note stored when the resource lock was held by another worker.
pub const SKIPPED_LOCKED_NOTE: &str = "skipped: another worker is processing this resource";
/// Note stored when the resource was found already completed.
pub const ALREADY_COMPLETED_NOTE: &str = "skipped: resource already completed";

/// Business logic for one job type.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Resource type the jobs mutate; first half of the lock key.
    fn resource_type(&self) -> &str;

    /// Does the work and returns the result to persist on the resource.
    async fn process(&self, job: &JobMessage) -> Result<Value, ProcessingError>;
}

/// What the worker did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Processed,
    SkippedLocked,
    AlreadyCompleted,
}

pub struct JobWorker<S: ?Sized, L: ?Sized, P: ?Sized> {
    store: Arc<S>,
    locks: Arc<L>,
    processor: Arc<P>,
    lock_ttl: Duration,
}

impl<S, L, P> JobWorker<S, L, P>
where
    S: JobStore + ?Sized,
    L: LockCoordinator + ?Sized,
    P: JobProcessor + ?Sized,
{
    /// Creates a job worker.
    ///
    /// # Parameters
    /// * `store` - Job and resource records
    /// * `locks` - Coordinator shared with every other worker of the same jobs
    /// * `processor` - Business logic for the job type
    /// * `lock_ttl` - How long a resource lock lives; must cover the longest
    ///   expected processing time
    ///
    /// # Returns
    /// A new JobWorker instance
    pub fn new(store: Arc<S>, locks: Arc<L>, processor: Arc<P>, lock_ttl: Duration) -> Self {
        JobWorker {
            store,
            locks,
            processor,
            lock_ttl,
        }
    }

    /// Runs `job` through the state machine.
    ///
    /// # Returns
    /// What the worker did with the job, or the processing error once the
    /// job is marked `FAILED` and the lock released
    pub async fn handle(&self, job: &JobMessage) -> Result<JobOutcome, ProcessingError> {
        let resource_type = self.processor.resource_type();
        let key = resource_key(resource_type, job.resource_id);

        let Some(token) = self.locks.acquire_lock(&key, self.lock_ttl).await? else {
            info!(job_id = job.job_id, key = key, "resource locked by another worker, skipping");
            self.store
                .update_status(job.job_id, JobStatus::Completed, Some(SKIPPED_LOCKED_NOTE.to_owned()))
                .await?;
            return Ok(JobOutcome::SkippedLocked);
        };

        let outcome = self.handle_locked(resource_type, job).await;

        match self.locks.release_lock(&key, &token).await {
            Ok(true) => debug!(key = key, "lock released"),
            Ok(false) => warn!(key = key, job_id = job.job_id, "lock expired before release"),
            Err(err) => {
                error!(error = err.to_string(), key = key, "failure to release lock");
                // A failed job keeps its own error; a finished one is retried
                // and short-circuits on the completion check.
                if outcome.is_ok() {
                    return Err(err.into());
                }
            }
        }

        outcome
    }

    async fn handle_locked(&self, resource_type: &str, job: &JobMessage) -> Result<JobOutcome, ProcessingError> {
        if self.store.get(job.job_id).await?.is_none() {
            return Err(ProcessingError::permanent(format!("job {} not found", job.job_id)));
        }

        if self.store.is_resource_complete(resource_type, job.resource_id).await? {
            info!(job_id = job.job_id, resource_id = job.resource_id, "resource already completed");
            self.store
                .update_status(job.job_id, JobStatus::Completed, Some(ALREADY_COMPLETED_NOTE.to_owned()))
                .await?;
            return Ok(JobOutcome::AlreadyCompleted);
        }

        self.store
            .update_status(job.job_id, JobStatus::Processing, None)
            .await?;

        match self.processor.process(job).await {
            Ok(result) => {
                self.store
                    .complete_resource(resource_type, job.resource_id, &result)
                    .await?;
                self.store
                    .update_status(job.job_id, JobStatus::Completed, None)
                    .await?;
                info!(job_id = job.job_id, resource_id = job.resource_id, "job completed");
                Ok(JobOutcome::Processed)
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = message, job_id = job.job_id, "job failed");

                // Store errors are logged only; the processor's error is returned.
                if let Err(store_err) = self
                    .store
                    .fail_resource(resource_type, job.resource_id, &message)
                    .await
                {
                    error!(
                        error = store_err.to_string(),
                        resource_id = job.resource_id,
                        "failure to record resource failure"
                    );
                }
                if let Err(store_err) = self
                    .store
                    .update_status(job.job_id, JobStatus::Failed, Some(message))
                    .await
                {
                    error!(
                        error = store_err.to_string(),
                        job_id = job.job_id,
                        "failure to mark job failed"
                    );
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<S, L, P> ConsumerHandler<JobMessage> for JobWorker<S, L, P>
where
    S: JobStore + ?Sized,
    L: LockCoordinator + ?Sized,
    P: JobProcessor + ?Sized,
{
    async fn exec(&self, _ctx: &Context, payload: JobMessage) -> Result<(), ProcessingError> {
        self.handle(&payload).await.map(|_| ())
    }
}
