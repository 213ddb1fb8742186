// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Record Store
//!
//! Interface to the persistence service that owns job records and the
//! resources jobs work on, plus an in-memory implementation for tests and
//! local runs.

use crate::{
    errors::StoreError,
    job::{JobRecord, JobStatus},
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: i64) -> Result<Option<JobRecord>, StoreError>;

    async fn update_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    /// Whether the resource already reached its completed state.
    async fn is_resource_complete(&self, resource_type: &str, resource_id: i64) -> Result<bool, StoreError>;

    /// Persists the processing result and marks the resource completed.
    async fn complete_resource(
        &self,
        resource_type: &str,
        resource_id: i64,
        result: &Value,
    ) -> Result<(), StoreError>;

    async fn fail_resource(&self, resource_type: &str, resource_id: i64, error: &str) -> Result<(), StoreError>;
}

/// State of a resource as tracked by [`InMemoryJobStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceState {
    Completed(Value),
    Failed(String),
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<i64, JobRecord>>,
    resources: RwLock<HashMap<(String, i64), ResourceState>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `QUEUED` job.
    pub async fn insert_job(&self, job_id: i64, resource_id: i64) {
        self.jobs
            .write()
            .await
            .insert(job_id, JobRecord::queued(job_id, resource_id));
    }

    /// Current state of a resource, `None` when never completed or failed.
    pub async fn resource(&self, resource_type: &str, resource_id: i64) -> Option<ResourceState> {
        self.resources
            .read()
            .await
            .get(&(resource_type.to_owned(), resource_id))
            .cloned()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, job_id: i64) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        record.status = status;
        record.error_message = error_message;
        Ok(())
    }

    async fn is_resource_complete(&self, resource_type: &str, resource_id: i64) -> Result<bool, StoreError> {
        Ok(matches!(
            self.resource(resource_type, resource_id).await,
            Some(ResourceState::Completed(_))
        ))
    }

    async fn complete_resource(
        &self,
        resource_type: &str,
        resource_id: i64,
        result: &Value,
    ) -> Result<(), StoreError> {
        self.resources.write().await.insert(
            (resource_type.to_owned(), resource_id),
            ResourceState::Completed(result.clone()),
        );
        Ok(())
    }

    async fn fail_resource(&self, resource_type: &str, resource_id: i64, error: &str) -> Result<(), StoreError> {
        self.resources.write().await.insert(
            (resource_type.to_owned(), resource_id),
            ResourceState::Failed(error.to_owned()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn status_updates_overwrite_error_message() {
        let store = InMemoryJobStore::new();
        store.insert_job(1, 42).await;

        store
            .update_status(1, JobStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        store.update_status(1, JobStatus::Completed, None).await.unwrap();

        let record = store.get(1).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.error_message, None);
    }

    #[tokio::test]
    async fn unknown_job_cannot_be_updated() {
        let store = InMemoryJobStore::new();

        assert_eq!(
            store.update_status(9, JobStatus::Processing, None).await,
            Err(StoreError::NotFound(9))
        );
    }

    #[tokio::test]
    async fn failed_resource_is_not_complete() {
        let store = InMemoryJobStore::new();

        store.fail_resource("document", 42, "boom").await.unwrap();
        assert!(!store.is_resource_complete("document", 42).await.unwrap());

        store
            .complete_resource("document", 42, &json!({"pages": 3}))
            .await
            .unwrap();
        assert!(store.is_resource_complete("document", 42).await.unwrap());
        assert!(!store.is_resource_complete("report", 42).await.unwrap());
    }
}
