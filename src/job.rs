// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Jobs
//!
//! The job descriptor carried in message bodies and the job record tracked by
//! the store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle of a job: `Queued -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Message body of a job.
///
/// Fields beyond `job_id` and `resource_id` are kept in `extra` for the
/// processor and written back unchanged when the message is republished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: i64,
    pub resource_id: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobMessage {
    pub fn new(job_id: i64, resource_id: i64) -> Self {
        JobMessage {
            job_id,
            resource_id,
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }
}

/// The fields of a job record this crate reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: i64,
    pub resource_id: i64,
    pub status: JobStatus,
    /// Set on every non-success terminal transition, including benign skips.
    pub error_message: Option<String>,
}

impl JobRecord {
    pub fn queued(job_id: i64, resource_id: i64) -> Self {
        JobRecord {
            job_id,
            resource_id,
            status: JobStatus::Queued,
            error_message: None,
        }
    }
}
