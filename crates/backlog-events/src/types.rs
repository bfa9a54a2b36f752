use backlog_core::JobRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Canonical name of the hand-off event published once per due job.
pub const JOB_PROCESSING: &str = "backlog.job.processing";

/// Every point in a job's run that observers can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    /// A due job is being handed to its handler. Fired once per attempt.
    Processing,
    /// The handler succeeded and the record was removed.
    Processed,
    /// An attempt failed and another one follows.
    Retrying,
    /// Attempts ran out and the record was dead-lettered.
    Failed,
}

impl JobEvent {
    /// Namespaced wire name, e.g. `backlog.job.processing`.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Processing => JOB_PROCESSING,
            JobEvent::Processed => "backlog.job.processed",
            JobEvent::Retrying => "backlog.job.retrying",
            JobEvent::Failed => "backlog.job.failed",
        }
    }
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for JobEvent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            JOB_PROCESSING | "processing" => Ok(JobEvent::Processing),
            "backlog.job.processed" | "processed" => Ok(JobEvent::Processed),
            "backlog.job.retrying" | "retrying" => Ok(JobEvent::Retrying),
            "backlog.job.failed" | "failed" => Ok(JobEvent::Failed),
            other => Err(format!("unknown job event: {other}")),
        }
    }
}

/// What handlers and listeners receive.
///
/// Payload stays as the stored text so the bus is decoupled from the
/// application's payload types; typed handlers decode it on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    pub event: JobEvent,
    pub id: String,
    pub name: String,
    pub slug: String,
    pub queue: String,
    pub payload: String,
    /// 1-based attempt number within the current run.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Last failure message, set on `Retrying` and `Failed`.
    pub error: Option<String>,
    /// Unix timestamp (ms) when the context was created.
    pub timestamp: u64,
}

impl JobContext {
    pub fn new(event: JobEvent, record: &JobRecord, attempt: u32, max_attempts: u32) -> Self {
        Self {
            event,
            id: record.id.clone(),
            name: record.name.clone(),
            slug: record.slug.clone(),
            queue: record.queue.clone(),
            payload: record.payload.clone(),
            attempt,
            max_attempts,
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    /// Same job, different event.
    pub fn with_event(&self, event: JobEvent) -> Self {
        Self {
            event,
            ..self.clone()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Decode the payload into the handler's input type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}
