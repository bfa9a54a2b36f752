use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::slug::slugify;

/// Lane used when the caller names none.
pub const DEFAULT_QUEUE: &str = "default";

/// Everything a caller supplies when deferring work. The store fills in the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub name: String,
    /// Serialized payload text, persisted and handed back untouched.
    pub payload: String,
    pub queue: String,
    /// `None` means due immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub without_overlapping: bool,
}

impl NewJob {
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            queue: DEFAULT_QUEUE.to_string(),
            scheduled_at: None,
            without_overlapping: false,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn without_overlapping(mut self, flag: bool) -> Self {
        self.without_overlapping = flag;
        self
    }
}

/// A pending unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// UUIDv7 string; distinguishes same-named jobs in one queue.
    pub id: String,
    /// Name exactly as the caller wrote it.
    pub name: String,
    /// Lookup key derived from `name`; see [`slugify`].
    pub slug: String,
    pub queue: String,
    pub payload: String,
    pub scheduled_at: DateTime<Utc>,
    pub without_overlapping: bool,
    /// Oldest-first tie-break when due records compete for a sweep slot.
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Materialise a record for `job`, stamping `now` as creation time.
    ///
    /// Instants are cut to whole microseconds, the finest unit every backend
    /// stores, so the returned record equals what a later read gives back.
    pub fn create(job: NewJob, now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(6);
        Self {
            // UUIDv7 embeds the timestamp, so ids sort roughly by creation
            id: Uuid::now_v7().to_string(),
            slug: slugify(&job.name),
            name: job.name,
            queue: job.queue,
            payload: job.payload,
            scheduled_at: job.scheduled_at.map_or(now, |at| at.trunc_subsecs(6)),
            without_overlapping: job.without_overlapping,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Convert into a dead letter. The caller removes the pending copy.
    pub fn into_failed(self, exception: impl Into<String>, failed_at: DateTime<Utc>) -> FailedJobRecord {
        FailedJobRecord {
            id: self.id,
            name: self.name,
            queue: self.queue,
            payload: self.payload,
            exception: exception.into(),
            failed_at: failed_at.trunc_subsecs(6),
        }
    }
}

/// Terminal record for a job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub id: String,
    pub name: String,
    /// Original lane, kept for diagnostics.
    pub queue: String,
    pub payload: String,
    /// Message of the last failed attempt.
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedJobRecord {
    /// Rebuild a pending record that is due at `now`.
    ///
    /// Keeps the id (the dead letter is removed in the same move). The overlap
    /// flag is not recorded on dead letters, so it comes back cleared.
    pub fn into_pending(self, now: DateTime<Utc>) -> JobRecord {
        let now = now.trunc_subsecs(6);
        JobRecord {
            id: self.id,
            slug: slugify(&self.name),
            name: self.name,
            queue: self.queue,
            payload: self.payload,
            scheduled_at: now,
            without_overlapping: false,
            created_at: now,
        }
    }
}
