//! Storage backends.
//!
//! A driver owns persistence only. Deciding what to run, retrying and
//! dead-lettering live in [`crate::runner`], which drives any backend through
//! the claim / complete / fail primitives below.

pub mod file;
pub mod table;

use backlog_core::{slugify, FailedJobRecord, JobRecord, NewJob};
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use file::FileDriver;
pub use table::TableDriver;

/// Which pending records a due-scan considers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueFilter {
    /// Restrict to one job (by slug). `None` means every job.
    pub slug: Option<String>,
    /// Queue allowlist. `None` means every queue.
    pub queues: Option<Vec<String>>,
}

impl DueFilter {
    /// Everything, optionally narrowed to a queue allowlist.
    pub fn sweep<S: AsRef<str>>(queues: Option<&[S]>) -> Self {
        Self {
            slug: None,
            queues: queues.map(|qs| qs.iter().map(|q| q.as_ref().to_string()).collect()),
        }
    }

    /// One (name, queue) pair.
    pub fn job(name: &str, queue: &str) -> Self {
        Self {
            slug: Some(slugify(name)),
            queues: Some(vec![queue.to_string()]),
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.slug.as_deref().map_or(true, |s| s == record.slug)
            && self
                .queues
                .as_ref()
                .map_or(true, |qs| qs.iter().any(|q| *q == record.queue))
    }
}

/// Persistence contract shared by the file and table backends.
///
/// "Pending" covers both unclaimed records and records a sweep currently
/// holds; only unclaimed ones are returned by [`StorageDriver::due`].
pub trait StorageDriver: Send + Sync {
    /// Backend name as used in configuration.
    fn name(&self) -> &'static str;

    /// Persist a new pending record. `job.name` is slugified for the key.
    fn add(&self, job: NewJob) -> Result<JobRecord>;

    /// True iff a pending record with this slug and queue carries the
    /// without-overlapping flag. Advisory: `add` never consults it.
    fn has_overlapping(&self, name: &str, queue: &str) -> Result<bool>;

    /// Delete every pending record for `name`, optionally only in `queue`.
    /// Returns how many were removed.
    fn forget(&self, name: &str, queue: Option<&str>) -> Result<usize>;

    /// All pending records (optionally for one name), oldest first.
    fn pending(&self, name: Option<&str>) -> Result<Vec<JobRecord>>;

    /// Unclaimed records due at `now` that match `filter`, oldest first
    /// (`created_at`, then `id`). Dead letters are never included.
    fn due(&self, filter: &DueFilter, now: DateTime<Utc>) -> Result<Vec<JobRecord>>;

    /// Take exclusive ownership of `record` for one run attempt.
    ///
    /// Returns `false` when another sweep got there first or the record is
    /// gone; the caller must then leave it alone.
    fn claim(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<bool>;

    /// Give a claimed record back untouched.
    fn release(&self, record: &JobRecord) -> Result<()>;

    /// Give back every claim taken before `claimed_before`. Returns the count.
    fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<usize>;

    /// Success path: remove the claimed record.
    fn complete(&self, record: &JobRecord) -> Result<()>;

    /// Terminal failure: write the dead letter, then remove the pending
    /// record.
    ///
    /// Repeating the call after the move returns the stored dead letter. If
    /// the pending record is gone and no dead letter exists (forgotten while
    /// the handler ran), nothing is written and `JobNotFound` is returned.
    fn fail(&self, record: &JobRecord, exception: &str, failed_at: DateTime<Utc>) -> Result<FailedJobRecord>;

    /// Dead letters, most recent failure first.
    fn failed(&self) -> Result<Vec<FailedJobRecord>>;

    fn find_failed(&self, id: &str) -> Result<Option<FailedJobRecord>>;

    /// Remove one dead letter, or all of them when `id` is `None`.
    fn purge_failed(&self, id: Option<&str>) -> Result<usize>;

    /// Operator action: turn a dead letter back into a pending record due at `now`.
    fn retry_failed(&self, id: &str, now: DateTime<Utc>) -> Result<JobRecord>;
}

/// Stable oldest-first ordering used by both backends.
pub(crate) fn sort_oldest_first(records: &mut [JobRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
