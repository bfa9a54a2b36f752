//! One file per job in a single directory.
//!
//! Layout:
//!
//! | File                    | Meaning                                   |
//! |-------------------------|-------------------------------------------|
//! | `{slug}__{id}.job`      | pending, unclaimed                        |
//! | `{slug}__{id}.claimed`  | pending, owned by a running sweep         |
//! | `failed__{id}.job`      | dead letter                               |
//! | `.{name}.tmp`           | write in progress, ignored by every scan  |
//!
//! Bodies are pretty-printed JSON of the record. Every write goes to a temp
//! file first and is renamed into place, so scans never see half a record.
//! Claiming is a rename from `.job` to `.claimed`: exactly one of several
//! racing sweeps wins it, the others see `NotFound` and skip the record.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use backlog_core::{slugify, Clock, FailedJobRecord, JobRecord, NewJob};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::{sort_oldest_first, DueFilter, StorageDriver};
use crate::error::{QueueError, Result};

const EXT_PENDING: &str = "job";
const EXT_CLAIMED: &str = "claimed";
const FAILED_PREFIX: &str = "failed__";
const SEP: &str = "__";

/// Directory-backed driver.
pub struct FileDriver {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileDriver {
    /// Use `dir` as the job store, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "file queue driver ready");
        Ok(Self { dir, clock })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, slug: &str, id: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}{SEP}{id}.{ext}", stem(slug)))
    }

    fn failed_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{FAILED_PREFIX}{id}.{EXT_PENDING}"))
    }

    /// Files ending in `.{ext}` whose name starts with `prefix`.
    /// `None` means every non-dead-letter file.
    fn list(&self, prefix: Option<&str>, ext: &str) -> Result<Vec<PathBuf>> {
        let suffix = format!(".{ext}");
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !name.ends_with(&suffix) {
                continue;
            }
            let wanted = match prefix {
                Some(p) => name.starts_with(p),
                None => !name.starts_with(FAILED_PREFIX) && !name.starts_with('.'),
            };
            if wanted {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    /// Pending records (both unclaimed and claimed) for an optional slug.
    fn scan_pending(&self, slug: Option<&str>, exts: &[&str]) -> Result<Vec<(PathBuf, JobRecord)>> {
        let prefix = slug.map(|s| format!("{}{SEP}", stem(s)));
        let mut out = Vec::new();
        for ext in exts {
            for path in self.list(prefix.as_deref(), ext)? {
                if let Some(record) = load::<JobRecord>(&path) {
                    out.push((path, record));
                }
            }
        }
        Ok(out)
    }

    fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("record");
        let tmp = self.dir.join(format!(".{file_name}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl StorageDriver for FileDriver {
    fn name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self, job), fields(name = %job.name, queue = %job.queue))]
    fn add(&self, job: NewJob) -> Result<JobRecord> {
        let record = JobRecord::create(job, self.clock.now());
        let path = self.record_path(&record.slug, &record.id, EXT_PENDING);
        self.write_atomic(&path, &record)?;
        debug!(job_id = %record.id, file = %path.display(), "job file written");
        Ok(record)
    }

    fn has_overlapping(&self, name: &str, queue: &str) -> Result<bool> {
        let slug = slugify(name);
        Ok(self
            .scan_pending(Some(&slug), &[EXT_PENDING, EXT_CLAIMED])?
            .iter()
            .any(|(_, r)| r.queue == queue && r.without_overlapping))
    }

    #[instrument(skip(self))]
    fn forget(&self, name: &str, queue: Option<&str>) -> Result<usize> {
        let slug = slugify(name);
        let mut removed = 0;
        for (path, record) in self.scan_pending(Some(&slug), &[EXT_PENDING, EXT_CLAIMED])? {
            if queue.map_or(true, |q| q == record.queue) && remove_quiet(&path)? {
                removed += 1;
            }
        }
        debug!(removed, "job files forgotten");
        Ok(removed)
    }

    fn pending(&self, name: Option<&str>) -> Result<Vec<JobRecord>> {
        let slug = name.map(slugify);
        let mut records: Vec<JobRecord> = self
            .scan_pending(slug.as_deref(), &[EXT_PENDING, EXT_CLAIMED])?
            .into_iter()
            .map(|(_, r)| r)
            .collect();
        sort_oldest_first(&mut records);
        Ok(records)
    }

    fn due(&self, filter: &DueFilter, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        // Directory order says nothing about age: read every candidate, then sort.
        let mut records: Vec<JobRecord> = self
            .scan_pending(filter.slug.as_deref(), &[EXT_PENDING])?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r) && r.is_due(now))
            .collect();
        sort_oldest_first(&mut records);
        Ok(records)
    }

    fn claim(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<bool> {
        let from = self.record_path(&record.slug, &record.id, EXT_PENDING);
        let to = self.record_path(&record.slug, &record.id, EXT_CLAIMED);
        match fs::rename(&from, &to) {
            Ok(()) => {
                // rename keeps the old mtime; stamp the claim time for release_stale
                if let Err(e) = stamp_mtime(&to, now) {
                    warn!(job_id = %record.id, "could not stamp claim time: {e}");
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(job_id = %record.id, "claim lost: file already taken or removed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self, record: &JobRecord) -> Result<()> {
        let from = self.record_path(&record.slug, &record.id, EXT_CLAIMED);
        let to = self.record_path(&record.slug, &record.id, EXT_PENDING);
        match fs::rename(&from, &to) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
        let mut released = 0;
        for path in self.list(None, EXT_CLAIMED)? {
            let claimed_at: DateTime<Utc> = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t.into(),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if claimed_at >= claimed_before {
                continue;
            }
            match fs::rename(&path, path.with_extension(EXT_PENDING)) {
                Ok(()) => {
                    warn!(file = %path.display(), %claimed_at, "stale claim released");
                    released += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(released)
    }

    fn complete(&self, record: &JobRecord) -> Result<()> {
        let path = self.record_path(&record.slug, &record.id, EXT_CLAIMED);
        if !remove_quiet(&path)? {
            // forgotten while the handler ran
            debug!(job_id = %record.id, "claimed file already gone");
        }
        Ok(())
    }

    fn fail(&self, record: &JobRecord, exception: &str, failed_at: DateTime<Utc>) -> Result<FailedJobRecord> {
        let claimed = self.record_path(&record.slug, &record.id, EXT_CLAIMED);
        let pending = self.record_path(&record.slug, &record.id, EXT_PENDING);
        if !claimed.try_exists()? && !pending.try_exists()? {
            // Already dead-lettered, or forgotten while the handler ran.
            return read_json(&self.failed_path(&record.id))?
                .ok_or_else(|| QueueError::JobNotFound { id: record.id.clone() });
        }

        let failed = record.clone().into_failed(exception, failed_at);
        self.write_atomic(&self.failed_path(&failed.id), &failed)?;
        if !remove_quiet(&claimed)? {
            remove_quiet(&pending)?;
        }
        Ok(failed)
    }

    fn failed(&self) -> Result<Vec<FailedJobRecord>> {
        let mut records: Vec<FailedJobRecord> = self
            .list(Some(FAILED_PREFIX), EXT_PENDING)?
            .iter()
            .filter_map(|p| load::<FailedJobRecord>(p))
            .collect();
        records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    fn find_failed(&self, id: &str) -> Result<Option<FailedJobRecord>> {
        read_json(&self.failed_path(id))
    }

    fn purge_failed(&self, id: Option<&str>) -> Result<usize> {
        let paths = match id {
            Some(id) => vec![self.failed_path(id)],
            None => self.list(Some(FAILED_PREFIX), EXT_PENDING)?,
        };
        let mut removed = 0;
        for path in paths {
            if remove_quiet(&path)? {
                removed += 1;
            }
        }
        info!(removed, "dead letters purged");
        Ok(removed)
    }

    fn retry_failed(&self, id: &str, now: DateTime<Utc>) -> Result<JobRecord> {
        let failed = self
            .find_failed(id)?
            .ok_or_else(|| QueueError::JobNotFound { id: id.to_string() })?;
        let record = failed.into_pending(now);
        self.write_atomic(&self.record_path(&record.slug, &record.id, EXT_PENDING), &record)?;
        remove_quiet(&self.failed_path(id))?;
        info!(job_id = %id, "dead letter re-queued");
        Ok(record)
    }
}

/// A job literally named "failed" must not collide with dead letters.
/// Slugs never contain `_`, so the escaped form is unambiguous.
fn stem(slug: &str) -> &str {
    if slug == "failed" {
        "_failed"
    } else {
        slug
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Scan helper: unreadable or corrupt files are logged and skipped so one
/// bad file cannot stall the queue.
fn load<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match read_json(path) {
        Ok(v) => v,
        Err(e) => {
            warn!(file = %path.display(), "skipping unreadable job file: {e}");
            None
        }
    }
}

fn remove_quiet(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn stamp_mtime(path: &Path, at: DateTime<Utc>) -> std::io::Result<()> {
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::from(at))
}
