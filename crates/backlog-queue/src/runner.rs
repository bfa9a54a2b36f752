use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use backlog_core::JobRecord;
use backlog_events::{EventSink, JobContext, JobEvent};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::driver::{DueFilter, StorageDriver};
use crate::error::{QueueError, Result};
use crate::registry::DriverRegistry;

/// What one `run` / `run_all` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Handler succeeded, record removed.
    pub processed: usize,
    /// Attempts exhausted, record dead-lettered.
    pub failed: usize,
    /// Left alone: no handler registered, another sweep claimed it first, or
    /// it was forgotten while its handler ran.
    ///
    /// A record with no handler stays pending and is skipped again on every
    /// sweep until a handler is registered or the record is forgotten. Each
    /// sweep that meets such records logs one warning naming their slugs.
    pub skipped: usize,
    /// Storage errors while claiming or settling a record.
    pub errors: usize,
}

impl RunReport {
    /// Records that count against the batch bound.
    pub fn handled(&self) -> usize {
        self.processed + self.failed
    }
}

enum Outcome {
    Processed,
    Failed,
    Forgotten,
}

/// Executes due records: claim, hand off to the event sink, retry, then
/// complete or dead-letter.
///
/// Everything runs on the calling thread, including handler code and the
/// pauses between attempts.
pub struct Runner {
    registry: Arc<DriverRegistry>,
    sink: Arc<EventSink>,
    /// Backend override; `None` uses the configured driver.
    driver: Option<String>,
    /// Queue allowlist for [`Runner::sweep`].
    queues: Option<Vec<String>>,
}

impl Runner {
    pub fn new(registry: Arc<DriverRegistry>, sink: Arc<EventSink>) -> Self {
        Self {
            registry,
            sink,
            driver: None,
            queues: None,
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn with_queues<S: Into<String>>(mut self, queues: impl IntoIterator<Item = S>) -> Self {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    pub fn sink(&self) -> &Arc<EventSink> {
        &self.sink
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    fn storage(&self) -> Result<Arc<dyn StorageDriver>> {
        match &self.driver {
            Some(name) => self.registry.driver(name),
            None => self.registry.default_driver(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.registry.clock().now()
    }

    /// Run every due record of `name` on `queue`. Future records stay put.
    pub fn run(&self, name: &str, max_retries: u32, wait_ms: u64, queue: &str) -> Result<RunReport> {
        let driver = self.storage()?;
        let due = driver.due(&DueFilter::job(name, queue), self.now())?;
        self.warn_unhandled(&due);

        let mut report = RunReport::default();
        for record in &due {
            self.execute(driver.as_ref(), record, max_retries, wait_ms, &mut report);
        }
        debug!(%name, %queue, ?report, "run finished");
        Ok(report)
    }

    /// One sweep over every due record, oldest first, stopping once
    /// `max_job` records have been processed or dead-lettered.
    ///
    /// `queues` restricts the sweep to an allowlist; records elsewhere are
    /// neither touched nor counted.
    pub fn run_all(&self, max_retries: u32, wait_ms: u64, queues: Option<&[&str]>) -> Result<RunReport> {
        let driver = self.storage()?;
        let config = self.registry.config();

        let ttl = chrono::Duration::try_seconds(i64::try_from(config.claim_ttl_secs).unwrap_or(i64::MAX));
        if let Some(cutoff) = ttl.and_then(|ttl| self.now().checked_sub_signed(ttl)) {
            driver.release_stale(cutoff)?;
        }

        let due = driver.due(&DueFilter::sweep(queues), self.now())?;
        self.warn_unhandled(&due);
        let limit = config.max_job;

        let mut report = RunReport::default();
        for record in &due {
            if report.handled() >= limit {
                debug!(limit, due = due.len(), "batch bound reached");
                break;
            }
            self.execute(driver.as_ref(), record, max_retries, wait_ms, &mut report);
        }

        if report != RunReport::default() {
            info!(
                driver = driver.name(),
                processed = report.processed,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// `run_all` with the configured retry budget, backoff and queue allowlist.
    pub fn sweep(&self) -> Result<RunReport> {
        let config = self.registry.config();
        let queues: Option<Vec<&str>> = self
            .queues
            .as_ref()
            .map(|qs| qs.iter().map(String::as_str).collect());
        self.run_all(config.max_retries, config.wait_ms, queues.as_deref())
    }

    fn execute(
        &self,
        driver: &dyn StorageDriver,
        record: &JobRecord,
        max_retries: u32,
        wait_ms: u64,
        report: &mut RunReport,
    ) {
        if !self.sink.has_handler(&record.slug) {
            debug!(job_id = %record.id, slug = %record.slug, "no handler registered, left pending");
            report.skipped += 1;
            return;
        }

        match driver.claim(record, self.now()) {
            Ok(true) => {}
            Ok(false) => {
                report.skipped += 1;
                return;
            }
            Err(e) => {
                error!(job_id = %record.id, "claim failed: {e}");
                report.errors += 1;
                return;
            }
        }

        match self.attempt(driver, record, max_retries, wait_ms) {
            Ok(Outcome::Processed) => report.processed += 1,
            Ok(Outcome::Failed) => report.failed += 1,
            Ok(Outcome::Forgotten) => report.skipped += 1,
            Err(e) => {
                // The claim stays in place; release_stale hands it back later.
                error!(job_id = %record.id, "could not settle job: {e}");
                report.errors += 1;
            }
        }
    }

    fn attempt(&self, driver: &dyn StorageDriver, record: &JobRecord, max_retries: u32, wait_ms: u64) -> Result<Outcome> {
        let attempts = max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let ctx = JobContext::new(JobEvent::Processing, record, attempt, attempts);
            match self.sink.process(&ctx) {
                Ok(()) => {
                    driver.complete(record)?;
                    self.sink.notify(&ctx.with_event(JobEvent::Processed));
                    self.log_outcome(record, attempt, "job processed");
                    return Ok(Outcome::Processed);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        warn!(job_id = %record.id, attempt, max_attempts = attempts, "attempt failed: {e}");
                        self.sink
                            .notify(&ctx.with_event(JobEvent::Retrying).with_error(&last_error));
                        if wait_ms > 0 {
                            std::thread::sleep(Duration::from_millis(wait_ms));
                        }
                    }
                }
            }
        }

        let failed = match driver.fail(record, &last_error, self.now()) {
            Ok(failed) => failed,
            Err(QueueError::JobNotFound { .. }) => {
                info!(job_id = %record.id, name = %record.name, "job forgotten while running, no dead letter written");
                return Ok(Outcome::Forgotten);
            }
            Err(e) => return Err(e),
        };
        let ctx = JobContext::new(JobEvent::Failed, record, attempts, attempts).with_error(&failed.exception);
        self.sink.notify(&ctx);
        warn!(job_id = %record.id, name = %record.name, queue = %record.queue, "job dead-lettered: {last_error}");
        Ok(Outcome::Failed)
    }

    /// Distinct slugs among `due` that have no registered handler.
    fn unhandled<'a>(&self, due: &'a [JobRecord]) -> BTreeSet<&'a str> {
        due.iter()
            .map(|r| r.slug.as_str())
            .filter(|slug| !self.sink.has_handler(slug))
            .collect()
    }

    fn warn_unhandled(&self, due: &[JobRecord]) {
        let slugs = self.unhandled(due);
        if !slugs.is_empty() {
            let count = due.iter().filter(|r| slugs.contains(r.slug.as_str())).count();
            warn!(count, slugs = ?slugs, "due jobs have no registered handler and stay pending");
        }
    }

    fn log_outcome(&self, record: &JobRecord, attempt: u32, msg: &str) {
        if self.registry.config().logging {
            info!(job_id = %record.id, name = %record.name, queue = %record.queue, attempt, "{msg}");
        } else {
            debug!(job_id = %record.id, name = %record.name, queue = %record.queue, attempt, "{msg}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TableDriver;
    use crate::db::TableNames;
    use backlog_core::{Clock, ManualClock, NewJob, QueueConfig};
    use backlog_events::HandlerError;
    use chrono::TimeZone;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner(config: QueueConfig) -> (Arc<dyn StorageDriver>, Runner) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()));
        let driver: Arc<dyn StorageDriver> = Arc::new(
            TableDriver::new(Connection::open_in_memory().unwrap(), TableNames::default(), clock.clone()).unwrap(),
        );
        let registry = Arc::new(DriverRegistry::new(config, clock));
        registry.insert("memory", Arc::clone(&driver));
        let runner = Runner::new(registry, Arc::new(EventSink::new())).with_driver("memory");
        (driver, runner)
    }

    #[test]
    fn job_without_handler_is_left_unclaimed() {
        let (driver, runner) = runner(QueueConfig::default());
        driver.add(NewJob::new("orphan", "{}")).unwrap();

        let report = runner.run_all(3, 0, None).unwrap();
        assert_eq!(report, RunReport { skipped: 1, ..Default::default() });
        // never claimed, so the next sweep sees it again
        assert_eq!(runner.run_all(3, 0, None).unwrap().skipped, 1);
        assert_eq!(driver.pending(None).unwrap().len(), 1);
    }

    #[test]
    fn unhandled_slugs_are_collected_once_each() {
        let (driver, runner) = runner(QueueConfig::default());
        runner.sink().handlers().register_handler(
            "known",
            Arc::new(|_: &JobContext| -> backlog_events::Result<()> { Ok(()) }),
        );
        driver.add(NewJob::new("Orphan", "{}")).unwrap();
        driver.add(NewJob::new("orphan", "{}")).unwrap();
        driver.add(NewJob::new("known", "{}")).unwrap();
        driver.add(NewJob::new("stray", "{}")).unwrap();

        let due = driver.pending(None).unwrap();
        let slugs: Vec<&str> = runner.unhandled(&due).into_iter().collect();
        assert_eq!(slugs, vec!["orphan", "stray"]);

        let report = runner.run_all(1, 0, None).unwrap();
        assert_eq!((report.processed, report.skipped), (1, 3));
    }

    #[test]
    fn job_forgotten_mid_run_is_not_dead_lettered() {
        let (driver, runner) = runner(QueueConfig::default());
        let store = Arc::clone(&driver);
        runner.sink().handlers().register_handler(
            "cancelled",
            Arc::new(move |_: &JobContext| -> backlog_events::Result<()> {
                store.forget("cancelled", None).unwrap();
                Err(HandlerError::failed("gave up"))
            }),
        );
        driver.add(NewJob::new("cancelled", "{}")).unwrap();

        let report = runner.run_all(1, 0, None).unwrap();
        assert_eq!(report, RunReport { skipped: 1, ..Default::default() });
        assert!(driver.failed().unwrap().is_empty());
        assert!(driver.pending(None).unwrap().is_empty());
    }

    #[test]
    fn zero_retries_still_makes_one_attempt() {
        let (driver, runner) = runner(QueueConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        runner.sink().handlers().register_handler(
            "flaky",
            Arc::new(move |_: &JobContext| -> backlog_events::Result<()> {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::failed("nope"))
            }),
        );
        driver.add(NewJob::new("flaky", "{}")).unwrap();

        let report = runner.run("flaky", 0, 0, "default").unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(driver.failed().unwrap()[0].exception, "nope");
    }

    #[test]
    fn panicking_handler_is_retried_then_dead_lettered() {
        let (driver, runner) = runner(QueueConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        runner.sink().handlers().register_handler(
            "explodes",
            Arc::new(move |_: &JobContext| -> backlog_events::Result<()> {
                seen.fetch_add(1, Ordering::SeqCst);
                panic!("handler bug")
            }),
        );
        driver.add(NewJob::new("explodes", "{}")).unwrap();

        let report = runner.run_all(2, 0, None).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(driver.failed().unwrap()[0].exception.contains("handler bug"));
        assert!(driver.pending(None).unwrap().is_empty());
    }

    #[test]
    fn second_attempt_success_counts_as_processed() {
        let (driver, runner) = runner(QueueConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        runner.sink().handlers().register_handler(
            "second-time-lucky",
            Arc::new(move |ctx: &JobContext| -> backlog_events::Result<()> {
                seen.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt == 1 {
                    Err(HandlerError::failed("transient"))
                } else {
                    Ok(())
                }
            }),
        );
        driver.add(NewJob::new("Second Time Lucky", "{}")).unwrap();

        let report = runner.run_all(3, 1, None).unwrap();
        assert_eq!(report, RunReport { processed: 1, ..Default::default() });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(driver.failed().unwrap().is_empty());
    }
}
