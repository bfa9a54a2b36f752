use std::sync::Arc;

use backlog_core::{JobRecord, NewJob, DEFAULT_QUEUE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::driver::StorageDriver;
use crate::error::Result;
use crate::registry::DriverRegistry;
use crate::schedule::Schedule;

/// Receipt for a persisted job. Nothing has run yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub queue: String,
    pub scheduled_at: DateTime<Utc>,
    pub without_overlapping: bool,
    /// Backend the record went to.
    pub driver: String,
}

impl PendingJob {
    fn new(record: JobRecord, driver: &str) -> Self {
        Self {
            id: record.id,
            name: record.name,
            slug: record.slug,
            queue: record.queue,
            scheduled_at: record.scheduled_at,
            without_overlapping: record.without_overlapping,
            driver: driver.to_string(),
        }
    }
}

/// Entry point for deferring work.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<DriverRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Persist `name` on the default queue of the configured driver.
    ///
    /// ```ignore
    /// dispatcher.dispatch("Send Email Job", &json!({"email": "user@example.com"}), None::<&str>)?;
    /// dispatcher.dispatch("Nightly Report", &(), "tomorrow")?;
    /// ```
    pub fn dispatch<P>(&self, name: &str, payload: &P, schedule: impl Into<Schedule>) -> Result<PendingJob>
    where
        P: Serialize + ?Sized,
    {
        self.job(name, payload)?.at(schedule).dispatch()
    }

    /// Start a builder for `name`; the payload is serialized immediately.
    pub fn job<P>(&self, name: &str, payload: &P) -> Result<JobBuilder<'_>>
    where
        P: Serialize + ?Sized,
    {
        Ok(JobBuilder {
            dispatcher: self,
            name: name.to_string(),
            payload: serde_json::to_string(payload)?,
            queue: DEFAULT_QUEUE.to_string(),
            schedule: Schedule::Now,
            without_overlapping: false,
            driver: None,
        })
    }

    /// Advisory overlap check against the default driver.
    pub fn has_overlapping(&self, name: &str, queue: &str) -> Result<bool> {
        self.registry.default_driver()?.has_overlapping(name, queue)
    }

    /// Drop every pending record for `name` from the default driver.
    pub fn forget(&self, name: &str, queue: Option<&str>) -> Result<usize> {
        let removed = self.registry.default_driver()?.forget(name, queue)?;
        info!(%name, queue = queue.unwrap_or("*"), removed, "jobs forgotten");
        Ok(removed)
    }

    fn resolve_driver(&self, name: Option<&str>) -> Result<Arc<dyn StorageDriver>> {
        match name {
            Some(name) => self.registry.driver(name),
            None => self.registry.default_driver(),
        }
    }
}

/// Fluent options for a single dispatch.
#[must_use = "a job builder does nothing until dispatched"]
pub struct JobBuilder<'a> {
    dispatcher: &'a Dispatcher,
    name: String,
    payload: String,
    queue: String,
    schedule: Schedule,
    without_overlapping: bool,
    driver: Option<String>,
}

impl JobBuilder<'_> {
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn at(mut self, schedule: impl Into<Schedule>) -> Self {
        self.schedule = schedule.into();
        self
    }

    /// Due `offset` after dispatch time.
    pub fn delay(mut self, offset: chrono::Duration) -> Self {
        self.schedule = Schedule::After(offset);
        self
    }

    /// Mark the record so [`Dispatcher::has_overlapping`] reports it.
    pub fn without_overlapping(mut self) -> Self {
        self.without_overlapping = true;
        self
    }

    /// Use a backend other than the configured default.
    pub fn via(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Resolve the schedule and persist exactly one record.
    pub fn dispatch(self) -> Result<PendingJob> {
        let driver = self.dispatcher.resolve_driver(self.driver.as_deref())?;
        let clock = self.dispatcher.registry.clock();
        let scheduled_at = self.schedule.resolve(clock.as_ref())?;

        let job = NewJob::new(self.name, self.payload)
            .on_queue(self.queue)
            .at(scheduled_at)
            .without_overlapping(self.without_overlapping);
        let record = driver.add(job)?;

        info!(
            job_id = %record.id,
            name = %record.name,
            queue = %record.queue,
            driver = driver.name(),
            %scheduled_at,
            "job dispatched"
        );
        Ok(PendingJob::new(record, driver.name()))
    }

    /// Dispatch unless an overlap-flagged record for this (name, queue) is
    /// already pending. Check and insert are not atomic.
    pub fn dispatch_unless_overlapping(self) -> Result<Option<PendingJob>> {
        let driver = self.dispatcher.resolve_driver(self.driver.as_deref())?;
        if driver.has_overlapping(&self.name, &self.queue)? {
            debug!(name = %self.name, queue = %self.queue, "overlapping job pending, dispatch skipped");
            return Ok(None);
        }
        self.without_overlapping().dispatch().map(Some)
    }
}
