use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{HandlerError, Result};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::types::{JobContext, JobEvent};

/// An observer bound to one lifecycle event.
pub struct Listener {
    /// Unique name used for removal and log correlation.
    pub name: String,
    pub event: JobEvent,
    pub handler: Arc<dyn JobHandler>,
    /// Lower value = earlier execution. Ties broken by registration order.
    pub priority: i32,
}

impl Listener {
    pub fn new(name: impl Into<String>, event: JobEvent, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            event,
            handler,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Observer list for job lifecycle events.
///
/// Listeners only watch: their errors and panics are logged and never reach
/// the runner.
#[derive(Default)]
pub struct EventBus {
    /// Sorted by priority ascending after every registration.
    listeners: RwLock<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Re-sorts the list so priority order is always correct.
    pub fn listen(&self, listener: Listener) {
        let mut listeners = self.listeners.write().expect("listener list poisoned");
        debug!(name = %listener.name, event = %listener.event, "listener registered");
        listeners.push(listener);
        // Stable sort preserves registration order within the same priority.
        listeners.sort_by_key(|l| l.priority);
    }

    /// Remove a listener by name. Silent no-op if the name is not found.
    pub fn unlisten(&self, name: &str) {
        let mut listeners = self.listeners.write().expect("listener list poisoned");
        let before = listeners.len();
        listeners.retain(|l| l.name != name);
        if listeners.len() < before {
            debug!(name, "listener removed");
        }
    }

    /// Run every listener for `ctx.event` in priority order; returns how many ran.
    pub fn publish(&self, ctx: &JobContext) -> usize {
        let listeners = self.listeners.read().expect("listener list poisoned");
        let mut ran = 0;

        for listener in listeners.iter().filter(|l| l.event == ctx.event) {
            let t = Instant::now();
            let result = call_guarded(listener.handler.as_ref(), ctx);
            let elapsed_ms = t.elapsed().as_millis() as u64;
            ran += 1;

            match result {
                Ok(()) => debug!(
                    listener = %listener.name,
                    event = %ctx.event,
                    duration_ms = elapsed_ms,
                    "listener completed"
                ),
                Err(e) => warn!(
                    listener = %listener.name,
                    event = %ctx.event,
                    job_id = %ctx.id,
                    "listener failed (ignored): {e}"
                ),
            }
        }
        ran
    }
}

/// The engine's only route to application code: typed job handlers plus
/// lifecycle observers.
#[derive(Default)]
pub struct EventSink {
    handlers: HandlerRegistry,
    bus: EventBus,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Shorthand for [`HandlerRegistry::register`].
    pub fn register<T, E, F>(&self, name: &str, f: F)
    where
        T: serde::de::DeserializeOwned + 'static,
        E: std::fmt::Display + 'static,
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        self.handlers.register(name, f);
    }

    /// Shorthand for [`EventBus::listen`].
    pub fn listen(&self, listener: Listener) {
        self.bus.listen(listener);
    }

    pub fn has_handler(&self, slug: &str) -> bool {
        self.handlers.contains(slug)
    }

    /// Publish the processing event and run the job's handler to completion.
    ///
    /// Observers of [`JobEvent::Processing`] run first. A panicking handler
    /// is reported as [`HandlerError::Panicked`] so one bad job cannot take
    /// down a sweep.
    pub fn process(&self, ctx: &JobContext) -> Result<()> {
        self.bus.publish(ctx);

        let handler = self
            .handlers
            .get(&ctx.slug)
            .ok_or_else(|| HandlerError::NoHandler {
                name: ctx.name.clone(),
            })?;

        let t = Instant::now();
        let result = call_guarded(handler.as_ref(), ctx);
        debug!(
            job_id = %ctx.id,
            slug = %ctx.slug,
            attempt = ctx.attempt,
            duration_ms = t.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "handler returned"
        );
        result
    }

    /// Tell observers about a lifecycle transition.
    pub fn notify(&self, ctx: &JobContext) {
        self.bus.publish(ctx);
    }
}

fn call_guarded(handler: &dyn JobHandler, ctx: &JobContext) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(ctx))).unwrap_or_else(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Err(HandlerError::Panicked(msg))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use backlog_core::{JobRecord, NewJob};
    use std::sync::Mutex;

    fn ctx(event: JobEvent, name: &str) -> JobContext {
        let rec = JobRecord::create(NewJob::new(name, "{}"), chrono::Utc::now());
        JobContext::new(event, &rec, 1, 1)
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Arc<dyn JobHandler> {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        Arc::new(move |c: &JobContext| -> Result<()> {
            log.lock().unwrap().push(format!("{tag}:{}", c.event));
            Ok(())
        })
    }

    #[test]
    fn listeners_run_in_priority_order_for_their_event_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.listen(Listener::new("late", JobEvent::Processed, recorder(&log, "late")).with_priority(10));
        bus.listen(Listener::new("early", JobEvent::Processed, recorder(&log, "early")).with_priority(-1));
        bus.listen(Listener::new("other", JobEvent::Failed, recorder(&log, "other")));

        let ran = bus.publish(&ctx(JobEvent::Processed, "x"));
        assert_eq!(ran, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["early:backlog.job.processed", "late:backlog.job.processed"]
        );
    }

    #[test]
    fn failing_listener_does_not_stop_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.listen(Listener::new(
            "broken",
            JobEvent::Failed,
            Arc::new(|_: &JobContext| -> Result<()> { panic!("listener bug") }),
        ));
        bus.listen(Listener::new("ok", JobEvent::Failed, recorder(&log, "ok")).with_priority(1));

        assert_eq!(bus.publish(&ctx(JobEvent::Failed, "x")), 2);
        assert_eq!(log.lock().unwrap().len(), 1);

        bus.unlisten("broken");
        assert_eq!(bus.publish(&ctx(JobEvent::Failed, "x")), 1);
    }

    #[test]
    fn process_announces_then_runs_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = EventSink::new();
        sink.listen(Listener::new("obs", JobEvent::Processing, recorder(&log, "obs")));
        let seen = Arc::clone(&log);
        sink.register("Send Email Job", move |_: serde_json::Value| -> std::result::Result<(), String> {
            seen.lock().unwrap().push("handler".into());
            Ok(())
        });

        sink.process(&ctx(JobEvent::Processing, "Send Email Job")).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["obs:backlog.job.processing", "handler"]);
    }

    #[test]
    fn missing_handler_and_panics_are_errors() {
        let sink = EventSink::new();
        let err = sink.process(&ctx(JobEvent::Processing, "nobody-home")).unwrap_err();
        assert!(matches!(err, HandlerError::NoHandler { .. }));

        sink.handlers().register_handler(
            "explodes",
            Arc::new(|_: &JobContext| -> Result<()> { panic!("kaboom") }),
        );
        let err = sink.process(&ctx(JobEvent::Processing, "explodes")).unwrap_err();
        match err {
            HandlerError::Panicked(msg) => assert_eq!(msg, "kaboom"),
            other => panic!("expected panic error, got {other:?}"),
        }
    }
}
