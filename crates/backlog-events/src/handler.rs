use std::collections::HashMap;
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use backlog_core::slugify;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{HandlerError, Result};
use crate::types::JobContext;

/// Synchronous job handler.
///
/// Runs on the sweeping thread; the runner waits for it before moving on.
pub trait JobHandler: Send + Sync {
    fn handle(&self, ctx: &JobContext) -> Result<()>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobContext) -> Result<()> + Send + Sync,
{
    fn handle(&self, ctx: &JobContext) -> Result<()> {
        self(ctx)
    }
}

/// Adapter that decodes the payload into `T` before calling `f`.
pub struct TypedHandler<T, E, F> {
    f: F,
    _marker: PhantomData<fn(T) -> E>,
}

impl<T, E, F> TypedHandler<T, E, F>
where
    T: DeserializeOwned,
    E: Display,
    F: Fn(T) -> std::result::Result<(), E> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<T, E, F> JobHandler for TypedHandler<T, E, F>
where
    T: DeserializeOwned,
    E: Display,
    F: Fn(T) -> std::result::Result<(), E> + Send + Sync,
{
    fn handle(&self, ctx: &JobContext) -> Result<()> {
        let input: T = ctx.payload_as()?;
        (self.f)(input).map_err(|e| HandlerError::Failed(e.to_string()))
    }
}

/// One handler per job slug.
///
/// Registering under a name that slugifies to an existing key replaces the
/// previous handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed closure for `name`.
    pub fn register<T, E, F>(&self, name: &str, f: F)
    where
        T: DeserializeOwned + 'static,
        E: Display + 'static,
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(TypedHandler::new(f)));
    }

    /// Register a handler that works on the raw context.
    pub fn register_handler(&self, name: &str, handler: Arc<dyn JobHandler>) {
        let slug = slugify(name);
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        if handlers.insert(slug.clone(), handler).is_some() {
            debug!(%slug, "job handler replaced");
        } else {
            debug!(%slug, "job handler registered");
        }
    }

    /// Silent no-op if nothing is registered under `name`.
    pub fn unregister(&self, name: &str) {
        let slug = slugify(name);
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        if handlers.remove(&slug).is_some() {
            debug!(%slug, "job handler unregistered");
        }
    }

    /// Lookup by slug (already normalised).
    pub fn get(&self, slug: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().expect("handler registry poisoned");
        handlers.get(slug).cloned()
    }

    pub fn contains(&self, slug: &str) -> bool {
        let handlers = self.handlers.read().expect("handler registry poisoned");
        handlers.contains_key(slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobEvent;
    use backlog_core::{JobRecord, NewJob};
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Deserialize)]
    struct Email {
        email: String,
    }

    fn ctx(name: &str, payload: &str) -> JobContext {
        let rec = JobRecord::create(NewJob::new(name, payload), chrono::Utc::now());
        JobContext::new(JobEvent::Processing, &rec, 1, 1)
    }

    #[test]
    fn typed_handler_receives_decoded_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        let sink = Arc::clone(&seen);
        registry.register("Send Email Job", move |e: Email| -> std::result::Result<(), String> {
            sink.lock().unwrap().push(e.email);
            Ok(())
        });

        let handler = registry.get("send-email-job").expect("registered under slug");
        handler.handle(&ctx("Send Email Job", r#"{"email":"user@example.com"}"#)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["user@example.com".to_string()]);
    }

    #[test]
    fn typed_handler_error_becomes_failed() {
        let registry = HandlerRegistry::new();
        registry.register("failing-job", |_: serde_json::Value| Err("smtp down"));

        let err = registry
            .get("failing-job")
            .unwrap()
            .handle(&ctx("failing-job", "{}"))
            .unwrap_err();
        assert_eq!(err.to_string(), "smtp down");
    }

    #[test]
    fn undecodable_payload_is_a_payload_error() {
        let registry = HandlerRegistry::new();
        registry.register("send-email-job", |_: Email| Ok::<(), String>(()));

        let err = registry
            .get("send-email-job")
            .unwrap()
            .handle(&ctx("send-email-job", r#"{"to":"x"}"#))
            .unwrap_err();
        assert!(matches!(err, HandlerError::Payload(_)));
    }

    #[test]
    fn unregister_removes_by_slug() {
        let registry = HandlerRegistry::new();
        registry.register_handler("Nightly Report", Arc::new(|_: &JobContext| -> Result<()> { Ok(()) }));
        assert!(registry.contains("nightly-report"));
        registry.unregister("nightly report");
        assert!(!registry.contains("nightly-report"));
    }
}
