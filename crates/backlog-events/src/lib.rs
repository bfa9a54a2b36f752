//! `backlog-events`: how due jobs reach application code.
//!
//! Handlers are registered per job name and receive the payload decoded into
//! their own input type. Listeners observe lifecycle events
//! (`backlog.job.processing`, `.processed`, `.retrying`, `.failed`) without
//! influencing the outcome.

pub mod bus;
pub mod error;
pub mod handler;
pub mod types;

pub use bus::{EventBus, EventSink, Listener};
pub use error::{HandlerError, Result};
pub use handler::{HandlerRegistry, JobHandler, TypedHandler};
pub use types::{JobContext, JobEvent, JOB_PROCESSING};
