//! `backlog-core`: shared types, configuration and collaborators for the
//! backlog job queue.
//!
//! Nothing in here touches storage. The record types, the slug rule and the
//! [`clock::Clock`] abstraction are consumed by every other crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod slug;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BacklogConfig, QueueConfig};
pub use error::{BacklogError, Result};
pub use slug::slugify;
pub use types::{FailedJobRecord, JobRecord, NewJob, DEFAULT_QUEUE};
