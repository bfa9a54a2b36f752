//! `backlog-queue`: persisted deferred jobs with retry and dead-lettering.
//!
//! # Overview
//!
//! A [`Dispatcher`] normalises a schedule and writes one record through a
//! [`StorageDriver`]. A [`Runner`] later picks due records, claims each one,
//! hands it to the [`backlog_events::EventSink`] and either deletes it or,
//! once attempts run out, moves it to the dead-letter store.
//!
//! # Backends
//!
//! | Name       | Driver          | Claim                                     |
//! |------------|-----------------|-------------------------------------------|
//! | `file`     | [`FileDriver`]  | rename `{slug}__{id}.job` → `.claimed`    |
//! | `database` | [`TableDriver`] | `UPDATE … SET reserved_at WHERE … IS NULL` |
//!
//! Nothing here spawns threads on its own. Call [`Runner::sweep`] from an
//! external timer, or drive it in-process with a [`Ticker`].

pub mod db;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod ticker;

pub use db::TableNames;
pub use dispatch::{Dispatcher, JobBuilder, PendingJob};
pub use driver::{DueFilter, FileDriver, StorageDriver, TableDriver};
pub use error::{QueueError, Result};
pub use registry::DriverRegistry;
pub use runner::{RunReport, Runner};
pub use schedule::Schedule;
pub use ticker::Ticker;
