use backlog_core::config::DatabaseConfig;
use rusqlite::Connection;

use crate::error::{QueueError, Result};

/// Names of the pending and failed tables.
///
/// Both end up spliced into SQL text, so they are restricted to plain
/// identifiers at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    jobs: String,
    failed: String,
}

impl TableNames {
    pub fn new(jobs: &str, failed: &str) -> Result<Self> {
        for name in [jobs, failed] {
            if !is_identifier(name) {
                return Err(QueueError::InvalidTableName(name.to_string()));
            }
        }
        if jobs == failed {
            return Err(QueueError::InvalidTableName(format!(
                "{jobs} (pending and failed tables must differ)"
            )));
        }
        Ok(Self {
            jobs: jobs.to_string(),
            failed: failed.to_string(),
        })
    }

    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::new(&config.jobs_table, &config.failed_jobs_table)
    }

    pub fn jobs(&self) -> &str {
        &self.jobs
    }

    pub fn failed(&self) -> &str {
        &self.failed
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            jobs: backlog_core::config::DEFAULT_JOBS_TABLE.to_string(),
            failed: backlog_core::config::DEFAULT_FAILED_JOBS_TABLE.to_string(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Initialise the queue schema in `conn`.
///
/// Creates both tables (idempotent) plus the indexes the due-scan and the
/// slug lookups rely on. Timestamps are INTEGER microseconds since the Unix
/// epoch, so SQL comparison and ordering are chronological for any year.
pub fn init_db(conn: &Connection, tables: &TableNames) -> Result<()> {
    let jobs = tables.jobs();
    let failed = tables.failed();
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {jobs} (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            slug                TEXT    NOT NULL,
            queue               TEXT    NOT NULL DEFAULT 'default',
            payload             TEXT    NOT NULL,
            scheduled_at        INTEGER NOT NULL,
            without_overlapping INTEGER NOT NULL DEFAULT 0,
            reserved_at         INTEGER,            -- set while a sweep owns the row
            created_at          INTEGER NOT NULL
        ) STRICT;

        -- Due-scan: WHERE reserved_at IS NULL AND scheduled_at <= ? ORDER BY created_at
        CREATE INDEX IF NOT EXISTS idx_{jobs}_due ON {jobs} (scheduled_at, created_at);
        CREATE INDEX IF NOT EXISTS idx_{jobs}_slug_queue ON {jobs} (slug, queue);

        CREATE TABLE IF NOT EXISTS {failed} (
            id          TEXT NOT NULL PRIMARY KEY,
            name        TEXT NOT NULL,
            queue       TEXT NOT NULL,
            payload     TEXT NOT NULL,
            exception   TEXT NOT NULL,
            failed_at   INTEGER NOT NULL
        ) STRICT;
        ",
    ))?;
    Ok(())
}
