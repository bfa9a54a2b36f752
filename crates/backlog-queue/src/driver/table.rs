use std::path::Path;
use std::sync::{Arc, Mutex};

use backlog_core::{slugify, Clock, FailedJobRecord, JobRecord, NewJob};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use super::{DueFilter, StorageDriver};
use crate::db::{init_db, TableNames};
use crate::error::{QueueError, Result};

const JOB_COLUMNS: &str = "id, name, slug, queue, payload, scheduled_at, without_overlapping, created_at";
const FAILED_COLUMNS: &str = "id, name, queue, payload, exception, failed_at";

/// SQLite-backed driver: one row per pending job, one per dead letter.
///
/// A row is claimed by stamping `reserved_at`; the conditional UPDATE makes
/// the claim exclusive across connections sharing the same database file.
pub struct TableDriver {
    conn: Mutex<Connection>,
    tables: TableNames,
    clock: Arc<dyn Clock>,
}

impl TableDriver {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection, tables: TableNames, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn, &tables)?;
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
            clock,
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, tables: TableNames, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // WAL lets a CLI inspect the queue while a worker sweeps it.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        info!(path = %path.display(), jobs = tables.jobs(), failed = tables.failed(), "table queue driver ready");
        Self::new(conn, tables, clock)
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    fn query_jobs(&self, sql: &str, args: Vec<Value>) -> Result<Vec<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl StorageDriver for TableDriver {
    fn name(&self) -> &'static str {
        "database"
    }

    #[instrument(skip(self, job), fields(name = %job.name, queue = %job.queue))]
    fn add(&self, job: NewJob) -> Result<JobRecord> {
        let record = JobRecord::create(job, self.clock.now());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} ({JOB_COLUMNS}, reserved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                self.tables.jobs()
            ),
            params![
                record.id,
                record.name,
                record.slug,
                record.queue,
                record.payload,
                ts(record.scheduled_at),
                record.without_overlapping,
                ts(record.created_at),
            ],
        )?;
        debug!(job_id = %record.id, "job row inserted");
        Ok(record)
    }

    fn has_overlapping(&self, name: &str, queue: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: bool = conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE slug = ?1 AND queue = ?2 AND without_overlapping = 1)",
                self.tables.jobs()
            ),
            params![slugify(name), queue],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    #[instrument(skip(self))]
    fn forget(&self, name: &str, queue: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let slug = slugify(name);
        let removed = match queue {
            Some(q) => conn.execute(
                &format!("DELETE FROM {} WHERE slug = ?1 AND queue = ?2", self.tables.jobs()),
                params![slug, q],
            )?,
            None => conn.execute(
                &format!("DELETE FROM {} WHERE slug = ?1", self.tables.jobs()),
                params![slug],
            )?,
        };
        debug!(removed, "job rows forgotten");
        Ok(removed)
    }

    fn pending(&self, name: Option<&str>) -> Result<Vec<JobRecord>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM {}", self.tables.jobs());
        let mut args = Vec::new();
        if let Some(name) = name {
            sql.push_str(" WHERE slug = ?1");
            args.push(Value::Text(slugify(name)));
        }
        sql.push_str(" ORDER BY created_at, id");
        self.query_jobs(&sql, args)
    }

    fn due(&self, filter: &DueFilter, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let mut sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE reserved_at IS NULL AND scheduled_at <= ?1",
            self.tables.jobs()
        );
        let mut args = vec![Value::Integer(ts(now))];
        if let Some(slug) = &filter.slug {
            args.push(Value::Text(slug.clone()));
            sql.push_str(&format!(" AND slug = ?{}", args.len()));
        }
        if let Some(queues) = &filter.queues {
            if queues.is_empty() {
                return Ok(Vec::new());
            }
            let start = args.len() + 1;
            let placeholders: Vec<String> = (start..start + queues.len()).map(|i| format!("?{i}")).collect();
            sql.push_str(&format!(" AND queue IN ({})", placeholders.join(", ")));
            args.extend(queues.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY created_at, id");
        self.query_jobs(&sql, args)
    }

    fn claim(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!(
                "UPDATE {} SET reserved_at = ?1 WHERE id = ?2 AND reserved_at IS NULL",
                self.tables.jobs()
            ),
            params![ts(now), record.id],
        )?;
        if n == 0 {
            debug!(job_id = %record.id, "claim lost: row already reserved or removed");
        }
        Ok(n == 1)
    }

    fn release(&self, record: &JobRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("UPDATE {} SET reserved_at = NULL WHERE id = ?1", self.tables.jobs()),
            params![record.id],
        )?;
        Ok(())
    }

    fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!(
                "UPDATE {} SET reserved_at = NULL WHERE reserved_at IS NOT NULL AND reserved_at < ?1",
                self.tables.jobs()
            ),
            params![ts(claimed_before)],
        )?;
        if n > 0 {
            warn!(count = n, "stale claims released");
        }
        Ok(n)
    }

    fn complete(&self, record: &JobRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.tables.jobs()),
            params![record.id],
        )?;
        Ok(())
    }

    fn fail(&self, record: &JobRecord, exception: &str, failed_at: DateTime<Utc>) -> Result<FailedJobRecord> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.tables.jobs()),
            params![record.id],
        )?;
        if removed == 0 {
            // Already dead-lettered, or forgotten while the handler ran.
            return tx
                .query_row(
                    &format!("SELECT {FAILED_COLUMNS} FROM {} WHERE id = ?1", self.tables.failed()),
                    params![record.id],
                    failed_from_row,
                )
                .optional()?
                .ok_or_else(|| QueueError::JobNotFound { id: record.id.clone() });
        }

        let failed = record.clone().into_failed(exception, failed_at);
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({FAILED_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                self.tables.failed()
            ),
            params![
                failed.id,
                failed.name,
                failed.queue,
                failed.payload,
                failed.exception,
                ts(failed.failed_at),
            ],
        )?;
        tx.commit()?;
        Ok(failed)
    }

    fn failed(&self) -> Result<Vec<FailedJobRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FAILED_COLUMNS} FROM {} ORDER BY failed_at DESC, id",
            self.tables.failed()
        ))?;
        let rows = stmt
            .query_map([], failed_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn find_failed(&self, id: &str) -> Result<Option<FailedJobRecord>> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                &format!("SELECT {FAILED_COLUMNS} FROM {} WHERE id = ?1", self.tables.failed()),
                params![id],
                failed_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn purge_failed(&self, id: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = match id {
            Some(id) => conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.tables.failed()),
                params![id],
            )?,
            None => conn.execute(&format!("DELETE FROM {}", self.tables.failed()), [])?,
        };
        info!(removed, "dead letters purged");
        Ok(removed)
    }

    fn retry_failed(&self, id: &str, now: DateTime<Utc>) -> Result<JobRecord> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let failed = tx
            .query_row(
                &format!("SELECT {FAILED_COLUMNS} FROM {} WHERE id = ?1", self.tables.failed()),
                params![id],
                failed_from_row,
            )
            .optional()?
            .ok_or_else(|| QueueError::JobNotFound { id: id.to_string() })?;
        let record = failed.into_pending(now);
        tx.execute(
            &format!(
                "INSERT INTO {} ({JOB_COLUMNS}, reserved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
                self.tables.jobs()
            ),
            params![
                record.id,
                record.name,
                record.slug,
                record.queue,
                record.payload,
                ts(record.scheduled_at),
                record.without_overlapping,
                ts(record.created_at),
            ],
        )?;
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.tables.failed()),
            params![id],
        )?;
        tx.commit()?;
        info!(job_id = %id, "dead letter re-queued");
        Ok(record)
    }
}

/// Microseconds since the Unix epoch; integer order is time order.
fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn parse_ts(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, format!("timestamp out of range: {micros}").into())
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        queue: row.get(3)?,
        payload: row.get(4)?,
        scheduled_at: parse_ts(5, row.get(5)?)?,
        without_overlapping: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

fn failed_from_row(row: &Row<'_>) -> rusqlite::Result<FailedJobRecord> {
    Ok(FailedJobRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        queue: row.get(2)?,
        payload: row.get(3)?,
        exception: row.get(4)?,
        failed_at: parse_ts(5, row.get(5)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use backlog_core::ManualClock;
    use chrono::{Duration, TimeZone};

    fn setup() -> (Arc<ManualClock>, TableDriver) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap()));
        let conn = Connection::open_in_memory().unwrap();
        let driver = TableDriver::new(conn, TableNames::default(), clock.clone()).unwrap();
        (clock, driver)
    }

    #[test]
    fn timestamps_order_past_year_9999() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let b = a + Duration::microseconds(1);
        let far = Utc.timestamp_opt(1_800_000_000_000, 0).unwrap();
        assert!(ts(a) < ts(b));
        assert!(ts(b) < ts(far));
        assert_eq!(parse_ts(0, ts(b)).unwrap(), b);
        assert_eq!(parse_ts(0, ts(far)).unwrap(), far);
    }

    #[test]
    fn claim_only_succeeds_once() {
        let (clock, driver) = setup();
        let rec = driver.add(NewJob::new("report", "{}")).unwrap();

        assert!(driver.claim(&rec, clock.now()).unwrap());
        assert!(!driver.claim(&rec, clock.now()).unwrap());
        assert!(driver.due(&DueFilter::default(), clock.now()).unwrap().is_empty());
        assert_eq!(driver.pending(None).unwrap().len(), 1);

        driver.release(&rec).unwrap();
        assert!(driver.claim(&rec, clock.now()).unwrap());
    }

    #[test]
    fn release_stale_only_touches_old_claims() {
        let (clock, driver) = setup();
        let old = driver.add(NewJob::new("old", "{}")).unwrap();
        let fresh = driver.add(NewJob::new("fresh", "{}")).unwrap();
        driver.claim(&old, clock.now()).unwrap();
        clock.advance(Duration::minutes(30));
        driver.claim(&fresh, clock.now()).unwrap();

        assert_eq!(driver.release_stale(clock.now() - Duration::minutes(10)).unwrap(), 1);
        let due = driver.due(&DueFilter::default(), clock.now()).unwrap();
        assert_eq!(due.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec![old.id.as_str()]);
    }

    #[test]
    fn due_filter_binds_queue_allowlist() {
        let (clock, driver) = setup();
        driver.add(NewJob::new("a", "{}").on_queue("high")).unwrap();
        driver.add(NewJob::new("b", "{}").on_queue("low")).unwrap();
        driver.add(NewJob::new("c", "{}")).unwrap();

        let f = DueFilter::sweep(Some(&["high", "default"][..]));
        let due = driver.due(&f, clock.now()).unwrap();
        assert_eq!(due.iter().map(|r| r.slug.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);

        let none = DueFilter::sweep::<&str>(Some(&[][..]));
        assert!(driver.due(&none, clock.now()).unwrap().is_empty());
    }

    #[test]
    fn retry_of_unknown_dead_letter_is_not_found() {
        let (clock, driver) = setup();
        let err = driver.retry_failed("missing", clock.now()).unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound { .. }));
    }

    #[test]
    fn custom_table_names_are_used() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let conn = Connection::open_in_memory().unwrap();
        let tables = TableNames::new("queued", "dead").unwrap();
        let driver = TableDriver::new(conn, tables, clock.clone()).unwrap();

        let rec = driver.add(NewJob::new("x", "{}")).unwrap();
        driver.claim(&rec, clock.now()).unwrap();
        driver.fail(&rec, "boom", clock.now()).unwrap();

        let conn = driver.conn.lock().unwrap();
        let dead: i64 = conn.query_row("SELECT COUNT(*) FROM dead", [], |r| r.get(0)).unwrap();
        let queued: i64 = conn.query_row("SELECT COUNT(*) FROM queued", [], |r| r.get(0)).unwrap();
        assert_eq!((dead, queued), (1, 0));
    }

    fn row_counts(driver: &TableDriver) -> (i64, i64) {
        let conn = driver.conn.lock().unwrap();
        let jobs: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0)).unwrap();
        let failed: i64 = conn.query_row("SELECT COUNT(*) FROM failed_jobs", [], |r| r.get(0)).unwrap();
        (jobs, failed)
    }

    #[test]
    fn fail_is_repeatable() {
        let (clock, driver) = setup();
        let rec = driver.add(NewJob::new("flaky", "{}").on_queue("high")).unwrap();
        assert!(driver.claim(&rec, clock.now()).unwrap());

        driver.fail(&rec, "first", clock.now()).unwrap();
        let again = driver.fail(&rec, "second", clock.now()).unwrap();

        // the move already happened; the stored dead letter stands
        assert_eq!(again.exception, "first");
        assert_eq!(row_counts(&driver), (0, 1));
        assert_eq!(driver.failed().unwrap()[0].queue, "high");
    }

    #[test]
    fn fail_after_forget_writes_no_dead_letter() {
        let (clock, driver) = setup();
        let rec = driver.add(NewJob::new("cancelled", "{}")).unwrap();
        assert!(driver.claim(&rec, clock.now()).unwrap());
        assert_eq!(driver.forget("cancelled", None).unwrap(), 1);

        let err = driver.fail(&rec, "boom", clock.now()).unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound { .. }));
        assert_eq!(row_counts(&driver), (0, 0));
    }

    #[test]
    fn storage_errors_surface_from_add_and_forget() {
        let (_clock, driver) = setup();
        driver.conn.lock().unwrap().execute_batch("DROP TABLE jobs;").unwrap();

        assert!(matches!(driver.add(NewJob::new("report", "{}")), Err(QueueError::Database(_))));
        assert!(matches!(driver.forget("report", None), Err(QueueError::Database(_))));
        assert!(driver.pending(None).is_err());
    }
}
