//! Queue repository: row operations on `queue_jobs`.
//!
//! Every state change is a single conditional statement, so a job is only
//! ever held by one claimant even when several processes share the file.
//! Timestamps in this table are epoch milliseconds.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// Reason recorded when a job exceeds its stall allowance.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// A raw queue row.
#[derive(Debug, Clone)]
pub struct QueueJobRow {
    pub id: String,
    pub queue: String,
    pub document_id: i64,
    pub payload: String,
    pub state: String,
    pub attempts_made: i64,
    pub max_attempts: i64,
    pub backoff_delay_ms: i64,
    pub progress: i64,
    pub result: Option<String>,
    pub failed_reason: Option<String>,
    pub stalled_count: i64,
    pub available_at: i64,
    pub locked_at: Option<i64>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl QueueJobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            document_id: row.get("document_id")?,
            payload: row.get("payload")?,
            state: row.get("state")?,
            attempts_made: row.get("attempts_made")?,
            max_attempts: row.get("max_attempts")?,
            backoff_delay_ms: row.get("backoff_delay_ms")?,
            progress: row.get("progress")?,
            result: row.get("result")?,
            failed_reason: row.get("failed_reason")?,
            stalled_count: row.get("stalled_count")?,
            available_at: row.get("available_at")?,
            locked_at: row.get("locked_at")?,
            created_at: row.get("created_at")?,
            finished_at: row.get("finished_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewJobRow {
    pub id: String,
    pub queue: String,
    pub document_id: i64,
    pub payload: String,
    pub max_attempts: i64,
    pub backoff_delay_ms: i64,
    pub now: i64,
}

/// Inserts a waiting job unless the id already exists. Returns whether a row
/// was written.
pub fn insert_in(conn: &Connection, job: &NewJobRow) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO queue_jobs
         (id, queue, document_id, payload, state, max_attempts, backoff_delay_ms,
          available_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, ?6, ?7, ?7)",
        params![
            job.id,
            job.queue,
            job.document_id,
            job.payload,
            job.max_attempts,
            job.backoff_delay_ms,
            job.now,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn insert(db: &Database, job: &NewJobRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| insert_in(conn, job))
}

/// Atomically moves the oldest due waiting job of `queue` to active.
pub fn claim_next(db: &Database, queue: &str, now: i64) -> Result<Option<QueueJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "UPDATE queue_jobs SET state = 'active', locked_at = ?2, progress = 0
                 WHERE id = (
                     SELECT id FROM queue_jobs
                     WHERE queue = ?1 AND state = 'waiting' AND available_at <= ?2
                     ORDER BY available_at ASC, created_at ASC
                     LIMIT 1
                 ) AND state = 'waiting'
                 RETURNING *",
                params![queue, now],
                QueueJobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Records progress and renews the lock. Returns false if the job is no
/// longer active (e.g. requeued as stalled).
pub fn update_progress(db: &Database, id: &str, progress: i64, now: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE queue_jobs SET progress = ?2, locked_at = ?3
             WHERE id = ?1 AND state = 'active'",
            params![id, progress, now],
        )?;
        Ok(updated == 1)
    })
}

pub fn complete(db: &Database, id: &str, result: &str, now: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE queue_jobs SET state = 'completed', progress = 100, result = ?2,
             attempts_made = attempts_made + 1, locked_at = NULL, finished_at = ?3
             WHERE id = ?1 AND state = 'active'",
            params![id, result, now],
        )?;
        Ok(updated == 1)
    })
}

/// Puts a failed attempt back in line, due at `available_at`.
pub fn retry(
    db: &Database,
    id: &str,
    reason: &str,
    available_at: i64,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE queue_jobs SET state = 'waiting', progress = 0, failed_reason = ?2,
             attempts_made = attempts_made + 1, locked_at = NULL, available_at = ?3
             WHERE id = ?1 AND state = 'active'",
            params![id, reason, available_at],
        )?;
        Ok(updated == 1)
    })
}

pub fn fail(db: &Database, id: &str, reason: &str, now: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE queue_jobs SET state = 'failed', failed_reason = ?2,
             attempts_made = attempts_made + 1, locked_at = NULL, finished_at = ?3
             WHERE id = ?1 AND state = 'active'",
            params![id, reason, now],
        )?;
        Ok(updated == 1)
    })
}

/// Jobs moved by one stall sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StalledSweep {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

/// Active jobs whose lock was last renewed before `lock_cutoff` are put back
/// in line, or failed once they have stalled more than `max_stalled` times.
pub fn requeue_stalled(
    db: &Database,
    lock_cutoff: i64,
    max_stalled: i64,
    now: i64,
) -> Result<StalledSweep, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;

        let failed = {
            let mut stmt = tx.prepare(
                "UPDATE queue_jobs SET state = 'failed', stalled_count = stalled_count + 1,
                 failed_reason = ?3, locked_at = NULL, finished_at = ?4
                 WHERE state = 'active' AND locked_at < ?1 AND stalled_count + 1 > ?2
                 RETURNING id",
            )?;
            let ids = stmt
                .query_map(params![lock_cutoff, max_stalled, STALLED_REASON, now], |r| {
                    r.get(0)
                })?
                .collect::<Result<Vec<String>, _>>()?;
            ids
        };

        let requeued = {
            let mut stmt = tx.prepare(
                "UPDATE queue_jobs SET state = 'waiting', stalled_count = stalled_count + 1,
                 progress = 0, locked_at = NULL, available_at = ?2
                 WHERE state = 'active' AND locked_at < ?1
                 RETURNING id",
            )?;
            let ids = stmt
                .query_map(params![lock_cutoff, now], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            ids
        };

        tx.commit()?;
        Ok(StalledSweep { requeued, failed })
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<QueueJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM queue_jobs WHERE id = ?1",
                params![id],
                QueueJobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Most recent job for a document.
pub fn find_latest_for_document(
    db: &Database,
    document_id: i64,
) -> Result<Option<QueueJobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM queue_jobs WHERE document_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![document_id],
                QueueJobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Number of jobs in `queue` per state.
pub fn count_by_state(db: &Database, queue: &str) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM queue_jobs WHERE queue = ?1
             GROUP BY state ORDER BY state",
        )?;
        let rows = stmt
            .query_map(params![queue], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Keeps the newest `keep` finished jobs of `queue` in `state` and deletes
/// the rest. Returns the number deleted.
pub fn prune(db: &Database, queue: &str, state: &str, keep: u64) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM queue_jobs WHERE queue = ?1 AND state = ?2 AND id NOT IN (
                 SELECT id FROM queue_jobs WHERE queue = ?1 AND state = ?2
                 ORDER BY finished_at DESC, created_at DESC LIMIT ?3
             )",
            params![queue, state, keep as i64],
        )?;
        Ok(deleted)
    })
}

/// Drops jobs for a document that no worker has picked up yet.
pub fn delete_waiting_for_document(db: &Database, document_id: i64) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM queue_jobs WHERE document_id = ?1 AND state = 'waiting'",
            params![document_id],
        )?;
        Ok(deleted)
    })
}
