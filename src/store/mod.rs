//! SQLite persistence for processing records and retry tasks.
//!
//! Two tables:
//!
//! - `processing_queue` — one row per inbound merge event run. The per-branch
//!   progress map and pending-listener map are JSON blob columns; the row is
//!   the unit of atomic mutation (see [`update_queue::UpdateQueue`]).
//! - `retry_queue` — persisted signals awaiting re-dispatch. Rows left over
//!   from a previous process are discarded at boot.
//!
//! # Schema Versioning
//!
//! A `schema_version` table tracks the schema version. Schema changes bump
//! `CURRENT_SCHEMA_VERSION` and add a migration in `run_migrations()`;
//! migrations run sequentially from the stored version to the target.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::types::{ChangeKey, ProcessingRecord, RecordState, RevisionId, RunId};

pub mod update_queue;

pub use update_queue::UpdateQueue;

/// Current schema version. Bump together with a migration in
/// `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("corrupt row for run {run_id}: {message}")]
    CorruptRow { run_id: String, message: String },
}

impl StoreError {
    fn storage(operation: impl Into<String>, message: impl ToString) -> Self {
        StoreError::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

/// SQLite-backed store.
///
/// The connection is shared behind a mutex; every operation is a short
/// statement or transaction, so contention stays negligible next to the
/// engine's external waits.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    ///
    /// WAL journaling and a busy timeout are configured for crash safety and
    /// graceful handling of concurrent access.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store, StoreError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::storage("open database", e))?;
        Self::initialize(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Store, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::storage("open in-memory database", e))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Store, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::storage("set journal_mode", e))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| StoreError::storage("set busy_timeout", e))?;

        run_migrations(&conn)?;

        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn).map_err(|e| StoreError::storage(operation, e))
    }

    // ─── processing_queue ───

    /// Inserts a fresh record. The run id must be new.
    pub fn insert_record(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        let (event, branches, listeners) = encode_blobs(record)?;
        self.with_conn("insert record", |conn| {
            conn.execute(
                "INSERT INTO processing_queue
                   (run_id, change_key, state, revision, merge_event,
                    branch_progress, pick_count_remaining, listener_cache)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.run_id.to_string(),
                    record.change_key.to_string(),
                    record.state.as_str(),
                    record.revision.as_str(),
                    event,
                    branches,
                    record.picks_remaining,
                    listeners,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn record_by_run(&self, run_id: RunId) -> Result<Option<ProcessingRecord>, StoreError> {
        let row = self.with_conn("load record", |conn| {
            conn.query_row(
                "SELECT run_id, state, revision, merge_event, branch_progress,
                        pick_count_remaining, listener_cache
                   FROM processing_queue WHERE run_id = ?1",
                params![run_id.to_string()],
                RawRecord::from_row,
            )
            .optional()
        })?;
        row.map(RawRecord::decode).transpose()
    }

    /// Finds a live (new/processing) record for a change/revision pair.
    /// Used for webhook redelivery idempotence.
    pub fn live_record_for(
        &self,
        change_key: &ChangeKey,
        revision: &RevisionId,
    ) -> Result<Option<ProcessingRecord>, StoreError> {
        let row = self.with_conn("look up live record", |conn| {
            conn.query_row(
                "SELECT run_id, state, revision, merge_event, branch_progress,
                        pick_count_remaining, listener_cache
                   FROM processing_queue
                  WHERE change_key = ?1 AND revision = ?2
                    AND state IN ('new', 'processing')",
                params![change_key.to_string(), revision.as_str()],
                RawRecord::from_row,
            )
            .optional()
        })?;
        row.map(RawRecord::decode).transpose()
    }

    pub fn records_in_state(
        &self,
        state: RecordState,
    ) -> Result<Vec<ProcessingRecord>, StoreError> {
        let rows = self.with_conn("list records", |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, state, revision, merge_event, branch_progress,
                        pick_count_remaining, listener_cache
                   FROM processing_queue WHERE state = ?1",
            )?;
            let rows = stmt
                .query_map(params![state.as_str()], RawRecord::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawRecord::decode).collect()
    }

    /// Rewrites a record's mutable columns (state, blobs). The pick counter
    /// is deliberately excluded: it changes only through
    /// [`Store::set_pick_count`] and [`Store::decrement_pick_count`], so a
    /// stale in-memory copy can never clobber a concurrent decrement.
    pub fn update_record(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        let (event, branches, listeners) = encode_blobs(record)?;
        self.with_conn("update record", |conn| {
            conn.execute(
                "UPDATE processing_queue
                    SET state = ?2, merge_event = ?3, branch_progress = ?4,
                        listener_cache = ?5
                  WHERE run_id = ?1",
                params![
                    record.run_id.to_string(),
                    record.state.as_str(),
                    event,
                    branches,
                    listeners,
                ],
            )
            .map(|_| ())
        })
    }

    pub fn set_state(&self, run_id: RunId, state: RecordState) -> Result<(), StoreError> {
        self.with_conn("set record state", |conn| {
            conn.execute(
                "UPDATE processing_queue SET state = ?2 WHERE run_id = ?1",
                params![run_id.to_string(), state.as_str()],
            )
            .map(|_| ())
        })
    }

    /// Initializes the remaining-pick counter when a manager takes ownership.
    pub fn set_pick_count(&self, run_id: RunId, count: i64) -> Result<(), StoreError> {
        self.with_conn("set pick count", |conn| {
            conn.execute(
                "UPDATE processing_queue SET pick_count_remaining = ?2 WHERE run_id = ?1",
                params![run_id.to_string(), count],
            )
            .map(|_| ())
        })
    }

    /// Decrements the remaining-pick counter, returning the new value.
    /// Reaching zero flips the aggregate state to `complete` in the same
    /// transaction, keeping the counter ⇔ state invariant out of callers'
    /// hands.
    pub fn decrement_pick_count(&self, run_id: RunId) -> Result<i64, StoreError> {
        let remaining = self.with_conn("decrement pick count", |conn| {
            let remaining: i64 = conn.query_row(
                "UPDATE processing_queue
                    SET pick_count_remaining = pick_count_remaining - 1
                  WHERE run_id = ?1
              RETURNING pick_count_remaining",
                params![run_id.to_string()],
                |row| row.get(0),
            )?;
            if remaining == 0 {
                conn.execute(
                    "UPDATE processing_queue SET state = 'complete'
                      WHERE run_id = ?1 AND state = 'processing'",
                    params![run_id.to_string()],
                )?;
            }
            Ok(remaining)
        })?;
        if remaining == 0 {
            info!(run_id = %run_id, "all branches terminal; record complete");
        }
        Ok(remaining)
    }

    // ─── retry_queue ───

    /// Persists a serialized signal for delayed re-dispatch. Returns the row
    /// id used to claim it later.
    pub fn push_retry(&self, signal_json: &str) -> Result<i64, StoreError> {
        self.with_conn("push retry task", |conn| {
            conn.execute(
                "INSERT INTO retry_queue (signal) VALUES (?1)",
                params![signal_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Deletes and returns a retry task. `None` means it was already
    /// consumed; the delete-before-dispatch order is what gives retries
    /// at-most-once semantics across a crash.
    pub fn take_retry(&self, id: i64) -> Result<Option<String>, StoreError> {
        self.with_conn("take retry task", |conn| {
            conn.query_row(
                "DELETE FROM retry_queue WHERE id = ?1 RETURNING signal",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Drops every persisted retry task. Called at boot: resumption relies
    /// on record/listener state, not stale retry rows.
    pub fn clear_retries(&self) -> Result<usize, StoreError> {
        self.with_conn("clear retry tasks", |conn| {
            conn.execute("DELETE FROM retry_queue", [])
        })
    }
}

/// Runs schema migrations from the stored version to
/// `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::storage("create schema_version", e))?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()
        .map_err(|e| StoreError::storage("read schema version", e))?;

    let mut version = match version {
        Some(v) => v,
        None => {
            conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])
                .map_err(|e| StoreError::storage("init schema version", e))?;
            0
        }
    };

    while version < CURRENT_SCHEMA_VERSION {
        match version {
            0 => {
                conn.execute_batch(
                    "CREATE TABLE processing_queue (
                         run_id               TEXT PRIMARY KEY,
                         change_key           TEXT NOT NULL,
                         state                TEXT NOT NULL,
                         revision             TEXT NOT NULL,
                         merge_event          TEXT NOT NULL,
                         branch_progress      TEXT NOT NULL,
                         pick_count_remaining INTEGER NOT NULL DEFAULT 0,
                         listener_cache       TEXT NOT NULL
                     );
                     CREATE INDEX idx_processing_state
                         ON processing_queue (state);
                     CREATE INDEX idx_processing_change
                         ON processing_queue (change_key, revision);
                     CREATE TABLE retry_queue (
                         id     INTEGER PRIMARY KEY AUTOINCREMENT,
                         signal TEXT NOT NULL
                     );",
                )
                .map_err(|e| StoreError::storage("migrate to v1", e))?;
            }
            v => {
                return Err(StoreError::storage(
                    "migrate",
                    format!("no migration defined from version {v}"),
                ));
            }
        }
        version += 1;
        conn.execute("UPDATE schema_version SET version = ?1", params![version])
            .map_err(|e| StoreError::storage("bump schema version", e))?;
    }

    Ok(())
}

/// A row as read from `processing_queue`, before blob decoding.
struct RawRecord {
    run_id: String,
    state: String,
    revision: String,
    merge_event: String,
    branch_progress: String,
    pick_count_remaining: i64,
    listener_cache: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            run_id: row.get(0)?,
            state: row.get(1)?,
            revision: row.get(2)?,
            merge_event: row.get(3)?,
            branch_progress: row.get(4)?,
            pick_count_remaining: row.get(5)?,
            listener_cache: row.get(6)?,
        })
    }

    fn decode(self) -> Result<ProcessingRecord, StoreError> {
        let corrupt = |message: String| StoreError::CorruptRow {
            run_id: self.run_id.clone(),
            message,
        };

        let run_id = self
            .run_id
            .parse::<uuid::Uuid>()
            .map(RunId)
            .map_err(|e| corrupt(format!("bad run id: {e}")))?;
        let state = RecordState::parse(&self.state)
            .ok_or_else(|| corrupt(format!("unknown state '{}'", self.state)))?;
        let event: crate::types::MergeEvent = serde_json::from_str(&self.merge_event)
            .map_err(|e| corrupt(format!("bad merge_event blob: {e}")))?;
        let branches = serde_json::from_str(&self.branch_progress)
            .map_err(|e| corrupt(format!("bad branch_progress blob: {e}")))?;
        let listeners = serde_json::from_str(&self.listener_cache)
            .map_err(|e| corrupt(format!("bad listener_cache blob: {e}")))?;

        // change_key is derivable from the event; the column exists for
        // indexed lookup only.
        Ok(ProcessingRecord {
            run_id,
            change_key: event.key(),
            state,
            revision: RevisionId::new(self.revision),
            event,
            branches,
            picks_remaining: self.pick_count_remaining,
            listeners,
        })
    }
}

fn encode_blobs(record: &ProcessingRecord) -> Result<(String, String, String), StoreError> {
    let encode = |what: &str, value: serde_json::Result<String>| {
        value.map_err(|e| StoreError::storage(format!("encode {what}"), e))
    };
    Ok((
        encode("merge_event", serde_json::to_string(&record.event))?,
        encode("branch_progress", serde_json::to_string(&record.branches))?,
        encode("listener_cache", serde_json::to_string(&record.listeners))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Branch, BranchStatus, MergeEvent, TerminalOutcome};

    fn event(change_id: &str, revision: &str) -> MergeEvent {
        MergeEvent {
            project: "qt/base".into(),
            branch: Branch::new("dev"),
            change_id: change_id.into(),
            number: 1,
            subject: "Fix".into(),
            url: "https://review.example/c/1".into(),
            owner: "owner@example.com".into(),
            commit_message: format!("Fix\n\nPick-to: 6.5\nChange-Id: {change_id}"),
            revision: revision.into(),
            uploader: "dev@example.com".into(),
        }
    }

    #[test]
    fn insert_then_load_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let mut record = ProcessingRecord::new(event("Iaaa", "rev1"));
        record.progress_mut(&Branch::new("6.5"));

        store.insert_record(&record).unwrap();
        let loaded = store.record_by_run(record.run_id).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn missing_record_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.record_by_run(RunId::new()).unwrap().is_none());
    }

    #[test]
    fn live_record_lookup_matches_only_new_and_processing() {
        let store = Store::open_in_memory().unwrap();
        let record = ProcessingRecord::new(event("Iaaa", "rev1"));
        let key = record.change_key.clone();
        let revision = record.revision.clone();
        store.insert_record(&record).unwrap();

        assert!(store.live_record_for(&key, &revision).unwrap().is_some());

        store.set_state(record.run_id, RecordState::Complete).unwrap();
        assert!(store.live_record_for(&key, &revision).unwrap().is_none());
    }

    #[test]
    fn update_preserves_counter() {
        let store = Store::open_in_memory().unwrap();
        let mut record = ProcessingRecord::new(event("Iaaa", "rev1"));
        store.insert_record(&record).unwrap();
        store.set_pick_count(record.run_id, 2).unwrap();

        // A stale in-memory copy must not clobber the counter.
        record.picks_remaining = 0;
        record.state = RecordState::Processing;
        store.update_record(&record).unwrap();

        let loaded = store.record_by_run(record.run_id).unwrap().unwrap();
        assert_eq!(loaded.picks_remaining, 2);
        assert_eq!(loaded.state, RecordState::Processing);
    }

    #[test]
    fn decrement_flips_state_to_complete_at_zero() {
        let store = Store::open_in_memory().unwrap();
        let mut record = ProcessingRecord::new(event("Iaaa", "rev1"));
        record.state = RecordState::Processing;
        record.progress_mut(&Branch::new("6.5"));
        record.progress_mut(&Branch::new("6.2"));
        store.insert_record(&record).unwrap();
        store.set_pick_count(record.run_id, 2).unwrap();

        assert_eq!(store.decrement_pick_count(record.run_id).unwrap(), 1);
        let mid = store.record_by_run(record.run_id).unwrap().unwrap();
        assert_eq!(mid.state, RecordState::Processing);

        assert_eq!(store.decrement_pick_count(record.run_id).unwrap(), 0);
        let done = store.record_by_run(record.run_id).unwrap().unwrap();
        assert_eq!(done.state, RecordState::Complete);
    }

    #[test]
    fn counter_matches_non_terminal_branches() {
        // The counter must always equal the number of non-terminal branches.
        let store = Store::open_in_memory().unwrap();
        let mut record = ProcessingRecord::new(event("Iaaa", "rev1"));
        record.state = RecordState::Processing;
        record.progress_mut(&Branch::new("6.5"));
        record.progress_mut(&Branch::new("6.2"));
        store.insert_record(&record).unwrap();
        store.set_pick_count(record.run_id, record.non_terminal_branches()).unwrap();

        record.finish_branch(&Branch::new("6.5"), TerminalOutcome::Staged);
        store.update_record(&record).unwrap();
        store.decrement_pick_count(record.run_id).unwrap();

        let loaded = store.record_by_run(record.run_id).unwrap().unwrap();
        assert_eq!(loaded.picks_remaining, loaded.non_terminal_branches());
        assert!(matches!(
            loaded.progress(&Branch::new("6.5")).unwrap().status,
            BranchStatus::Terminal(TerminalOutcome::Staged)
        ));
    }

    #[test]
    fn retry_take_is_consume_once() {
        let store = Store::open_in_memory().unwrap();
        let id = store.push_retry("{\"step\":\"x\"}").unwrap();

        assert_eq!(store.take_retry(id).unwrap().unwrap(), "{\"step\":\"x\"}");
        assert!(store.take_retry(id).unwrap().is_none());
    }

    #[test]
    fn clear_retries_discards_everything() {
        let store = Store::open_in_memory().unwrap();
        store.push_retry("a").unwrap();
        store.push_retry("b").unwrap();
        assert_eq!(store.clear_retries().unwrap(), 2);
        assert_eq!(store.clear_retries().unwrap(), 0);
    }

    #[test]
    fn records_in_state_filters() {
        let store = Store::open_in_memory().unwrap();
        let r1 = ProcessingRecord::new(event("Iaaa", "rev1"));
        let mut r2 = ProcessingRecord::new(event("Ibbb", "rev2"));
        r2.state = RecordState::Processing;
        store.insert_record(&r1).unwrap();
        store.insert_record(&r2).unwrap();

        let processing = store.records_in_state(RecordState::Processing).unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].run_id, r2.run_id);
    }

    #[test]
    fn reopening_a_database_file_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let record = ProcessingRecord::new(event("Iaaa", "rev1"));

        {
            let store = Store::open(&path).unwrap();
            store.insert_record(&record).unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert!(store.record_by_run(record.run_id).unwrap().is_some());
    }
}
