use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{
    AnalysisRecord, NewRun, RunState, RunStatus, RunSummary, Stage, StageResults,
};
use crate::pipeline::sanitize::{LooseValue, sanitize};
use crate::util::{ensure_directory, now_utc_string};

use super::{RunStore, StageOutput};

const DB_SCHEMA_VERSION: &str = "1";

/// SQLite-backed run store. Without a connection every call fails softly.
pub struct SqliteRunStore {
    connection: Option<Mutex<Connection>>,
}

impl SqliteRunStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }

        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {}", db_path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;

        info!(path = %db_path.display(), "run store opened");
        Ok(Self {
            connection: Some(Mutex::new(connection)),
        })
    }

    /// Opens `db_path`, or falls back to an unavailable store with a warning.
    pub fn open_or_unavailable(db_path: &Path) -> Self {
        match Self::open(db_path) {
            Ok(store) => store,
            Err(err) => {
                warn!(path = %db_path.display(), error = %err, "run store unavailable, results stay in memory");
                Self::unavailable()
            }
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory database")?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        ensure_schema(&connection)?;
        Ok(Self {
            connection: Some(Mutex::new(connection)),
        })
    }

    pub fn unavailable() -> Self {
        Self { connection: None }
    }

    fn with_connection<T>(
        &self,
        operation: &str,
        run_id: &str,
        work: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Option<T> {
        let Some(connection) = &self.connection else {
            debug!(operation, run_id, "skipping storage call, store unavailable");
            return None;
        };

        let mut guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
        match work(&mut *guard) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(operation, run_id, error = %err, "storage operation failed");
                None
            }
        }
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
              run_id TEXT PRIMARY KEY,
              title TEXT NOT NULL,
              source_path TEXT NOT NULL,
              source_sha256 TEXT NOT NULL,
              source_bytes INTEGER NOT NULL DEFAULT 0,
              status TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stage_records (
              record_id TEXT PRIMARY KEY,
              run_id TEXT NOT NULL,
              stage TEXT NOT NULL,
              seq INTEGER NOT NULL,
              source_id TEXT,
              record_json TEXT NOT NULL,
              stored_at TEXT NOT NULL,
              FOREIGN KEY(run_id) REFERENCES runs(run_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_stage_records_order ON stage_records(run_id, stage, seq);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_stage_records_single_book
              ON stage_records(run_id) WHERE stage = 'book';
            ",
        )
        .context("failed to create run store schema")?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now_utc_string()],
    )?;

    Ok(())
}

fn load_status(connection: &Connection, run_id: &str) -> Result<Option<RunStatus>> {
    let raw: Option<String> = connection
        .query_row(
            "SELECT status FROM runs WHERE run_id = ?1",
            [run_id],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(value) => match RunStatus::parse(&value) {
            Some(status) => Ok(Some(status)),
            None => bail!("run {run_id} has unknown status {value}"),
        },
        None => Ok(None),
    }
}

fn insert_records(
    connection: &mut Connection,
    run_id: &str,
    stage: Stage,
    records: &[AnalysisRecord],
) -> Result<()> {
    let tx = connection.transaction()?;
    let next_seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM stage_records WHERE run_id = ?1 AND stage = ?2",
        params![run_id, stage.as_str()],
        |row| row.get(0),
    )?;

    let stored_at = now_utc_string();
    for (offset, record) in records.iter().enumerate() {
        let record_json = serde_json::to_string(record)
            .with_context(|| format!("failed to serialize {} record", stage.as_str()))?;
        tx.execute(
            "
            INSERT INTO stage_records(record_id, run_id, stage, seq, source_id, record_json, stored_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                Uuid::new_v4().to_string(),
                run_id,
                stage.as_str(),
                next_seq + offset as i64,
                record.source_id(),
                record_json,
                stored_at,
            ],
        )
        .with_context(|| format!("failed to insert {} record for run {run_id}", stage.as_str()))?;
    }

    tx.execute(
        "UPDATE runs SET updated_at = ?2 WHERE run_id = ?1",
        params![run_id, stored_at],
    )?;
    tx.commit()?;
    Ok(())
}

fn load_records(connection: &Connection, run_id: &str, stage: Stage) -> Result<Vec<AnalysisRecord>> {
    let mut statement = connection.prepare(
        "
        SELECT record_id, record_json, stored_at
        FROM stage_records
        WHERE run_id = ?1 AND stage = ?2
        ORDER BY seq ASC
        ",
    )?;

    let mut rows = statement.query(params![run_id, stage.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let record_id: String = row.get(0)?;
        let record_json: String = row.get(1)?;
        let stored_at: String = row.get(2)?;

        let parsed: serde_json::Value = serde_json::from_str(&record_json)
            .with_context(|| format!("stored record {record_id} is not valid json"))?;
        let mut fields = match LooseValue::from(parsed) {
            LooseValue::Map(fields) => fields,
            _ => BTreeMap::new(),
        };
        fields.insert("run_id".to_string(), LooseValue::Text(run_id.to_string()));
        fields.insert("record_id".to_string(), loose_uuid(&record_id));
        fields.insert("stored_at".to_string(), loose_timestamp(stored_at));

        let clean = sanitize(LooseValue::Map(fields));
        let record = match serde_json::from_value::<AnalysisRecord>(clean.clone()) {
            Ok(record) => record,
            Err(_) => match clean {
                serde_json::Value::Object(map) => AnalysisRecord::from_object(map),
                _ => AnalysisRecord::default(),
            },
        };
        out.push(record);
    }

    Ok(out)
}

fn loose_uuid(raw: &str) -> LooseValue {
    Uuid::parse_str(raw).map_or_else(|_| LooseValue::Text(raw.to_string()), LooseValue::Uuid)
}

fn loose_timestamp(raw: String) -> LooseValue {
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(ts) => LooseValue::Timestamp(ts.with_timezone(&Utc)),
        Err(_) => LooseValue::Text(raw),
    }
}

#[derive(Debug, Default)]
struct StoredCounts {
    chapter: i64,
    group: i64,
    book: i64,
}

fn load_counts(connection: &Connection, run_id: &str) -> Result<StoredCounts> {
    let mut statement = connection.prepare(
        "SELECT stage, COUNT(*) FROM stage_records WHERE run_id = ?1 GROUP BY stage",
    )?;
    let mut rows = statement.query([run_id])?;

    let mut counts = StoredCounts::default();
    while let Some(row) = rows.next()? {
        let stage: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        match Stage::parse(&stage) {
            Some(Stage::Chapter) => counts.chapter = count,
            Some(Stage::Group) => counts.group = count,
            Some(Stage::Book) => counts.book = count,
            None => warn!(run_id, stage, "ignoring records with unknown stage"),
        }
    }
    Ok(counts)
}

fn load_summary(connection: &Connection, run_id: &str) -> Result<Option<RunSummary>> {
    let header = connection
        .query_row(
            "SELECT title, status, created_at, updated_at FROM runs WHERE run_id = ?1",
            [run_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((title, status, created_at, updated_at)) = header else {
        return Ok(None);
    };
    let Some(status) = RunStatus::parse(&status) else {
        bail!("run {run_id} has unknown status {status}");
    };

    let counts = load_counts(connection, run_id)?;
    Ok(Some(RunSummary {
        run_id: run_id.to_string(),
        title,
        status,
        created_at,
        updated_at,
        chapter_count: counts.chapter,
        group_count: counts.group,
        book_count: counts.book,
    }))
}

impl RunStore for SqliteRunStore {
    fn is_available(&self) -> bool {
        self.connection.is_some()
    }

    fn create_run(&self, run: &NewRun) -> Option<String> {
        let run_id = Uuid::new_v4().to_string();
        self.with_connection("create_run", &run_id, |connection| {
            let now = now_utc_string();
            connection.execute(
                "
                INSERT INTO runs(run_id, title, source_path, source_sha256, source_bytes, status, created_at, updated_at)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                ",
                params![
                    run_id,
                    run.title,
                    run.source_path,
                    run.source_sha256,
                    run.source_bytes as i64,
                    RunStatus::Pending.as_str(),
                    now,
                ],
            )?;
            Ok(run_id.clone())
        })
    }

    fn get_run(&self, run_id: &str) -> Option<RunState> {
        self.with_connection("get_run", run_id, |connection| {
            let header = connection
                .query_row(
                    "
                    SELECT title, source_path, source_sha256, status, created_at, updated_at
                    FROM runs
                    WHERE run_id = ?1
                    ",
                    [run_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;

            let Some((title, source_path, source_sha256, status, created_at, updated_at)) = header
            else {
                return Ok(None);
            };
            let Some(status) = RunStatus::parse(&status) else {
                bail!("run {run_id} has unknown status {status}");
            };

            let stage_results = StageResults {
                chapter: load_records(connection, run_id, Stage::Chapter)?,
                group: load_records(connection, run_id, Stage::Group)?,
                book: load_records(connection, run_id, Stage::Book)?.into_iter().next(),
            };

            Ok(Some(RunState {
                run_id: run_id.to_string(),
                status,
                title,
                source_path,
                source_sha256,
                created_at,
                updated_at,
                stage_results,
            }))
        })
        .flatten()
    }

    fn update_run_status(&self, run_id: &str, status: RunStatus) -> bool {
        self.with_connection("update_run_status", run_id, |connection| {
            let tx = connection.transaction()?;
            let Some(current) = load_status(&tx, run_id)? else {
                bail!("run {run_id} does not exist");
            };
            if !current.can_advance_to(status) {
                bail!(
                    "refusing status change {} -> {}",
                    current.as_str(),
                    status.as_str()
                );
            }

            tx.execute(
                "UPDATE runs SET status = ?2, updated_at = ?3 WHERE run_id = ?1",
                params![run_id, status.as_str(), now_utc_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .is_some()
    }

    fn append_stage_results(&self, run_id: &str, stage: Stage, records: &[AnalysisRecord]) -> bool {
        self.with_connection("append_stage_results", run_id, |connection| {
            if stage == Stage::Book {
                bail!("book results are stored with set_book_result");
            }
            insert_records(connection, run_id, stage, records)
        })
        .is_some()
    }

    fn set_book_result(&self, run_id: &str, record: &AnalysisRecord) -> bool {
        self.with_connection("set_book_result", run_id, |connection| {
            insert_records(connection, run_id, Stage::Book, std::slice::from_ref(record))
        })
        .is_some()
    }

    fn get_stage_results(&self, run_id: &str, stage: Stage) -> Option<StageOutput> {
        self.with_connection("get_stage_results", run_id, |connection| {
            if load_status(connection, run_id)?.is_none() {
                return Ok(None);
            }
            let records = load_records(connection, run_id, stage)?;
            Ok(Some(match stage {
                Stage::Book => StageOutput::Book(records.into_iter().next()),
                Stage::Chapter | Stage::Group => StageOutput::Records(records),
            }))
        })
        .flatten()
    }

    fn run_summary(&self, run_id: &str) -> Option<RunSummary> {
        self.with_connection("run_summary", run_id, |connection| load_summary(connection, run_id))
            .flatten()
    }

    fn list_runs(&self) -> Option<Vec<RunSummary>> {
        self.with_connection("list_runs", "*", |connection| {
            let mut statement =
                connection.prepare("SELECT run_id FROM runs ORDER BY created_at DESC, rowid DESC")?;
            let run_ids = statement
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut out = Vec::with_capacity(run_ids.len());
            for run_id in run_ids {
                match load_summary(connection, &run_id) {
                    Ok(Some(summary)) => out.push(summary),
                    Ok(None) => {}
                    Err(err) => warn!(run_id, error = %err, "skipping unreadable run"),
                }
            }
            Ok(out)
        })
    }

    fn delete_run(&self, run_id: &str) -> bool {
        self.with_connection("delete_run", run_id, |connection| {
            let deleted = connection.execute("DELETE FROM runs WHERE run_id = ?1", [run_id])?;
            if deleted == 0 {
                bail!("run {run_id} does not exist");
            }
            info!(run_id, "run deleted");
            Ok(())
        })
        .is_some()
    }
}
