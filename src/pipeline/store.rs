use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::models::{PipelineRun, RunStatus, StageResult};
use crate::errors::StoreError;

/// Persistence for pipeline runs. The single source of truth for run state.
///
/// `save` is a compare-and-swap on `version`: it succeeds only when the
/// stored version equals `run.version`, and returns the run as written
/// (version bumped, `updated_at` refreshed).
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert(&self, run: &PipelineRun) -> Result<(), StoreError>;

    async fn load(&self, run_id: &str) -> Result<Option<PipelineRun>, StoreError>;

    async fn save(&self, run: &PipelineRun) -> Result<PipelineRun, StoreError>;

    /// All runs, newest first.
    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError>;

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<PipelineRun>, StoreError>;
}

/// Async-safe handle to the run database.
///
/// All access runs on tokio's blocking pool via `spawn_blocking` so SQLite
/// I/O never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&RunDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| StoreError::Unavailable(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(anyhow::Error::new(e).context("DB task panicked")))?
    }
}

#[async_trait]
impl RunStore for DbHandle {
    async fn insert(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let run = run.clone();
        self.call(move |db| db.insert_run(&run)).await
    }

    async fn load(&self, run_id: &str) -> Result<Option<PipelineRun>, StoreError> {
        let run_id = run_id.to_string();
        self.call(move |db| db.get_run(&run_id)).await
    }

    async fn save(&self, run: &PipelineRun) -> Result<PipelineRun, StoreError> {
        let run = run.clone();
        self.call(move |db| db.save_run(&run)).await
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError> {
        self.call(|db| db.list_runs(None)).await
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<PipelineRun>, StoreError> {
        self.call(move |db| db.list_runs(Some(status))).await
    }
}

fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |e| StoreError::Unavailable(anyhow::Error::new(e).context(context))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(format!("unserializable value: {}", e)))
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("bad {} column: {}", column, e)))
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad {} timestamp '{}': {}", column, raw, e)))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

/// Raw `pipeline_runs` row before decoding.
struct RunRow {
    run_id: String,
    original_prompt: String,
    current_stage: String,
    overall_status: String,
    config: String,
    attempt: u32,
    active: Option<String>,
    rollbacks: u32,
    version: i64,
    created_at: String,
    updated_at: String,
}

/// Raw `stage_results` row before decoding.
struct ResultRow {
    stage: String,
    status: String,
    attempt: u32,
    output: Option<String>,
    error: Option<String>,
    failure: Option<String>,
    started_at: String,
    finished_at: String,
}

impl ResultRow {
    fn decode(self) -> Result<StageResult, StoreError> {
        Ok(StageResult {
            stage: parse_enum(&self.stage)?,
            status: parse_enum(&self.status)?,
            attempt: self.attempt,
            output: self.output.as_deref().map(|o| from_json("output", o)).transpose()?,
            error: self.error,
            failure: self.failure.as_deref().map(|f| from_json("failure", f)).transpose()?,
            started_at: parse_time("started_at", &self.started_at)?,
            finished_at: parse_time("finished_at", &self.finished_at)?,
        })
    }
}

const RUN_COLUMNS: &str = "run_id, original_prompt, current_stage, overall_status, config, \
     attempt, active, rollbacks, version, created_at, updated_at";

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        original_prompt: row.get(1)?,
        current_stage: row.get(2)?,
        overall_status: row.get(3)?,
        config: row.get(4)?,
        attempt: row.get(5)?,
        active: row.get(6)?,
        rollbacks: row.get(7)?,
        version: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    run_id TEXT PRIMARY KEY,
                    original_prompt TEXT NOT NULL,
                    current_stage TEXT NOT NULL,
                    overall_status TEXT NOT NULL,
                    config TEXT NOT NULL,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    active TEXT,
                    rollbacks INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stage_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES pipeline_runs(run_id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    stage TEXT NOT NULL,
                    status TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    output TEXT,
                    error TEXT,
                    failure TEXT,
                    started_at TEXT NOT NULL,
                    finished_at TEXT NOT NULL,
                    UNIQUE(run_id, seq)
                );

                CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(overall_status);
                CREATE INDEX IF NOT EXISTS idx_stage_results_run ON stage_results(run_id, seq);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn insert_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Failed to begin transaction"))?;
        tx.execute(
            &format!("INSERT INTO pipeline_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)", RUN_COLUMNS),
            params![
                run.run_id,
                run.original_prompt,
                run.current_stage.as_str(),
                run.overall_status.as_str(),
                to_json(&run.config)?,
                run.attempt,
                run.active.as_ref().map(to_json).transpose()?,
                run.rollbacks,
                run.version as i64,
                format_time(&run.created_at),
                format_time(&run.updated_at),
            ],
        )
        .map_err(db_err("Failed to insert run"))?;
        Self::append_results(&tx, &run.run_id, &run.history, 0)?;
        tx.commit().map_err(db_err("Failed to commit run insert"))?;
        Ok(())
    }

    /// Compare-and-swap write of a run's transition.
    ///
    /// History is append-only: rows already stored are never rewritten, only
    /// entries past the stored length are inserted.
    pub fn save_run(&self, run: &PipelineRun) -> Result<PipelineRun, StoreError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(db_err("Failed to begin transaction"))?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT version FROM pipeline_runs WHERE run_id = ?1",
                params![run.run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to read run version"))?;
        let Some(stored) = stored else {
            return Err(StoreError::NotFound(run.run_id.clone()));
        };
        if stored as u64 != run.version {
            return Err(StoreError::VersionConflict {
                run_id: run.run_id.clone(),
                expected: run.version,
                found: stored as u64,
            });
        }

        let stored_len: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM stage_results WHERE run_id = ?1",
                params![run.run_id],
                |row| row.get(0),
            )
            .map_err(db_err("Failed to count stage results"))?;
        let stored_len = stored_len as usize;
        if stored_len > run.history.len() {
            return Err(StoreError::Corrupt(format!(
                "run {} history shrank from {} to {} entries",
                run.run_id,
                stored_len,
                run.history.len()
            )));
        }

        let mut written = run.clone();
        written.version = run.version + 1;
        written.updated_at = Utc::now();

        tx.execute(
            "UPDATE pipeline_runs SET current_stage = ?1, overall_status = ?2, config = ?3,
                 attempt = ?4, active = ?5, rollbacks = ?6, version = ?7, updated_at = ?8
             WHERE run_id = ?9",
            params![
                written.current_stage.as_str(),
                written.overall_status.as_str(),
                to_json(&written.config)?,
                written.attempt,
                written.active.as_ref().map(to_json).transpose()?,
                written.rollbacks,
                written.version as i64,
                format_time(&written.updated_at),
                written.run_id,
            ],
        )
        .map_err(db_err("Failed to update run"))?;
        Self::append_results(&tx, &run.run_id, &run.history[stored_len..], stored_len)?;
        tx.commit().map_err(db_err("Failed to commit run update"))?;
        Ok(written)
    }

    fn append_results(
        conn: &Connection,
        run_id: &str,
        results: &[StageResult],
        first_seq: usize,
    ) -> Result<(), StoreError> {
        let mut stmt = conn
            .prepare(
                "INSERT INTO stage_results
                    (run_id, seq, stage, status, attempt, output, error, failure, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .map_err(db_err("Failed to prepare stage result insert"))?;
        for (offset, result) in results.iter().enumerate() {
            stmt.execute(params![
                run_id,
                (first_seq + offset) as i64,
                result.stage.as_str(),
                result.status.as_str(),
                result.attempt,
                result.output.as_ref().map(to_json).transpose()?,
                result.error,
                result.failure.as_ref().map(to_json).transpose()?,
                format_time(&result.started_at),
                format_time(&result.finished_at),
            ])
            .map_err(db_err("Failed to insert stage result"))?;
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM pipeline_runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                read_run_row,
            )
            .optional()
            .map_err(db_err("Failed to query run"))?;
        row.map(|row| self.decode_run(row)).transpose()
    }

    pub fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<PipelineRun>, StoreError> {
        let rows = {
            let mut stmt = self
                .conn
                .prepare(&format!(
                    "SELECT {} FROM pipeline_runs
                     WHERE ?1 IS NULL OR overall_status = ?1
                     ORDER BY created_at DESC, run_id",
                    RUN_COLUMNS
                ))
                .map_err(db_err("Failed to prepare list_runs"))?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], read_run_row)
                .map_err(db_err("Failed to query runs"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Failed to read run row"))?
        };
        rows.into_iter().map(|row| self.decode_run(row)).collect()
    }

    fn load_history(&self, run_id: &str) -> Result<Vec<StageResult>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT stage, status, attempt, output, error, failure, started_at, finished_at
                 FROM stage_results WHERE run_id = ?1 ORDER BY seq",
            )
            .map_err(db_err("Failed to prepare load_history"))?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(ResultRow {
                    stage: row.get(0)?,
                    status: row.get(1)?,
                    attempt: row.get(2)?,
                    output: row.get(3)?,
                    error: row.get(4)?,
                    failure: row.get(5)?,
                    started_at: row.get(6)?,
                    finished_at: row.get(7)?,
                })
            })
            .map_err(db_err("Failed to query stage results"))?;
        let mut history = Vec::new();
        for row in rows {
            history.push(row.map_err(db_err("Failed to read stage result row"))?.decode()?);
        }
        Ok(history)
    }

    fn decode_run(&self, row: RunRow) -> Result<PipelineRun, StoreError> {
        let history = self.load_history(&row.run_id)?;
        Ok(PipelineRun {
            current_stage: parse_enum(&row.current_stage)?,
            overall_status: parse_enum(&row.overall_status)?,
            config: from_json("config", &row.config)?,
            active: row.active.as_deref().map(|a| from_json("active", a)).transpose()?,
            version: row.version as u64,
            created_at: parse_time("created_at", &row.created_at)?,
            updated_at: parse_time("updated_at", &row.updated_at)?,
            run_id: row.run_id,
            original_prompt: row.original_prompt,
            attempt: row.attempt,
            rollbacks: row.rollbacks,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::models::{ActiveAttempt, FailureKind, StageName, StageStatus};
    use serde_json::json;

    fn attempt(stage: StageName, n: u32) -> ActiveAttempt {
        ActiveAttempt {
            stage,
            attempt: n,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> anyhow::Result<()> {
        let db = RunDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('pipeline_runs', 'stage_results')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 2);
        Ok(())
    }

    #[test]
    fn test_insert_and_get_roundtrip() -> anyhow::Result<()> {
        let db = RunDb::new_in_memory()?;
        let mut run = PipelineRun::new("Build a todo app", PipelineConfig::default());
        run.record(StageResult::failed(
            &attempt(StageName::PrdGeneration, 1),
            FailureKind::Execution,
            "rate limited",
        ));
        run.record(StageResult::succeeded(
            &attempt(StageName::PrdGeneration, 2),
            json!({"prd": "# Todo"}),
        ));
        run.active = Some(attempt(StageName::TaskDecomposition, 1));
        db.insert_run(&run)?;

        let loaded = db.get_run(&run.run_id)?.expect("run should exist");
        assert_eq!(loaded, run);
        assert!(db.get_run("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_save_bumps_version_and_appends_history() -> anyhow::Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = PipelineRun::new("x", PipelineConfig::default());
        db.insert_run(&run)?;

        let mut next = run.clone();
        next.record(StageResult::succeeded(&attempt(StageName::PrdGeneration, 1), json!({"prd": "p"})));
        next.enter_stage(StageName::TaskDecomposition);
        let saved = db.save_run(&next)?;
        assert_eq!(saved.version, 1);
        assert!(saved.updated_at >= run.updated_at);

        let loaded = db.get_run(&run.run_id)?.unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.current_stage, StageName::TaskDecomposition);
        assert_eq!(loaded.history.len(), 1);
        Ok(())
    }

    #[test]
    fn test_save_rejects_stale_version() -> anyhow::Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = PipelineRun::new("x", PipelineConfig::default());
        db.insert_run(&run)?;
        db.save_run(&run)?;

        let err = db.save_run(&run).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 0, found: 1, .. }
        ));
        Ok(())
    }

    #[test]
    fn test_save_unknown_run_is_not_found() -> anyhow::Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = PipelineRun::new("x", PipelineConfig::default());
        assert!(matches!(db.save_run(&run), Err(StoreError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_save_refuses_to_shrink_history() -> anyhow::Result<()> {
        let db = RunDb::new_in_memory()?;
        let mut run = PipelineRun::new("x", PipelineConfig::default());
        run.record(StageResult::succeeded(&attempt(StageName::PrdGeneration, 1), json!({})));
        db.insert_run(&run)?;

        run.history.clear();
        assert!(matches!(db.save_run(&run), Err(StoreError::Corrupt(_))));
        Ok(())
    }

    #[test]
    fn test_list_runs_filters_by_status() -> anyhow::Result<()> {
        let db = RunDb::new_in_memory()?;
        let running = PipelineRun::new("a", PipelineConfig::default());
        let mut paused = PipelineRun::new("b", PipelineConfig::default());
        paused.overall_status = RunStatus::Paused;
        db.insert_run(&running)?;
        db.insert_run(&paused)?;

        assert_eq!(db.list_runs(None)?.len(), 2);
        let only_paused = db.list_runs(Some(RunStatus::Paused))?;
        assert_eq!(only_paused.len(), 1);
        assert_eq!(only_paused[0].run_id, paused.run_id);
        Ok(())
    }

    #[test]
    fn test_corrupt_row_is_reported() -> anyhow::Result<()> {
        let db = RunDb::new_in_memory()?;
        let run = PipelineRun::new("x", PipelineConfig::default());
        db.insert_run(&run)?;
        db.conn.execute(
            "UPDATE pipeline_runs SET current_stage = 'compile' WHERE run_id = ?1",
            params![run.run_id],
        )?;
        assert!(matches!(db.get_run(&run.run_id), Err(StoreError::Corrupt(_))));
        Ok(())
    }

    #[test]
    fn test_new_creates_parent_directories() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("nested").join("runs.db");
        let db = RunDb::new(&path)?;
        db.insert_run(&PipelineRun::new("x", PipelineConfig::default()))?;
        drop(db);

        let reopened = RunDb::new(&path)?;
        assert_eq!(reopened.list_runs(None)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_implements_store() {
        let store = DbHandle::new(RunDb::new_in_memory().unwrap());
        let run = PipelineRun::new("Build a todo app", PipelineConfig::default());
        store.insert(&run).await.unwrap();

        let mut next = store.load(&run.run_id).await.unwrap().unwrap();
        next.record(StageResult::awaiting_approval(&attempt(StageName::Review, 1), json!({})));
        next.overall_status = RunStatus::Paused;
        store.save(&next).await.unwrap();

        let paused = store.list_by_status(RunStatus::Paused).await.unwrap();
        assert_eq!(paused.len(), 1);
        assert_eq!(paused[0].history[0].status, StageStatus::AwaitingApproval);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
