use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use tokio::sync::Mutex;

use crate::engine::models::{
    InstanceHandle, RepoRef, Run, RunFilter, RunId, RunStats, RunStatus,
};

/// Durable record of runs. Credentials are never part of a [`Run`].
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace the run atomically. A stored terminal status is
    /// final: saves that would change it are ignored.
    async fn save_run(&self, run: &Run) -> Result<()>;
    async fn load_run(&self, id: RunId) -> Result<Option<Run>>;
    /// Newest first.
    async fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<Run>>;
    async fn stats(&self) -> Result<RunStats>;
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

    /// Run a closure with the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct RunDb {
    conn: Connection,
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

const RUN_COLUMNS: &str = "id, channel, task, repo_url, repo_ref, status, instance, task_id, \
     workspace_path, created_at, started_at, finished_at, summary, error, message_ref, cancel_requested";

const ACTIVE_STATUSES: &str = "('queued', 'planning', 'awaiting_approval', 'running')";

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                task TEXT NOT NULL,
                repo_url TEXT NOT NULL,
                repo_ref TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                instance TEXT,
                task_id TEXT,
                workspace_path TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                summary TEXT,
                error TEXT,
                message_ref TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_channel ON runs(channel);
            CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
            ",
        )?;
        Ok(())
    }

    pub fn upsert_run(&self, run: &Run) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let changed = tx.execute(
            "INSERT INTO runs (id, channel, task, repo_url, repo_ref, status, instance, task_id,
                               workspace_path, created_at, started_at, finished_at, summary, error,
                               message_ref, cancel_requested, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                instance = excluded.instance,
                task_id = excluded.task_id,
                workspace_path = excluded.workspace_path,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                summary = excluded.summary,
                error = excluded.error,
                message_ref = excluded.message_ref,
                cancel_requested = excluded.cancel_requested,
                updated_at = excluded.updated_at
             WHERE runs.status NOT IN ('succeeded', 'failed', 'cancelled')
                OR runs.status = excluded.status",
            params![
                run.id.to_string(),
                run.channel,
                run.task,
                run.repo.url,
                run.repo.reference,
                run.status.as_str(),
                run.instance.as_ref().map(|i| i.as_str().to_string()),
                run.task_id,
                run.workspace_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                ts(&run.created_at),
                run.started_at.as_ref().map(ts),
                run.finished_at.as_ref().map(ts),
                run.summary,
                run.error,
                run.message_ref,
                run.cancel_requested,
            ],
        )
        .context("Failed to upsert run")?;
        tx.commit().context("Failed to commit run")?;
        if changed == 0 {
            tracing::warn!(run_id = %run.id, status = %run.status, "Ignored save over a finished run");
        }
        Ok(())
    }

    pub fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare get_run")?;
        let mut rows = stmt
            .query_map(params![id.to_string()], RunRow::from_row)
            .context("Failed to query run")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read run row")?.into_run()?)),
            None => Ok(None),
        }
    }

    pub fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<Run>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(channel) = &filter.channel {
            values.push(Value::Text(channel.clone()));
            clauses.push(format!("channel = ?{}", values.len()));
        }
        if filter.active_only {
            clauses.push(format!("status IN {}", ACTIVE_STATUSES));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(Value::Integer(limit.min(i64::MAX as usize) as i64));
        let sql = format!(
            "SELECT {} FROM runs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{}",
            RUN_COLUMNS,
            where_clause,
            values.len()
        );

        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    pub fn stats(&self) -> Result<RunStats> {
        let sql = format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status IN {} THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'succeeded' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0)
             FROM runs",
            ACTIVE_STATUSES
        );
        self.conn
            .query_row(&sql, [], |row| {
                Ok(RunStats {
                    total: row.get::<_, i64>(0)? as u64,
                    active: row.get::<_, i64>(1)? as u64,
                    succeeded: row.get::<_, i64>(2)? as u64,
                    failed: row.get::<_, i64>(3)? as u64,
                    cancelled: row.get::<_, i64>(4)? as u64,
                })
            })
            .context("Failed to compute run stats")
    }
}

/// Intermediate row struct for reading runs before converting types.
struct RunRow {
    id: String,
    channel: String,
    task: String,
    repo_url: String,
    repo_ref: String,
    status: String,
    instance: Option<String>,
    task_id: Option<String>,
    workspace_path: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    summary: Option<String>,
    error: Option<String>,
    message_ref: Option<String>,
    cancel_requested: bool,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            channel: row.get(1)?,
            task: row.get(2)?,
            repo_url: row.get(3)?,
            repo_ref: row.get(4)?,
            status: row.get(5)?,
            instance: row.get(6)?,
            task_id: row.get(7)?,
            workspace_path: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            finished_at: row.get(11)?,
            summary: row.get(12)?,
            error: row.get(13)?,
            message_ref: row.get(14)?,
            cancel_requested: row.get(15)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run status")?;
        Ok(Run {
            id: RunId::parse_str(&self.id).context("Invalid run id")?,
            channel: self.channel,
            task: self.task,
            repo: RepoRef::new(self.repo_url, self.repo_ref),
            status,
            instance: self.instance.map(InstanceHandle),
            task_id: self.task_id,
            workspace_path: self.workspace_path.map(PathBuf::from),
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_ts).transpose()?,
            summary: self.summary,
            error: self.error,
            message_ref: self.message_ref,
            cancel_requested: self.cancel_requested,
        })
    }
}

pub struct SqliteRunStore {
    db: DbHandle,
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: DbHandle::new(RunDb::new(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: DbHandle::new(RunDb::new_in_memory()?),
        })
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        let run = run.clone();
        self.db.call(move |db| db.upsert_run(&run)).await
    }

    async fn load_run(&self, id: RunId) -> Result<Option<Run>> {
        self.db.call(move |db| db.get_run(id)).await
    }

    async fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<Run>> {
        let filter = filter.clone();
        self.db.call(move |db| db.list_runs(&filter, limit)).await
    }

    async fn stats(&self) -> Result<RunStats> {
        self.db.call(|db| db.stats()).await
    }
}

/// Process-local store for dry runs and tests.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<RunId, Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.lock().await;
        if let Some(stored) = runs.get(&run.id)
            && stored.status.is_terminal()
            && stored.status != run.status
        {
            tracing::warn!(run_id = %run.id, status = %run.status, "Ignored save over a finished run");
            return Ok(());
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.runs.lock().await.get(&id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<Run>> {
        let runs = self.runs.lock().await;
        let mut matching: Vec<Run> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn stats(&self) -> Result<RunStats> {
        let runs = self.runs.lock().await;
        let mut stats = RunStats {
            total: runs.len() as u64,
            ..RunStats::default()
        };
        for run in runs.values() {
            match run.status {
                RunStatus::Succeeded => stats.succeeded += 1,
                RunStatus::Failed => stats.failed += 1,
                RunStatus::Cancelled => stats.cancelled += 1,
                _ => stats.active += 1,
            }
        }
        Ok(stats)
    }
}
