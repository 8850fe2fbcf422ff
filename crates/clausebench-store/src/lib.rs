use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use clausebench_types::{RunSummary, SampleEvaluation, Trace};

/// SQLite checkpoint store: one row per evaluated sample, plus the final summary per run.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub complete: bool,
    pub samples: usize,
}

impl Store {
    /// Open (or create) a store at the given path, e.g. "clausebench.db".
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .with_context(|| format!("Failed to open store {:?}", path))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                name TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                config TEXT,
                complete BOOLEAN NOT NULL DEFAULT 0,
                summary TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS samples (
                run TEXT NOT NULL,
                sample_id TEXT NOT NULL,
                classification TEXT NOT NULL,
                evaluation TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY(run, sample_id),
                FOREIGN KEY(run) REFERENCES runs(name)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS traces (
                id INTEGER PRIMARY KEY,
                run TEXT NOT NULL,
                sample_id TEXT NOT NULL,
                specialist TEXT,
                model TEXT,
                attempt INTEGER NOT NULL,
                duration_ms INTEGER,
                tokens_in INTEGER,
                tokens_out INTEGER,
                error TEXT,
                trace TEXT NOT NULL,
                FOREIGN KEY(run, sample_id) REFERENCES samples(run, sample_id)
            )",
            [],
        )?;

        Ok(())
    }

    /// Register a run. Returns false when it already exists; its stored config is kept.
    pub fn begin_run(&self, name: &str, config: &serde_json::Value) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO runs (name, created_at, config) VALUES (?1, ?2, ?3)",
            params![name, Utc::now().to_rfc3339(), config.to_string()],
        )?;
        debug!(run = name, created = inserted > 0, "run registered");
        Ok(inserted > 0)
    }

    /// Persist one sample and its traces atomically. A sample already recorded
    /// for this run is left untouched and `false` is returned.
    pub fn record_sample(&self, run: &str, evaluation: &SampleEvaluation, traces: &[Trace]) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO samples (run, sample_id, classification, evaluation, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run,
                evaluation.id,
                evaluation.classification.as_str(),
                serde_json::to_string(evaluation)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        for trace in traces {
            tx.execute(
                "INSERT INTO traces (run, sample_id, specialist, model, attempt, duration_ms, tokens_in, tokens_out, error, trace)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run,
                    evaluation.id,
                    trace.specialist,
                    trace.model,
                    trace.attempt,
                    trace.duration_ms.map(|ms| ms as i64),
                    trace.usage.as_ref().map(|u| u.input_tokens),
                    trace.usage.as_ref().map(|u| u.output_tokens),
                    trace.error,
                    serde_json::to_string(trace)?
                ],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Every sample recorded for `run`, in recording order, with its traces.
    pub fn completed_samples(&self, run: &str) -> Result<Vec<(SampleEvaluation, Vec<Trace>)>> {
        let conn = self.conn()?;

        let mut traces: HashMap<String, Vec<Trace>> = HashMap::new();
        let mut stmt = conn.prepare("SELECT sample_id, trace FROM traces WHERE run = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![run], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (sample_id, json) = row?;
            let trace: Trace = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt trace for sample '{sample_id}'"))?;
            traces.entry(sample_id).or_default().push(trace);
        }

        let mut stmt = conn.prepare("SELECT sample_id, evaluation FROM samples WHERE run = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![run], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (sample_id, json) = row?;
            let evaluation: SampleEvaluation = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt evaluation for sample '{sample_id}'"))?;
            let sample_traces = traces.remove(&sample_id).unwrap_or_default();
            out.push((evaluation, sample_traces));
        }
        Ok(out)
    }

    /// Store the final summary and mark the run as complete when it is.
    pub fn save_summary(&self, summary: &RunSummary) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (name, created_at, config, complete, summary) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET complete = excluded.complete, summary = excluded.summary",
            params![
                summary.name,
                summary.created_at.to_rfc3339(),
                summary.config.to_string(),
                summary.complete,
                serde_json::to_string(summary)?
            ],
        )?;
        Ok(())
    }

    pub fn load_summary(&self, run: &str) -> Result<Option<RunSummary>> {
        let conn = self.conn()?;
        let json: Option<Option<String>> = conn
            .query_row("SELECT summary FROM runs WHERE name = ?1", params![run], |row| row.get(0))
            .optional()?;
        match json.flatten() {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).with_context(|| format!("Corrupt summary for run '{run}'"))?,
            )),
            None => Ok(None),
        }
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.name, r.created_at, r.complete, COUNT(s.sample_id)
             FROM runs r LEFT JOIN samples s ON s.run = r.name
             GROUP BY r.name ORDER BY r.created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (name, created_at, complete, samples) = row?;
            runs.push(RunRecord {
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .with_context(|| format!("Bad timestamp for run '{name}'"))?
                    .with_timezone(&Utc),
                name,
                complete,
                samples: samples as usize,
            });
        }
        Ok(runs)
    }
}

/// Write a summary as pretty JSON. The file is replaced atomically so readers
/// never observe a partial document.
pub fn save_summary_json(path: impl AsRef<Path>, summary: &RunSummary) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(summary)?)
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move summary into {:?}", path))?;
    Ok(())
}

pub fn load_summary_json(path: impl AsRef<Path>) -> Result<RunSummary> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid run summary {:?}", path))
}
