use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::models::*;

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads. Because every write goes through this one
/// mutex, read-modify-write sequences on a run's step array cannot interleave
/// with each other.
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
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests only; never call from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, RunDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    script_path TEXT,
                    target_url TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    last_run TEXT,
                    duration REAL,
                    last_result TEXT
                );

                CREATE TABLE IF NOT EXISTS steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    duration REAL NOT NULL DEFAULT 0,
                    error TEXT,
                    screenshot_url TEXT,
                    UNIQUE(run_id, position)
                );

                CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id, position);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Run CRUD ──────────────────────────────────────────────────────

    /// Create a run with its fixed step template. The step rows double as the
    /// template: names are immutable after this point, and the list is never
    /// resized while the run executes.
    pub fn create_run(
        &self,
        name: &str,
        script_path: Option<&str>,
        target_url: Option<&str>,
        template_steps: &[String],
    ) -> Result<Run> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO runs (name, script_path, target_url) VALUES (?1, ?2, ?3)",
            params![name, script_path, target_url],
        )
        .context("Failed to insert run")?;
        let run_id = tx.last_insert_rowid();
        for (position, step_name) in template_steps.iter().enumerate() {
            tx.execute(
                "INSERT INTO steps (run_id, position, name) VALUES (?1, ?2, ?3)",
                params![run_id, position as i64, step_name],
            )
            .context("Failed to insert template step")?;
        }
        tx.commit().context("Failed to commit run creation")?;
        self.get_run(run_id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, script_path, target_url, status, created_at, last_run, duration, last_result
                 FROM runs WHERE id = ?1",
            )
            .context("Failed to prepare get_run")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    script_path: row.get(2)?,
                    target_url: row.get(3)?,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                    last_run: row.get(6)?,
                    duration: row.get(7)?,
                    last_result: row.get(8)?,
                })
            })
            .context("Failed to query run")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read run row")?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_runs(&self) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, script_path, target_url, status, created_at, last_run, duration, last_result
                 FROM runs ORDER BY id",
            )
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    script_path: row.get(2)?,
                    target_url: row.get(3)?,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                    last_run: row.get(6)?,
                    duration: row.get(7)?,
                    last_result: row.get(8)?,
                })
            })
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read run row")?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    pub fn get_run_detail(&self, id: i64) -> Result<Option<RunDetail>> {
        let run = match self.get_run(id)? {
            Some(run) => run,
            None => return Ok(None),
        };
        let steps = self.get_steps(id)?;
        Ok(Some(RunDetail { run, steps }))
    }

    // ── Step access ───────────────────────────────────────────────────

    pub fn get_steps(&self, run_id: i64) -> Result<Vec<Step>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, status, duration, error, screenshot_url
                 FROM steps WHERE run_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare get_steps")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StepRow {
                    name: row.get(0)?,
                    status: row.get(1)?,
                    duration: row.get(2)?,
                    error: row.get(3)?,
                    screenshot_url: row.get(4)?,
                })
            })
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            let r = row.context("Failed to read step row")?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }

    pub fn step_count(&self, run_id: i64) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM steps WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to count steps")?;
        Ok(count as usize)
    }

    /// Reset every step slot to Pending and mark the run InProgress. Returns
    /// false without touching anything if the run is already InProgress, so
    /// only one execution at a time can claim a run. The whole check-and-set
    /// runs under the connection mutex, making the claim atomic.
    pub fn begin_execution(&self, run_id: i64) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let claimed = tx
            .execute(
                "UPDATE runs SET status = 'in_progress', last_run = datetime('now'),
                     duration = NULL, last_result = NULL
                 WHERE id = ?1 AND status != 'in_progress'",
                params![run_id],
            )
            .context("Failed to mark run in progress")?;
        if claimed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE steps SET status = 'pending', duration = 0, error = NULL, screenshot_url = NULL
             WHERE run_id = ?1",
            params![run_id],
        )
        .context("Failed to reset steps")?;
        tx.commit().context("Failed to commit execution start")?;
        Ok(true)
    }

    /// Write a step outcome into the slot at `position`. Returns false if no
    /// such slot exists (the caller treats that as an out-of-bounds no-op).
    pub fn record_step_result(
        &self,
        run_id: i64,
        position: usize,
        status: StepStatus,
        duration: f64,
        error: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE steps SET status = ?1, duration = ?2, error = ?3
                 WHERE run_id = ?4 AND position = ?5",
                params![status.as_str(), duration, error, run_id, position as i64],
            )
            .context("Failed to record step result")?;
        Ok(changed > 0)
    }

    /// Attach a screenshot reference to the slot at `position`. Returns false
    /// if no such slot exists.
    pub fn attach_screenshot(&self, run_id: i64, position: usize, url: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE steps SET screenshot_url = ?1 WHERE run_id = ?2 AND position = ?3",
                params![url, run_id, position as i64],
            )
            .context("Failed to attach screenshot")?;
        Ok(changed > 0)
    }

    /// Record the final status of an execution.
    pub fn finalize_run(
        &self,
        run_id: i64,
        status: &RunStatus,
        duration: Option<f64>,
        last_result: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = ?1,
                     duration = COALESCE(?2, duration),
                     last_result = COALESCE(?3, last_result)
                 WHERE id = ?4",
                params![status.as_str(), duration, last_result, run_id],
            )
            .context("Failed to finalize run")?;
        Ok(())
    }
}

// ── Row structs ───────────────────────────────────────────────────────

struct RunRow {
    id: i64,
    name: String,
    script_path: Option<String>,
    target_url: Option<String>,
    status: String,
    created_at: String,
    last_run: Option<String>,
    duration: Option<f64>,
    last_result: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            name: self.name,
            script_path: self.script_path,
            target_url: self.target_url,
            status: RunStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
            last_run: self.last_run,
            duration: self.duration,
            last_result: self.last_result,
        })
    }
}

struct StepRow {
    name: String,
    status: String,
    duration: f64,
    error: Option<String>,
    screenshot_url: Option<String>,
}

impl StepRow {
    fn into_step(self) -> Result<Step> {
        Ok(Step {
            name: self.name,
            status: StepStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            duration: self.duration,
            error: self.error,
            screenshot_url: self.screenshot_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> RunDb {
        RunDb::new_in_memory().unwrap()
    }

    fn template() -> Vec<String> {
        vec![
            "Open page".to_string(),
            "Fill form".to_string(),
            "Submit".to_string(),
        ]
    }

    #[test]
    fn test_create_run_populates_template_steps() {
        let db = test_db();
        let run = db
            .create_run("smoke", Some("smoke.spec.js"), Some("http://localhost"), &template())
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        let steps = db.get_steps(run.id).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].name, "Open page");
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_begin_execution_resets_state() {
        let db = test_db();
        let run = db.create_run("smoke", Some("s.js"), None, &template()).unwrap();
        db.record_step_result(run.id, 0, StepStatus::Failed, 12.0, Some("old"))
            .unwrap();
        db.finalize_run(run.id, &RunStatus::Failed, Some(99.0), Some("boom"))
            .unwrap();

        assert!(db.begin_execution(run.id).unwrap());
        let run = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(run.last_run.is_some());
        assert!(run.duration.is_none());
        assert!(run.last_result.is_none());
        let steps = db.get_steps(run.id).unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(steps[0].error.is_none());
    }

    #[test]
    fn test_begin_execution_refuses_while_in_progress() {
        let db = test_db();
        let run = db.create_run("smoke", Some("s.js"), None, &template()).unwrap();
        assert!(db.begin_execution(run.id).unwrap());
        // A second claim while the run executes must not reset anything
        db.record_step_result(run.id, 0, StepStatus::Passed, 10.0, None)
            .unwrap();
        assert!(!db.begin_execution(run.id).unwrap());
        let steps = db.get_steps(run.id).unwrap();
        assert_eq!(steps[0].status, StepStatus::Passed);
        // Once finalized the run can be claimed again
        db.finalize_run(run.id, &RunStatus::Completed, Some(10.0), None)
            .unwrap();
        assert!(db.begin_execution(run.id).unwrap());
    }

    #[test]
    fn test_record_step_result_in_bounds() {
        let db = test_db();
        let run = db.create_run("smoke", Some("s.js"), None, &template()).unwrap();
        let wrote = db
            .record_step_result(run.id, 1, StepStatus::Passed, 250.5, None)
            .unwrap();
        assert!(wrote);
        let steps = db.get_steps(run.id).unwrap();
        assert_eq!(steps[1].status, StepStatus::Passed);
        assert_eq!(steps[1].duration, 250.5);
        assert_eq!(steps[0].status, StepStatus::Pending);
    }

    #[test]
    fn test_record_step_result_out_of_bounds_is_noop() {
        let db = test_db();
        let run = db.create_run("smoke", Some("s.js"), None, &template()).unwrap();
        let wrote = db
            .record_step_result(run.id, 5, StepStatus::Passed, 1.0, None)
            .unwrap();
        assert!(!wrote);
        let steps = db.get_steps(run.id).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_attach_screenshot_bounds() {
        let db = test_db();
        let run = db.create_run("smoke", Some("s.js"), None, &template()).unwrap();
        assert!(db.attach_screenshot(run.id, 2, "/api/artifacts/1-0.png").unwrap());
        assert!(!db.attach_screenshot(run.id, 9, "/api/artifacts/1-1.png").unwrap());
        let steps = db.get_steps(run.id).unwrap();
        assert_eq!(
            steps[2].screenshot_url.as_deref(),
            Some("/api/artifacts/1-0.png")
        );
    }

    #[test]
    fn test_finalize_run() {
        let db = test_db();
        let run = db.create_run("smoke", Some("s.js"), None, &template()).unwrap();
        assert!(db.begin_execution(run.id).unwrap());
        db.finalize_run(run.id, &RunStatus::Failed, Some(1234.0), Some("boom"))
            .unwrap();
        let run = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.duration, Some(1234.0));
        assert_eq!(run.last_result.as_deref(), Some("boom"));
    }

    #[test]
    fn test_finalize_preserves_existing_result_when_none() {
        let db = test_db();
        let run = db.create_run("smoke", Some("s.js"), None, &template()).unwrap();
        db.finalize_run(run.id, &RunStatus::Failed, None, Some("first"))
            .unwrap();
        db.finalize_run(run.id, &RunStatus::Failed, Some(5.0), None)
            .unwrap();
        let run = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(run.last_result.as_deref(), Some("first"));
        assert_eq!(run.duration, Some(5.0));
    }

    #[test]
    fn test_get_run_detail() {
        let db = test_db();
        let run = db.create_run("smoke", Some("s.js"), None, &template()).unwrap();
        let detail = db.get_run_detail(run.id).unwrap().unwrap();
        assert_eq!(detail.run.id, run.id);
        assert_eq!(detail.steps.len(), 3);
        assert!(db.get_run_detail(999).unwrap().is_none());
    }

    #[test]
    fn test_list_runs_ordered() {
        let db = test_db();
        db.create_run("a", None, None, &[]).unwrap();
        db.create_run("b", None, None, &[]).unwrap();
        let runs = db.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].name, "a");
        assert_eq!(runs[1].name, "b");
    }
}
