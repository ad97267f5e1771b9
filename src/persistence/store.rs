//! The relational store of §3/§4.4: runs, screens, steps, visits, journal.
//!
//! A single SQLite file per run. All writes are idempotent on retry via
//! unique constraints on `(run_id, composite_hash)` and `(run_id,
//! step_number)`. Every call hands the blocking rusqlite work to
//! `spawn_blocking` so the crawl loop's async task never stalls on disk I/O.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking task panicked: {0}")]
    TaskPanic(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Interrupted => "INTERRUPTED",
            RunStatus::Failed => "FAILED",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "COMPLETED" => RunStatus::Completed,
            "INTERRUPTED" => RunStatus::Interrupted,
            "FAILED" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// One row of `steps_log`, as returned by the history/context queries.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: i64,
    pub run_id: i64,
    pub step_number: i64,
    pub from_screen_id: Option<i64>,
    pub to_screen_id: Option<i64>,
    pub action_desc: String,
    pub execution_success: bool,
    pub error_message: Option<String>,
}

/// Everything CrawlLoop knows about a step at insert time.
#[derive(Debug, Clone, Default)]
pub struct StepToInsert {
    pub run_id: i64,
    pub step_number: i64,
    pub from_screen_id: Option<i64>,
    pub to_screen_id: Option<i64>,
    pub action_desc: String,
    pub raw_suggestion: Option<String>,
    pub normalized_action: Option<String>,
    pub execution_success: bool,
    pub error_message: Option<String>,
    pub llm_response_ms: Option<i64>,
    pub total_tokens: Option<i64>,
    pub llm_prompt: Option<String>,
    pub element_find_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct VisitedScreenSummary {
    pub screen_id: i64,
    pub activity: String,
    pub visit_count: i64,
}

#[derive(Clone)]
pub struct PersistenceStore {
    conn: Arc<Mutex<Connection>>,
}

impl PersistenceStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema_sync()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema_sync()?;
        Ok(store)
    }

    fn ensure_schema_sync(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_package TEXT NOT NULL,
                app_entry TEXT,
                start_time TEXT NOT NULL,
                end_time TEXT,
                status TEXT NOT NULL,
                stats_json TEXT,
                provider TEXT,
                model TEXT
            );
            CREATE TABLE IF NOT EXISTS screens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id),
                composite_hash TEXT NOT NULL,
                activity TEXT NOT NULL,
                screenshot_path TEXT,
                xml_path TEXT,
                ocr_path TEXT,
                first_seen_step INTEGER NOT NULL,
                UNIQUE(run_id, composite_hash)
            );
            CREATE TABLE IF NOT EXISTS visits (
                run_id INTEGER NOT NULL REFERENCES runs(id),
                screen_id INTEGER NOT NULL REFERENCES screens(id),
                visit_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (run_id, screen_id)
            );
            CREATE TABLE IF NOT EXISTS steps_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id),
                step_number INTEGER NOT NULL,
                from_screen_id INTEGER,
                to_screen_id INTEGER,
                action_desc TEXT NOT NULL,
                raw_suggestion TEXT,
                normalized_action TEXT,
                execution_success INTEGER NOT NULL,
                error_message TEXT,
                llm_response_ms INTEGER,
                total_tokens INTEGER,
                llm_prompt TEXT,
                element_find_ms INTEGER,
                UNIQUE(run_id, step_number)
            );
            CREATE TABLE IF NOT EXISTS journal (
                run_id INTEGER PRIMARY KEY REFERENCES runs(id),
                text TEXT NOT NULL DEFAULT ''
            );
            ",
        )?;
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::TaskPanic(e.to_string()))?
    }

    pub async fn get_or_create_run(&self, app_package: &str, app_entry: Option<&str>) -> StoreResult<i64> {
        let app_package = app_package.to_string();
        let app_entry = app_entry.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO runs (app_package, app_entry, start_time, status) VALUES (?1, ?2, ?3, ?4)",
                params![app_package, app_entry, now, RunStatus::Running.as_str()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn update_run_status(&self, run_id: i64, status: RunStatus, set_end_time: bool) -> StoreResult<()> {
        self.with_conn(move |conn| {
            if set_end_time {
                let now = Utc::now().to_rfc3339();
                conn.execute(
                    "UPDATE runs SET status = ?1, end_time = ?2 WHERE id = ?3",
                    params![status.as_str(), now, run_id],
                )?;
            } else {
                conn.execute(
                    "UPDATE runs SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), run_id],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn update_run_meta(&self, run_id: i64, stats_json: &str) -> StoreResult<()> {
        let stats_json = stats_json.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE runs SET stats_json = ?1 WHERE id = ?2",
                params![stats_json, run_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_run_status(&self, run_id: i64) -> StoreResult<Option<RunStatus>> {
        self.with_conn(move |conn| {
            let status: Option<String> = conn
                .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id], |r| r.get(0))
                .optional()?;
            Ok(status.map(|s| RunStatus::from_str(&s)))
        })
        .await
    }

    /// Upserts a screen row; returns `(screen_id, was_new)`.
    pub async fn upsert_screen(
        &self,
        run_id: i64,
        composite_hash: &str,
        activity: &str,
        screenshot_path: Option<&str>,
        xml_path: Option<&str>,
        ocr_path: Option<&str>,
        first_seen_step: i64,
    ) -> StoreResult<(i64, bool)> {
        let composite_hash = composite_hash.to_string();
        let activity = activity.to_string();
        let screenshot_path = screenshot_path.map(|s| s.to_string());
        let xml_path = xml_path.map(|s| s.to_string());
        let ocr_path = ocr_path.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM screens WHERE run_id = ?1 AND composite_hash = ?2",
                    params![run_id, composite_hash],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok((id, false));
            }
            conn.execute(
                "INSERT INTO screens (run_id, composite_hash, activity, screenshot_path, xml_path, ocr_path, first_seen_step)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![run_id, composite_hash, activity, screenshot_path, xml_path, ocr_path, first_seen_step],
            )?;
            Ok((conn.last_insert_rowid(), true))
        })
        .await
    }

    /// Increments the per-run visit counter for a screen; returns the new count.
    pub async fn increment_visit(&self, run_id: i64, screen_id: i64) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO visits (run_id, screen_id, visit_count) VALUES (?1, ?2, 1)
                 ON CONFLICT(run_id, screen_id) DO UPDATE SET visit_count = visit_count + 1",
                params![run_id, screen_id],
            )?;
            conn.query_row(
                "SELECT visit_count FROM visits WHERE run_id = ?1 AND screen_id = ?2",
                params![run_id, screen_id],
                |r| r.get(0),
            )
        })
        .await
    }

    pub async fn get_visit_count(&self, run_id: i64, screen_id: i64) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT visit_count FROM visits WHERE run_id = ?1 AND screen_id = ?2",
                    params![run_id, screen_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_step(&self, step: StepToInsert) -> StoreResult<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO steps_log (
                    run_id, step_number, from_screen_id, to_screen_id, action_desc,
                    raw_suggestion, normalized_action, execution_success, error_message,
                    llm_response_ms, total_tokens, llm_prompt, element_find_ms
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                params![
                    step.run_id,
                    step.step_number,
                    step.from_screen_id,
                    step.to_screen_id,
                    step.action_desc,
                    step.raw_suggestion,
                    step.normalized_action,
                    step.execution_success as i64,
                    step.error_message,
                    step.llm_response_ms,
                    step.total_tokens,
                    step.llm_prompt,
                    step.element_find_ms,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_recent_steps_with_details(&self, run_id: i64, limit: i64) -> StoreResult<Vec<StepRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, step_number, from_screen_id, to_screen_id, action_desc,
                        execution_success, error_message
                 FROM steps_log WHERE run_id = ?1
                 ORDER BY step_number DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![run_id, limit], |r| {
                Ok(StepRecord {
                    id: r.get(0)?,
                    run_id: r.get(1)?,
                    step_number: r.get(2)?,
                    from_screen_id: r.get(3)?,
                    to_screen_id: r.get(4)?,
                    action_desc: r.get(5)?,
                    execution_success: r.get::<_, i64>(6)? != 0,
                    error_message: r.get(7)?,
                })
            })?;
            let mut out: Vec<StepRecord> = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            out.reverse(); // most-recent last
            Ok(out)
        })
        .await
    }

    pub async fn get_visited_screens_summary(&self, run_id: i64) -> StoreResult<Vec<VisitedScreenSummary>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.activity, v.visit_count
                 FROM screens s JOIN visits v ON v.screen_id = s.id AND v.run_id = s.run_id
                 WHERE s.run_id = ?1
                 ORDER BY s.id ASC",
            )?;
            let rows = stmt.query_map(params![run_id], |r| {
                Ok(VisitedScreenSummary {
                    screen_id: r.get(0)?,
                    activity: r.get(1)?,
                    visit_count: r.get(2)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    pub async fn get_actions_for_screen_with_details(&self, screen_id: i64, run_id: i64) -> StoreResult<Vec<StepRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, step_number, from_screen_id, to_screen_id, action_desc,
                        execution_success, error_message
                 FROM steps_log WHERE run_id = ?1 AND from_screen_id = ?2
                 ORDER BY step_number ASC",
            )?;
            let rows = stmt.query_map(params![run_id, screen_id], |r| {
                Ok(StepRecord {
                    id: r.get(0)?,
                    run_id: r.get(1)?,
                    step_number: r.get(2)?,
                    from_screen_id: r.get(3)?,
                    to_screen_id: r.get(4)?,
                    action_desc: r.get(5)?,
                    execution_success: r.get::<_, i64>(6)? != 0,
                    error_message: r.get(7)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    pub async fn get_exploration_journal(&self, run_id: i64) -> StoreResult<String> {
        self.with_conn(move |conn| {
            let text: Option<String> = conn
                .query_row("SELECT text FROM journal WHERE run_id = ?1", params![run_id], |r| r.get(0))
                .optional()?;
            Ok(text.unwrap_or_default())
        })
        .await
    }

    pub async fn update_exploration_journal(&self, run_id: i64, text: &str) -> StoreResult<()> {
        let text = text.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO journal (run_id, text) VALUES (?1, ?2)
                 ON CONFLICT(run_id) DO UPDATE SET text = excluded.text",
                params![run_id, text],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_run_assigns_incrementing_ids() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let r1 = store.get_or_create_run("com.example", Some(".MainActivity")).await.unwrap();
        let r2 = store.get_or_create_run("com.example", Some(".MainActivity")).await.unwrap();
        assert_eq!(r1, 1);
        assert_eq!(r2, 2); // each call creates a fresh run, matching §4.4's "run id (auto)"
    }

    #[tokio::test]
    async fn upsert_screen_is_idempotent() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example", None).await.unwrap();
        let (id1, new1) = store.upsert_screen(run_id, "hash1", "MainActivity", None, None, None, 1).await.unwrap();
        assert!(new1);
        let (id2, new2) = store.upsert_screen(run_id, "hash1", "MainActivity", None, None, None, 2).await.unwrap();
        assert_eq!(id1, id2);
        assert!(!new2);
    }

    #[tokio::test]
    async fn increment_visit_counts_up() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example", None).await.unwrap();
        let (screen_id, _) = store.upsert_screen(run_id, "h1", "Main", None, None, None, 1).await.unwrap();
        let c1 = store.increment_visit(run_id, screen_id).await.unwrap();
        let c2 = store.increment_visit(run_id, screen_id).await.unwrap();
        assert_eq!(c1, 1);
        assert_eq!(c2, 2);
    }

    #[tokio::test]
    async fn step_numbers_unique_per_run() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example", None).await.unwrap();
        let step = StepToInsert {
            run_id,
            step_number: 1,
            action_desc: "tap login".into(),
            execution_success: true,
            ..Default::default()
        };
        store.insert_step(step.clone()).await.unwrap();
        let err = store.insert_step(step).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn journal_upserts() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example", None).await.unwrap();
        assert_eq!(store.get_exploration_journal(run_id).await.unwrap(), "");
        store.update_exploration_journal(run_id, "explored login").await.unwrap();
        store.update_exploration_journal(run_id, "explored login then settings").await.unwrap();
        assert_eq!(
            store.get_exploration_journal(run_id).await.unwrap(),
            "explored login then settings"
        );
    }

    #[tokio::test]
    async fn recent_steps_ordered_most_recent_last() {
        let store = PersistenceStore::open_in_memory().unwrap();
        let run_id = store.get_or_create_run("com.example", None).await.unwrap();
        for n in 1..=3 {
            store
                .insert_step(StepToInsert {
                    run_id,
                    step_number: n,
                    action_desc: format!("step {n}"),
                    execution_success: true,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let recent = store.get_recent_steps_with_details(run_id, 20).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().step_number, 3);
    }
}
