use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use entraflow_core::error::{EntraflowError, Result};
use entraflow_core::traits::StateStore;
use entraflow_core::types::{RunId, RunSummary, WorkflowRun};

/// A serialized run, ready to be written.
struct SnapshotRow {
    run_id: String,
    workflow: String,
    status: String,
    snapshot: String,
    created_at: String,
    updated_at: String,
}

impl SnapshotRow {
    fn from_run(run: &WorkflowRun) -> Result<Self> {
        Ok(Self {
            run_id: run.run_id.to_string(),
            workflow: run.definition.name.clone(),
            status: run.status.to_string(),
            snapshot: serde_json::to_string(run)?,
            created_at: run.created_at.to_rfc3339(),
            updated_at: run.updated_at.to_rfc3339(),
        })
    }
}

/// Persistent run store backed by SQLite. One row per run, holding the full
/// JSON snapshot.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EntraflowError::Database(format!("Failed to create state directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EntraflowError::Database(format!("Failed to open state store: {}", e)))?;
        Self::init(conn)
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EntraflowError::Database(format!("Failed to open state store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS workflow_runs (
                 run_id TEXT PRIMARY KEY,
                 workflow TEXT NOT NULL,
                 status TEXT NOT NULL,
                 snapshot TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_runs_created
                 ON workflow_runs(created_at DESC);",
        )
        .map_err(|e| EntraflowError::Database(format!("Failed to initialize state schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upsert(&self, row: &SnapshotRow) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EntraflowError::Persistence(e.to_string()))?;
        conn.execute(
            "INSERT INTO workflow_runs (run_id, workflow, status, snapshot, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id) DO UPDATE SET
                 workflow = excluded.workflow,
                 status = excluded.status,
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at",
            params![
                row.run_id,
                row.workflow,
                row.status,
                row.snapshot,
                row.created_at,
                row.updated_at,
            ],
        )
        .map_err(|e| EntraflowError::Persistence(format!("Failed to save run: {}", e)))?;
        Ok(())
    }

    fn load_snapshot(&self, run_id: &RunId) -> Result<WorkflowRun> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EntraflowError::Persistence(e.to_string()))?;
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM workflow_runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EntraflowError::Database(format!("Failed to load run: {}", e)))?;

        let snapshot = snapshot.ok_or_else(|| EntraflowError::RunNotFound(run_id.to_string()))?;
        Ok(serde_json::from_str(&snapshot)?)
    }

    fn summaries(&self) -> Result<Vec<RunSummary>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EntraflowError::Persistence(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, snapshot FROM workflow_runs
                 ORDER BY created_at DESC, rowid DESC",
            )
            .map_err(|e| EntraflowError::Database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| EntraflowError::Database(format!("Failed to list runs: {}", e)))?;

        let mut summaries = Vec::new();
        for row in rows {
            let (run_id, snapshot) =
                row.map_err(|e| EntraflowError::Database(format!("Failed to read row: {}", e)))?;
            match serde_json::from_str::<WorkflowRun>(&snapshot) {
                Ok(run) => summaries.push(run.summary()),
                Err(e) => warn!(run_id = %run_id, error = %e, "Skipping unreadable run snapshot"),
            }
        }
        Ok(summaries)
    }
}

impl StateStore for SqliteStateStore {
    fn save(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>> {
        let row = SnapshotRow::from_run(run);
        Box::pin(async move { self.upsert(&row?) })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<WorkflowRun>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.load_snapshot(&run_id) })
    }

    fn list_runs(&self) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move { self.summaries() })
    }
}

/// Process-local run store. Snapshots still go through JSON, so a run loaded
/// from here looks exactly like one loaded from SQLite.
#[derive(Default)]
pub struct MemoryStateStore {
    runs: Mutex<HashMap<RunId, String>>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, run_id: RunId, snapshot: String) -> Result<()> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|e| EntraflowError::Persistence(e.to_string()))?;
        runs.insert(run_id, snapshot);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, run_id: &RunId) -> Result<WorkflowRun> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| EntraflowError::Persistence(e.to_string()))?;
        let snapshot = runs
            .get(run_id)
            .ok_or_else(|| EntraflowError::RunNotFound(run_id.to_string()))?;
        Ok(serde_json::from_str(snapshot)?)
    }

    fn summaries(&self) -> Result<Vec<RunSummary>> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| EntraflowError::Persistence(e.to_string()))?;
        let mut summaries = runs
            .values()
            .map(|s| serde_json::from_str::<WorkflowRun>(s).map(|r| r.summary()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, run: &WorkflowRun) -> BoxFuture<'_, Result<()>> {
        let run_id = run.run_id.clone();
        let snapshot = serde_json::to_string(run);
        Box::pin(async move { self.insert(run_id, snapshot?) })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<WorkflowRun>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.get(&run_id) })
    }

    fn list_runs(&self) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        Box::pin(async move { self.summaries() })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use entraflow_core::payload::Payload;
    use entraflow_core::types::{NodeStatus, RunStatus};
    use entraflow_core::workflow::{NodeSpec, WorkflowDefinition};

    fn sample_run(name: &str) -> WorkflowRun {
        let def = WorkflowDefinition::new(name)
            .node(NodeSpec::new("fetch", "constant"))
            .node(NodeSpec::new("report", "passthrough").depends_on(&["fetch"]));
        let mut inputs = HashMap::new();
        inputs.insert("location".to_string(), json!("Nairobi"));
        let mut run = WorkflowRun::new(Arc::new(def), inputs);
        let fetch = run.nodes.get_mut("fetch").unwrap();
        fetch.status = NodeStatus::Succeeded;
        fetch.attempts = 2;
        fetch.result = Some(Payload::new(json!({"temp": 24.5})));
        run
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::open(&dir.path().join("state.db")).unwrap();
        let run = sample_run("briefing");

        store.save(&run).await.unwrap();
        let loaded = store.load(&run.run_id).await.unwrap();
        assert_eq!(loaded, run);
    }

    #[tokio::test]
    async fn test_sqlite_upsert_keeps_one_row() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let mut run = sample_run("briefing");
        store.save(&run).await.unwrap();

        run.status = RunStatus::Completed;
        run.nodes.get_mut("report").unwrap().status = NodeStatus::Succeeded;
        store.save(&run).await.unwrap();

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].succeeded, 2);
    }

    #[tokio::test]
    async fn test_sqlite_not_found() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let err = store.load(&RunId::from_string("missing")).await.unwrap_err();
        assert!(matches!(err, EntraflowError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_sqlite_list_newest_first() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let mut older = sample_run("first");
        older.created_at = older.created_at - Duration::hours(1);
        let newer = sample_run("second");
        store.save(&older).await.unwrap();
        store.save(&newer).await.unwrap();

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs[0].workflow, "second");
        assert_eq!(runs[1].workflow, "first");
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let run = sample_run("briefing");
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.save(&run).await.unwrap();
        }
        let store = SqliteStateStore::open(&path).unwrap();
        assert_eq!(store.load(&run.run_id).await.unwrap(), run);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert!(store.is_empty());
        let run = sample_run("briefing");
        store.save(&run).await.unwrap();
        store.save(&run).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load(&run.run_id).await.unwrap(), run);
        assert!(matches!(
            store.load(&RunId::new()).await,
            Err(EntraflowError::RunNotFound(_))
        ));
    }
}
