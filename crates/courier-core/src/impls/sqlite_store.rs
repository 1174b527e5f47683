//! SQLite-backed task store.
//!
//! Several dispatcher processes may open the same database file. Claims stay
//! exclusive because each claim is one conditional `UPDATE`, which SQLite
//! runs under its write lock; the per-task claim uses an IMMEDIATE
//! transaction for the same reason.
//!
//! rusqlite is blocking, so every call hops onto the blocking pool and the
//! connection sits behind a std mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use ulid::Ulid;

use crate::domain::ids::{Id, IdMarker};
use crate::domain::{Job, JobCounts, JobId, JobStatus, Payload, SendOutcome, Task, TaskId, TaskStatus};
use crate::error::StoreError;
use crate::ports::TaskStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'draft',
    total_count   INTEGER NOT NULL DEFAULT 0,
    sent_count    INTEGER NOT NULL DEFAULT 0,
    failed_count  INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    job_id          TEXT NOT NULL REFERENCES jobs(id),
    payload         TEXT NOT NULL,
    due_at          INTEGER NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    claimed_at      INTEGER,
    completed_at    INTEGER,
    failure_reason  TEXT,
    soft_deleted    INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (status, soft_deleted, due_at);
CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks (job_id, soft_deleted, status);
"#;

const TASK_COLUMNS: &str = "id, job_id, payload, due_at, status, claimed_at, completed_at, \
                            failure_reason, soft_deleted, created_at";

const JOB_COLUMNS: &str =
    "id, name, status, total_count, sent_count, failed_count, created_at, updated_at";

/// Durable `TaskStore`.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open or create the database file and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker: {e}")))?
    }
}

// ========================================
// Row mapping
// ========================================

fn id_text<T: IdMarker>(id: Id<T>) -> String {
    id.as_ulid().to_string()
}

fn parse_id<T: IdMarker>(raw: &str) -> Result<Id<T>, StoreError> {
    Ulid::from_string(raw)
        .map(Id::from_ulid)
        .map_err(|_| StoreError::Corrupt(format!("bad id {raw:?}")))
}

/// Timestamps are stored as epoch nanoseconds, so nothing is rounded away and
/// `due_at <= now` compares the same here as in memory.
// i64 ナノ秒なので 1677〜2262 年の外は TimestampOutOfRange
fn nanos(at: DateTime<Utc>) -> Result<i64, StoreError> {
    at.timestamp_nanos_opt()
        .ok_or(StoreError::TimestampOutOfRange(at))
}

fn opt_nanos(at: Option<DateTime<Utc>>) -> Result<Option<i64>, StoreError> {
    at.map(nanos).transpose()
}

fn from_nanos(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

struct TaskRow {
    id: String,
    job_id: String,
    payload: String,
    due_at: i64,
    status: String,
    claimed_at: Option<i64>,
    completed_at: Option<i64>,
    failure_reason: Option<String>,
    soft_deleted: bool,
    created_at: i64,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            payload: row.get(2)?,
            due_at: row.get(3)?,
            status: row.get(4)?,
            claimed_at: row.get(5)?,
            completed_at: row.get(6)?,
            failure_reason: row.get(7)?,
            soft_deleted: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let payload: Payload = serde_json::from_str(&row.payload)?;
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Task {
            id: parse_id(&row.id)?,
            job_id: parse_id(&row.job_id)?,
            payload,
            due_at: from_nanos(row.due_at),
            status,
            claimed_at: row.claimed_at.map(from_nanos),
            completed_at: row.completed_at.map(from_nanos),
            failure_reason: row.failure_reason,
            soft_deleted: row.soft_deleted,
            created_at: from_nanos(row.created_at),
        })
    }
}

struct JobRow {
    id: String,
    name: String,
    status: String,
    total: i64,
    sent: i64,
    failed: i64,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            total: row.get(3)?,
            sent: row.get(4)?,
            failed: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Job {
            id: parse_id(&row.id)?,
            name: row.name,
            status,
            counts: JobCounts {
                total: row.total as u64,
                sent: row.sent as u64,
                failed: row.failed as u64,
            },
            created_at: from_nanos(row.created_at),
            updated_at: from_nanos(row.updated_at),
        })
    }
}

fn select_task(conn: &Connection, task_id: TaskId) -> Result<Option<Task>, StoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    conn.query_row(&sql, params![id_text(task_id)], TaskRow::read)
        .optional()?
        .map(Task::try_from)
        .transpose()
}

// ========================================
// TaskStore
// ========================================

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn claim_next_due(&self, now: DateTime<Utc>) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE tasks SET status = 'processing', claimed_at = ?1
                 WHERE id = (
                     SELECT id FROM tasks
                     WHERE status = 'pending' AND soft_deleted = 0 AND due_at <= ?1
                     ORDER BY due_at ASC, id ASC
                     LIMIT 1
                 )
                 AND status = 'pending'
                 RETURNING {TASK_COLUMNS}"
            );
            let row = conn
                .query_row(&sql, params![nanos(now)?], TaskRow::read)
                .optional()?;
            let Some(row) = row else {
                return Ok(None);
            };
            // RETURNING yields the new row; the claim only changed these two.
            let mut snapshot = Task::try_from(row)?;
            snapshot.status = TaskStatus::Pending;
            snapshot.claimed_at = None;
            Ok(Some(snapshot))
        })
        .await
    }

    async fn claim_task(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(snapshot) = select_task(&tx, task_id)? else {
                return Ok(None);
            };
            let claimable = !snapshot.soft_deleted
                && matches!(snapshot.status, TaskStatus::Pending | TaskStatus::Failed);
            if !claimable {
                return Ok(None);
            }
            tx.execute(
                "UPDATE tasks SET status = 'processing', claimed_at = ?2 WHERE id = ?1",
                params![id_text(task_id), nanos(now)?],
            )?;
            tx.commit()?;
            Ok(Some(snapshot))
        })
        .await
    }

    async fn record_outcome(
        &self,
        task_id: TaskId,
        outcome: &SendOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let status = outcome.status();
        let reason = outcome.reason().map(str::to_string);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = ?2, completed_at = ?3, failure_reason = ?4
                 WHERE id = ?1 AND status = 'processing'",
                params![id_text(task_id), status.as_str(), nanos(at)?, reason],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn requeue_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'pending', claimed_at = NULL
                 WHERE status = 'processing' AND claimed_at < ?1",
                params![nanos(claimed_before)?],
            )?;
            Ok(changed as u64)
        })
        .await
    }

    async fn count_by_status(&self, job_id: JobId, status: TaskStatus) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE job_id = ?1 AND status = ?2 AND soft_deleted = 0",
                params![id_text(job_id), status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn count_all(&self, job_id: JobId) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 AND soft_deleted = 0",
                params![id_text(job_id)],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let job = job.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs
                   (id, name, status, total_count, sent_count, failed_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id_text(job.id),
                    job.name,
                    job.status.as_str(),
                    job.counts.total as i64,
                    job.counts.sent as i64,
                    job.counts.failed as i64,
                    nanos(job.created_at)?,
                    nanos(job.updated_at)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
            conn.query_row(&sql, params![id_text(job_id)], JobRow::read)
                .optional()?
                .map(Job::try_from)
                .transpose()
        })
        .await
    }

    async fn jobs_with_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; names.len()].join(", ");
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({placeholders}) ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(names.iter()), JobRow::read)?;
            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(Job::try_from(row?)?);
            }
            Ok(jobs)
        })
        .await
    }

    async fn write_job_counts(
        &self,
        job_id: JobId,
        counts: JobCounts,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET total_count = ?2, sent_count = ?3, failed_count = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    id_text(job_id),
                    counts.total as i64,
                    counts.sent as i64,
                    counts.failed as i64,
                    nanos(at)?,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::JobNotFound(job_id));
            }
            Ok(())
        })
        .await
    }

    async fn transition_job(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                params![id_text(job_id), from.as_str(), to.as_str(), nanos(at)?],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let tasks = tasks.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut job_exists = tx.prepare("SELECT 1 FROM jobs WHERE id = ?1")?;
                for task in &tasks {
                    if !job_exists.exists(params![id_text(task.job_id)])? {
                        return Err(StoreError::JobNotFound(task.job_id));
                    }
                }
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ))?;
                for task in &tasks {
                    stmt.execute(params![
                        id_text(task.id),
                        id_text(task.job_id),
                        serde_json::to_string(&task.payload)?,
                        nanos(task.due_at)?,
                        task.status.as_str(),
                        opt_nanos(task.claimed_at)?,
                        opt_nanos(task.completed_at)?,
                        task.failure_reason,
                        task.soft_deleted,
                        nanos(task.created_at)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        self.with_conn(move |conn| select_task(conn, task_id)).await
    }

    async fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE job_id = ?1 AND soft_deleted = 0
                 ORDER BY due_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![id_text(job_id)], TaskRow::read)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(Task::try_from(row?)?);
            }
            Ok(tasks)
        })
        .await
    }

    async fn soft_delete_task(&self, task_id: TaskId) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET soft_deleted = 1 WHERE id = ?1 AND soft_deleted = 0",
                params![id_text(task_id)],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::contract;

    fn store() -> SqliteTaskStore {
        SqliteTaskStore::open_in_memory().unwrap()
    }

    fn temp_db(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("courier-{name}-{}.db", Ulid::new()))
    }

    fn remove_db(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut p = path.as_os_str().to_owned();
            p.push(suffix);
            std::fs::remove_file(p).ok();
        }
    }

    #[tokio::test]
    async fn claims_oldest_due_first() {
        contract::claims_oldest_due_first(&store()).await;
    }

    #[tokio::test]
    async fn claim_skips_future_deleted_and_claimed() {
        contract::claim_skips_future_deleted_and_claimed(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_are_exclusive() {
        contract::concurrent_claims_are_exclusive(Arc::new(store())).await;
    }

    #[tokio::test]
    async fn outcome_only_lands_on_processing_tasks() {
        contract::outcome_only_lands_on_processing_tasks(&store()).await;
    }

    #[tokio::test]
    async fn counts_ignore_soft_deleted() {
        contract::counts_ignore_soft_deleted(&store()).await;
    }

    #[tokio::test]
    async fn claim_task_accepts_pending_and_failed_only() {
        contract::claim_task_accepts_pending_and_failed_only(&store()).await;
    }

    #[tokio::test]
    async fn requeue_stale_returns_old_claims_to_pending() {
        contract::requeue_stale_returns_old_claims_to_pending(&store()).await;
    }

    #[tokio::test]
    async fn job_transitions_are_conditional() {
        contract::job_transitions_are_conditional(&store()).await;
    }

    /// Two stores on one file behave like two dispatcher processes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_connections_never_double_claim() {
        let path = temp_db("claims");
        let a = SqliteTaskStore::open(&path).unwrap();
        let b = SqliteTaskStore::open(&path).unwrap();

        let t0 = contract::nine_am();
        let dues = vec![t0; 20];
        contract::seed_job(&a, &dues).await;

        let claim_all = |store: SqliteTaskStore| {
            tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(task) = store.claim_next_due(t0).await.unwrap() {
                    ids.push(task.id);
                }
                ids
            })
        };
        let (from_a, from_b) = (claim_all(a.clone()), claim_all(b.clone()));
        let from_a = from_a.await.unwrap();
        let from_b = from_b.await.unwrap();

        let mut all: Vec<TaskId> = from_a.iter().chain(from_b.iter()).copied().collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), from_a.len() + from_b.len());
        assert_eq!(all.len(), 20);

        drop((a, b));
        remove_db(&path);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let path = temp_db("reopen");
        let t0 = contract::nine_am();
        let (job_id, ids) = {
            let store = SqliteTaskStore::open(&path).unwrap();
            contract::seed_job(&store, &[t0]).await
        };

        let store = SqliteTaskStore::open(&path).unwrap();
        let task = store.get_task(ids[0]).await.unwrap().unwrap();
        assert_eq!(task.job_id, job_id);
        assert_eq!(task.due_at, t0);
        assert_eq!(task.payload.destination, "user0@example.com");
        assert!(store.get_job(job_id).await.unwrap().is_some());

        drop(store);
        remove_db(&path);
    }

    #[tokio::test]
    async fn tasks_for_unknown_job_are_rejected() {
        contract::tasks_for_unknown_job_are_rejected(&store()).await;
    }

    #[tokio::test]
    async fn timestamps_round_trip_exactly() {
        contract::timestamps_round_trip_exactly(&store()).await;
    }
}
